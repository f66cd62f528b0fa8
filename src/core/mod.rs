//! Dataset scanning: file naming, frame ranges and image headers.

pub mod frames;
pub mod header;
pub mod metadata;
pub mod template;

pub use frames::{FrameIndex, IndexError};
pub use header::{HeaderError, HeaderReader, ImageHeader, TiffHeaderReader};
pub use metadata::{FrameMetadataRow, MetadataError, MetadataTable};
pub use template::{NamingTemplate, PatternError};

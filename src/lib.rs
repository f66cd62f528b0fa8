//! Dataset setup for 3D time-lapse registration pipelines.
//!
//! This crate provides tools for:
//! - Inferring the naming template and frame range of a directory of volumes
//! - Reading image headers into a per-frame metadata table
//! - Excluding frames whose geometry deviates from the dataset median
//! - Writing a workspace with a parameters document wiring the preprocessing,
//!   rigid and non-linear stages together
//!
//! # Example
//!
//! ```no_run
//! use volume_pipeline::{core::TiffHeaderReader, processors::workspace, SetupConfig};
//!
//! let request = workspace::SetupRequest::new("data/embryo", "data/embryo_output");
//! let ws = workspace::setup(&request, &SetupConfig::default(), &TiffHeaderReader).unwrap();
//! println!("frames {}..={}", ws.frames.min(), ws.frames.max());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;

pub use config::SetupConfig;
pub use core::{FrameIndex, ImageHeader, NamingTemplate};
pub use processors::{PipelineConfig, Stage};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

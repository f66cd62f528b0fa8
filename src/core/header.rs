//! Image header probing.
//!
//! Setup only needs per-file geometry: dimension count, voxel counts along
//! X/Y/Z, channel count and voxel spacing. [`TiffHeaderReader`] reads these from
//! TIFF tags without decoding pixel data; anything else that can produce an
//! [`ImageHeader`] plugs in through [`HeaderReader`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tiff::decoder::ifd::Value;
use tiff::decoder::Decoder;
use tiff::tags::Tag;

/// Errors raised while reading an image header.
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read image header of '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },
}

/// Result type for header operations.
pub type Result<T> = std::result::Result<T, HeaderError>;

/// Geometry of one image file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageHeader {
    /// Number of spatial dimensions (2 or 3).
    pub dimensions: u32,
    /// Voxel counts along X, Y, Z.
    pub size: [u32; 3],
    /// Samples per voxel.
    pub channels: u32,
    /// Physical voxel size along X, Y, Z.
    pub spacing: [f64; 3],
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            dimensions: 3,
            size: [1, 1, 1],
            channels: 1,
            spacing: [1.0, 1.0, 1.0],
        }
    }
}

/// Reads image headers without decoding pixel data.
pub trait HeaderReader {
    /// Read the header of the image at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its header is invalid.
    fn read_header(&self, path: &Path) -> Result<ImageHeader>;
}

/// [`HeaderReader`] for single- and multi-page TIFF stacks.
///
/// - X/Y come from the first page
/// - Z is the ImageJ `slices=` entry when present, otherwise the page count
/// - in-plane spacing is the inverse of `XResolution`/`YResolution`
/// - Z spacing is the ImageJ `spacing=` entry
///
/// Spacing falls back to 1.0 wherever the file does not say.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffHeaderReader;

impl HeaderReader for TiffHeaderReader {
    fn read_header(&self, path: &Path) -> Result<ImageHeader> {
        let decode = |source| HeaderError::Decode {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(|source| HeaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut decoder = Decoder::new(BufReader::new(file)).map_err(decode)?;

        let (width, height) = decoder.dimensions().map_err(decode)?;
        let channels = match decoder.find_tag(Tag::SamplesPerPixel).map_err(decode)? {
            Some(value) => value.into_u32().map_err(decode)?,
            None => 1,
        };
        let spacing_x = resolution_to_spacing(decoder.find_tag(Tag::XResolution).map_err(decode)?);
        let spacing_y = resolution_to_spacing(decoder.find_tag(Tag::YResolution).map_err(decode)?);
        let description = match decoder.find_tag(Tag::ImageDescription).map_err(decode)? {
            Some(Value::Ascii(text)) => Some(text),
            _ => None,
        };

        let mut pages = 1u32;
        while decoder.more_images() {
            decoder.next_image().map_err(decode)?;
            pages += 1;
        }

        let imagej = description.as_deref().map(ImageJDescription::parse);
        let depth = imagej
            .as_ref()
            .and_then(|d| d.slices)
            .unwrap_or(pages)
            .max(1);
        let spacing_z = imagej.as_ref().and_then(|d| d.spacing).unwrap_or(1.0);

        let header = ImageHeader {
            dimensions: if depth > 1 { 3 } else { 2 },
            size: [width, height, depth],
            channels,
            spacing: [spacing_x, spacing_y, spacing_z],
        };
        log::debug!("{}: {:?}", path.display(), header);
        Ok(header)
    }
}

/// Pixels-per-unit resolution tag to physical spacing.
fn resolution_to_spacing(value: Option<Value>) -> f64 {
    let resolution = match value {
        Some(Value::Rational(num, den)) if den != 0 => f64::from(num) / f64::from(den),
        Some(Value::Float(v)) => f64::from(v),
        Some(Value::Double(v)) => v,
        Some(Value::Unsigned(v)) => f64::from(v),
        Some(Value::Short(v)) => f64::from(v),
        _ => 0.0,
    };
    if resolution > 0.0 {
        1.0 / resolution
    } else {
        1.0
    }
}

/// Fields of an ImageJ `ImageDescription` block (`key=value` per line).
#[derive(Debug, Default, Clone, PartialEq)]
struct ImageJDescription {
    slices: Option<u32>,
    spacing: Option<f64>,
}

impl ImageJDescription {
    fn parse(text: &str) -> Self {
        let mut parsed = Self::default();
        if !text.starts_with("ImageJ=") {
            return parsed;
        }
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "slices" => parsed.slices = value.trim().parse().ok(),
                "spacing" => parsed.spacing = value.trim().parse().ok().filter(|s: &f64| *s > 0.0),
                _ => {}
            }
        }
        parsed
    }
}

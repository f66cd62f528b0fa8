//! Per-file metadata table.
//!
//! One row per frame file, ordered by file name, persisted as `files.csv` next
//! to the parameters document. Each row also carries the frame index parsed
//! from its file name when the table is built; the quality filter reports
//! exclusions through that mapping, never through row positions.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::header::{HeaderError, HeaderReader, ImageHeader};
use super::template::NamingTemplate;

/// Column names of the persisted table, in order.
pub const COLUMNS: [&str; 10] = [
    "file",
    "dimensions",
    "X",
    "Y",
    "Z",
    "channels",
    "pixel_downsample",
    "spacing_X",
    "spacing_Y",
    "spacing_Z",
];

/// Errors raised while building, writing or reading a metadata table.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("failed to open metadata table '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in metadata table '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("metadata table '{path}' lacks columns: {}", .missing.join(", "))]
    ColumnMismatch { path: PathBuf, missing: Vec<String> },

    #[error("file '{file}' in metadata table does not match naming template '{template}'")]
    UnknownFrame { file: String, template: String },
}

/// Result type for metadata table operations.
pub type Result<T> = std::result::Result<T, MetadataError>;

/// One row of the metadata table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadataRow {
    pub file: String,
    pub dimensions: u32,
    #[serde(rename = "X")]
    pub size_x: u32,
    #[serde(rename = "Y")]
    pub size_y: u32,
    #[serde(rename = "Z")]
    pub size_z: u32,
    pub channels: u32,
    pub pixel_downsample: u32,
    #[serde(rename = "spacing_X")]
    pub spacing_x: f64,
    #[serde(rename = "spacing_Y")]
    pub spacing_y: f64,
    #[serde(rename = "spacing_Z")]
    pub spacing_z: f64,
    /// Frame index of `file`; not persisted.
    #[serde(skip)]
    pub frame: u32,
}

impl FrameMetadataRow {
    /// Build a row for `file` (full path as written to the table) from its header.
    pub fn from_header(file: impl Into<String>, frame: u32, header: &ImageHeader) -> Self {
        Self {
            file: file.into(),
            dimensions: header.dimensions,
            size_x: header.size[0],
            size_y: header.size[1],
            size_z: header.size[2],
            channels: header.channels,
            pixel_downsample: 1,
            spacing_x: header.spacing[0],
            spacing_y: header.spacing[1],
            spacing_z: header.spacing[2],
            frame,
        }
    }

    /// The header this row was built from.
    pub fn header(&self) -> ImageHeader {
        ImageHeader {
            dimensions: self.dimensions,
            size: [self.size_x, self.size_y, self.size_z],
            channels: self.channels,
            spacing: [self.spacing_x, self.spacing_y, self.spacing_z],
        }
    }

    /// Numeric cells in column order (every column but `file`).
    pub fn numeric_values(&self) -> [f64; 9] {
        [
            f64::from(self.dimensions),
            f64::from(self.size_x),
            f64::from(self.size_y),
            f64::from(self.size_z),
            f64::from(self.channels),
            f64::from(self.pixel_downsample),
            self.spacing_x,
            self.spacing_y,
            self.spacing_z,
        ]
    }
}

/// Metadata rows of one dataset directory, ordered by file name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataTable {
    rows: Vec<FrameMetadataRow>,
}

impl MetadataTable {
    /// Create a table from rows; rows are sorted by file name.
    pub fn from_rows(mut rows: Vec<FrameMetadataRow>) -> Self {
        rows.sort_by(|a, b| a.file.cmp(&b.file));
        Self { rows }
    }

    /// Probe every file in `filenames` under `dir` and build the table.
    ///
    /// # Errors
    ///
    /// Fails on the first unreadable header or on a name that does not match
    /// `template`.
    pub fn build<S: AsRef<str>>(
        dir: &Path,
        filenames: &[S],
        template: &NamingTemplate,
        reader: &dyn HeaderReader,
    ) -> Result<Self> {
        let mut names: Vec<&str> = filenames.iter().map(|n| n.as_ref()).collect();
        names.sort_unstable();

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let frame = template
                .parse_index(name)
                .ok_or_else(|| MetadataError::UnknownFrame {
                    file: name.to_string(),
                    template: template.placeholder(),
                })?;
            let path = dir.join(name);
            let header = reader.read_header(&path)?;
            rows.push(FrameMetadataRow::from_header(
                path.display().to_string(),
                frame,
                &header,
            ));
        }

        log::info!("Read metadata of {} files in {}", rows.len(), dir.display());
        Ok(Self::from_rows(rows))
    }

    pub fn rows(&self) -> &[FrameMetadataRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the table as CSV with the [`COLUMNS`] header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let csv_err = |source| MetadataError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let file = File::create(path).map_err(|source| MetadataError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));

        // Written explicitly so an empty table still carries its header.
        writer.write_record(COLUMNS).map_err(csv_err)?;
        for row in &self.rows {
            writer.serialize(row).map_err(csv_err)?;
        }
        writer.flush().map_err(|e| csv_err(e.into()))?;
        Ok(())
    }

    /// Read a table written by [`write_csv`](Self::write_csv).
    ///
    /// Frame indices are recovered by matching each file's name against
    /// `template`.
    ///
    /// # Errors
    ///
    /// - [`MetadataError::ColumnMismatch`] if any of [`COLUMNS`] is absent
    /// - [`MetadataError::UnknownFrame`] if a file name does not fit `template`
    pub fn read_csv(path: &Path, template: &NamingTemplate) -> Result<Self> {
        let csv_err = |source| MetadataError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(|source| MetadataError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(BufReader::new(file));

        let headers = reader.headers().map_err(csv_err)?.clone();
        let missing: Vec<String> = COLUMNS
            .iter()
            .filter(|column| !headers.iter().any(|h| h == **column))
            .map(|column| column.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(MetadataError::ColumnMismatch {
                path: path.to_path_buf(),
                missing,
            });
        }

        let mut rows = Vec::new();
        for record in reader.deserialize::<FrameMetadataRow>() {
            let mut row = record.map_err(csv_err)?;
            let name = Path::new(&row.file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            row.frame = template
                .parse_index(&name)
                .ok_or_else(|| MetadataError::UnknownFrame {
                    file: row.file.clone(),
                    template: template.placeholder(),
                })?;
            rows.push(row);
        }

        Ok(Self::from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    struct FixedReader(HashMap<String, ImageHeader>);

    impl HeaderReader for FixedReader {
        fn read_header(&self, path: &Path) -> crate::core::header::Result<ImageHeader> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            Ok(self.0.get(&name).copied().unwrap_or_default())
        }
    }

    fn template() -> NamingTemplate {
        NamingTemplate::new("img_", ".tif", 3)
    }

    fn header(z: u32) -> ImageHeader {
        ImageHeader {
            dimensions: 3,
            size: [64, 32, z],
            channels: 1,
            spacing: [0.5, 0.5, 2.0],
        }
    }

    #[test]
    fn test_build_orders_by_name_and_maps_frames() {
        let files = vec!["img_003.tif", "img_001.tif", "img_002.tif"];
        let reader = FixedReader(
            [("img_002.tif".to_string(), header(9))]
                .into_iter()
                .collect(),
        );

        let table = MetadataTable::build(Path::new("/data"), &files, &template(), &reader).unwrap();

        let frames: Vec<u32> = table.rows().iter().map(|r| r.frame).collect();
        assert_eq!(frames, vec![1, 2, 3]);
        assert_eq!(table.rows()[0].file, "/data/img_001.tif");
        assert_eq!(table.rows()[1].size_z, 9);
        assert_eq!(table.rows()[1].spacing_x, 0.5);
    }

    #[test]
    fn test_build_rejects_unknown_name() {
        let files = vec!["img_001.tif", "notes.txt"];
        let reader = FixedReader(HashMap::new());
        let err = MetadataTable::build(Path::new("/data"), &files, &template(), &reader).unwrap_err();
        assert!(matches!(err, MetadataError::UnknownFrame { .. }));
    }

    #[test]
    fn test_write_csv_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("files.csv");
        let table = MetadataTable::from_rows(vec![FrameMetadataRow::from_header(
            "/data/img_001.tif",
            1,
            &header(10),
        )]);

        table.write_csv(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "file,dimensions,X,Y,Z,channels,pixel_downsample,spacing_X,spacing_Y,spacing_Z"
        );
        assert_eq!(lines[1], "/data/img_001.tif,3,64,32,10,1,1,0.5,0.5,2.0");
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_write_then_read_restores_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("files.csv");
        let table = MetadataTable::from_rows(vec![
            FrameMetadataRow::from_header("/data/img_002.tif", 2, &header(10)),
            FrameMetadataRow::from_header("/data/img_005.tif", 5, &header(11)),
        ]);
        table.write_csv(&path).unwrap();

        let restored = MetadataTable::read_csv(&path, &template()).unwrap();
        assert_eq!(restored, table);
    }

    #[test]
    fn test_read_csv_missing_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("files.csv");
        fs::write(&path, "file,dimensions,X,Y\n/data/img_001.tif,3,4,4\n").unwrap();

        match MetadataTable::read_csv(&path, &template()).unwrap_err() {
            MetadataError::ColumnMismatch { missing, .. } => {
                assert_eq!(
                    missing,
                    vec![
                        "Z",
                        "channels",
                        "pixel_downsample",
                        "spacing_X",
                        "spacing_Y",
                        "spacing_Z"
                    ]
                );
            }
            other => panic!("Expected ColumnMismatch, got {:?}", other),
        }
    }
}

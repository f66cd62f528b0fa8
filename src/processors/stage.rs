//! Per-stage views of a parameters document.
//!
//! Stage runners never read the canonical document directly: they receive a
//! flat copy holding `image_info` merged with their own section, written to a
//! fresh temporary file. This module builds those copies, enumerates the frames
//! a stage will process and checks that its inputs exist.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

use super::parameters::{split_output_format, to_json_pretty, ImageInfo, PipelineConfig};
use crate::core::template::{NamingTemplate, PatternError};

/// Errors raised while preparing a stage invocation.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("unknown stage '{0}' (expected preprocessing, rigid or nonlinear)")]
    UnknownStage(String),

    #[error("stage '{0}' is disabled in this parameters document")]
    StageDisabled(Stage),

    #[error("{} input files of stage '{stage}' do not exist in '{dir}': {}", .files.len(), .files.join(", "))]
    MissingInput {
        stage: Stage,
        dir: String,
        files: Vec<String>,
    },

    #[error("invalid file name template in stage '{stage}': {source}")]
    Template {
        stage: Stage,
        #[source]
        source: PatternError,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize stage parameters: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for stage operations.
pub type Result<T> = std::result::Result<T, StageError>;

/// A pipeline stage with its own section in the parameters document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preprocessing,
    Rigid,
    Nonlinear,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Preprocessing, Stage::Rigid, Stage::Nonlinear];

    /// Section name in the parameters document.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Preprocessing => "preprocessing",
            Stage::Rigid => "rigid",
            Stage::Nonlinear => "nonlinear",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StageError::UnknownStage(s.to_string()))
    }
}

/// Input and output locations of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLocations {
    /// Directory the inputs are read from, `/`-terminated.
    pub input_dir: String,
    /// Input file name template.
    pub input_template: NamingTemplate,
    /// Directories the stage writes to.
    pub output_dirs: Vec<String>,
}

/// Resolve the locations of `stage` in `config`.
///
/// # Errors
///
/// Fails if the stage is disabled or its `file_name` is not a valid template.
pub fn locations(config: &PipelineConfig, stage: Stage) -> Result<StageLocations> {
    let (input_dir, file_name, output_dirs) = match stage {
        Stage::Preprocessing => {
            let pre = config
                .preprocessing
                .as_ref()
                .ok_or(StageError::StageDisabled(stage))?;
            (
                &pre.path_to_data,
                &pre.file_name,
                vec![
                    pre.analysis_path.clone(),
                    pre.projection_path.clone(),
                    split_output_format(&pre.output_format).0,
                ],
            )
        }
        Stage::Rigid | Stage::Nonlinear => {
            let reg = if stage == Stage::Rigid {
                &config.rigid
            } else {
                &config.nonlinear
            };
            (
                &reg.path_to_data,
                &reg.file_name,
                vec![
                    reg.trsf_folder.clone(),
                    reg.projection_path.clone(),
                    split_output_format(&reg.output_format).0,
                ],
            )
        }
    };

    let input_template = NamingTemplate::from_placeholder(file_name)
        .map_err(|source| StageError::Template { stage, source })?;

    Ok(StageLocations {
        input_dir: input_dir.clone(),
        input_template,
        output_dirs,
    })
}

/// Flat view of `image_info` merged with the `stage` section; stage keys win.
///
/// # Errors
///
/// Fails with [`StageError::StageDisabled`] for a skipped stage.
pub fn stage_view(config: &PipelineConfig, stage: Stage) -> Result<Map<String, Value>> {
    let section = match stage {
        Stage::Preprocessing => serde_json::to_value(
            config
                .preprocessing
                .as_ref()
                .ok_or(StageError::StageDisabled(stage))?,
        )?,
        Stage::Rigid => serde_json::to_value(&config.rigid)?,
        Stage::Nonlinear => serde_json::to_value(&config.nonlinear)?,
    };

    let mut view = into_object(serde_json::to_value(&config.image_info)?);
    view.extend(into_object(section));
    Ok(view)
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Write the flat view of `stage` to a new file in `dir`.
///
/// The file is `_tmp_parameters.json`, or `_tmp_parameters_NN.json` if that
/// name is taken. The canonical document is never touched; the caller removes
/// the copy once the stage has run.
///
/// # Errors
///
/// Fails if the stage is disabled or the file cannot be written.
pub fn write_derived_copy(config: &PipelineConfig, stage: Stage, dir: &Path) -> Result<PathBuf> {
    let view = stage_view(config, stage)?;
    let json = to_json_pretty(&view)?;

    for count in 0u32.. {
        let name = if count == 0 {
            "_tmp_parameters.json".to_string()
        } else {
            format!("_tmp_parameters_{:02}.json", count)
        };
        let path = dir.join(name);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(StageError::Io { path, source }),
        };
        file.write_all(json.as_bytes())
            .map_err(|source| StageError::Io {
                path: path.clone(),
                source,
            })?;

        log::info!("Wrote {} parameters to {}", stage, path.display());
        return Ok(path);
    }

    Err(StageError::Io {
        path: dir.to_path_buf(),
        source: std::io::Error::new(ErrorKind::AlreadyExists, "no free temporary file name"),
    })
}

/// Frames in `first..=last` that are not in `not_to_do`.
pub fn planned_frames(info: &ImageInfo) -> Vec<u32> {
    let skip: BTreeSet<u32> = info.not_to_do.iter().copied().collect();
    (info.first..=info.last)
        .filter(|i| !skip.contains(i))
        .collect()
}

/// Preprocessing `analysis_samples` that are not in `not_to_do`.
///
/// # Errors
///
/// Fails with [`StageError::StageDisabled`] when preprocessing is skipped.
pub fn analysis_frames(config: &PipelineConfig) -> Result<Vec<u32>> {
    let pre = config
        .preprocessing
        .as_ref()
        .ok_or(StageError::StageDisabled(Stage::Preprocessing))?;
    Ok(pre
        .analysis_samples
        .iter()
        .copied()
        .filter(|i| !config.image_info.not_to_do.contains(i))
        .collect())
}

/// Check that the input of every frame in `frames` exists for `stage`.
///
/// Returns the input paths in frame order.
///
/// # Errors
///
/// Fails with [`StageError::MissingInput`] listing every absent file.
pub fn verify_inputs(config: &PipelineConfig, stage: Stage, frames: &[u32]) -> Result<Vec<PathBuf>> {
    let locations = locations(config, stage)?;
    let dir = Path::new(&locations.input_dir);

    let mut inputs = Vec::with_capacity(frames.len());
    let mut missing = Vec::new();
    for &frame in frames {
        let name = locations.input_template.format(frame);
        let path = dir.join(&name);
        if path.is_file() {
            inputs.push(path);
        } else {
            missing.push(name);
        }
    }

    if !missing.is_empty() {
        return Err(StageError::MissingInput {
            stage,
            dir: locations.input_dir,
            files: missing,
        });
    }
    Ok(inputs)
}

/// Create the output directories of `stage`.
///
/// With `clean`, existing directories are removed first.
///
/// # Errors
///
/// Fails if a directory cannot be removed or created.
pub fn prepare_outputs(config: &PipelineConfig, stage: Stage, clean: bool) -> Result<Vec<PathBuf>> {
    let locations = locations(config, stage)?;
    let mut created = Vec::with_capacity(locations.output_dirs.len());

    for dir in locations.output_dirs {
        let path = PathBuf::from(dir);
        if clean && path.exists() {
            log::info!("Cleaning {}", path.display());
            fs::remove_dir_all(&path).map_err(|source| StageError::Io {
                path: path.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&path).map_err(|source| StageError::Io {
            path: path.clone(),
            source,
        })?;
        created.push(path);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetupConfig;
    use crate::core::frames::FrameIndex;
    use crate::core::header::ImageHeader;
    use crate::processors::parameters::{synthesize, BasePaths};
    use tempfile::tempdir;

    fn build(source: &Path, workspace: &Path, skip_preprocessing: bool) -> PipelineConfig {
        let mut frames = FrameIndex::new(1, 5);
        frames.exclude([3]);
        synthesize(
            &NamingTemplate::new("img_", ".tif", 3),
            &frames,
            &BasePaths::new(source, workspace),
            &ImageHeader::default(),
            &SetupConfig::default(),
            skip_preprocessing,
        )
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("rigid".parse::<Stage>().unwrap(), Stage::Rigid);
        assert_eq!("NonLinear".parse::<Stage>().unwrap(), Stage::Nonlinear);
        assert!("affine".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_view_merges_image_info() {
        let config = build(Path::new("/raw"), Path::new("/ws"), false);
        let view = stage_view(&config, Stage::Rigid).unwrap();

        assert_eq!(view["first"], 1);
        assert_eq!(view["last"], 5);
        assert_eq!(view["not_to_do"], serde_json::json!([3]));
        assert_eq!(view["trsf_type"], "rigid");
        assert_eq!(view["path_to_data"], "/ws/preprocessing-files/");
        assert!(view.get("analysis_path").is_none());
    }

    #[test]
    fn test_stage_view_of_skipped_preprocessing() {
        let config = build(Path::new("/raw"), Path::new("/ws"), true);
        let err = stage_view(&config, Stage::Preprocessing).unwrap_err();
        assert!(matches!(err, StageError::StageDisabled(Stage::Preprocessing)));
    }

    #[test]
    fn test_write_derived_copy_picks_free_name() {
        let dir = tempdir().unwrap();
        let config = build(Path::new("/raw"), Path::new("/ws"), false);

        let first = write_derived_copy(&config, Stage::Rigid, dir.path()).unwrap();
        let second = write_derived_copy(&config, Stage::Nonlinear, dir.path()).unwrap();

        assert_eq!(first.file_name().unwrap(), "_tmp_parameters.json");
        assert_eq!(second.file_name().unwrap(), "_tmp_parameters_01.json");

        let content = fs::read_to_string(&second).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["trsf_type"], "vectorfield");
    }

    #[test]
    fn test_derived_copy_uses_four_space_indent() {
        let dir = tempdir().unwrap();
        let config = build(Path::new("/raw"), Path::new("/ws"), false);

        let path = write_derived_copy(&config, Stage::Rigid, dir.path()).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let second_line = content.lines().nth(1).unwrap();
        assert!(second_line.starts_with("    \""));
        assert!(!second_line.starts_with("     "));
    }

    #[test]
    fn test_planned_and_analysis_frames() {
        let config = build(Path::new("/raw"), Path::new("/ws"), false);
        assert_eq!(planned_frames(&config.image_info), vec![1, 2, 4, 5]);
        assert_eq!(analysis_frames(&config).unwrap(), vec![1, 5]);
    }

    #[test]
    fn test_verify_inputs_reports_missing() {
        let raw = tempdir().unwrap();
        for i in [1, 2, 4] {
            fs::write(raw.path().join(format!("img_{:03}.tif", i)), b"").unwrap();
        }
        let config = build(raw.path(), Path::new("/ws"), false);
        let frames = planned_frames(&config.image_info);

        match verify_inputs(&config, Stage::Preprocessing, &frames).unwrap_err() {
            StageError::MissingInput { files, .. } => assert_eq!(files, vec!["img_005.tif"]),
            other => panic!("Expected MissingInput, got {:?}", other),
        }

        let inputs = verify_inputs(&config, Stage::Preprocessing, &[1, 2, 4]).unwrap();
        assert_eq!(inputs.len(), 3);
    }

    #[test]
    fn test_prepare_outputs_creates_and_cleans() {
        let ws = tempdir().unwrap();
        let config = build(Path::new("/raw"), ws.path(), false);

        let created = prepare_outputs(&config, Stage::Rigid, false).unwrap();
        assert_eq!(created.len(), 3);
        assert!(ws.path().join("rigid-files").is_dir());
        assert!(ws.path().join("rigid-transformations").is_dir());

        let stale = ws.path().join("rigid-files").join("rigid_001.tif");
        fs::write(&stale, b"old").unwrap();
        prepare_outputs(&config, Stage::Rigid, false).unwrap();
        assert!(stale.exists());

        prepare_outputs(&config, Stage::Rigid, true).unwrap();
        assert!(!stale.exists());
        assert!(ws.path().join("rigid-files").is_dir());
    }
}

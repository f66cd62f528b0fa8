//! Workspace setup.
//!
//! A workspace is the output directory of one dataset: the stage directories,
//! the metadata table (`files.csv`) and the parameters document
//! (`parameters.json`). Setup is all-or-nothing. The tree is assembled in a
//! staging directory next to the target and renamed into place once complete,
//! so callers observe either the old state or a complete workspace.
//!
//! | state   | force | outcome                                   |
//! |---------|-------|-------------------------------------------|
//! | absent  | any   | build                                     |
//! | present | false | [`WorkspaceError::Exists`], nothing touched |
//! | present | true  | build, remove the old tree, swap in       |

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::parameters::{
    synthesize, BasePaths, PipelineConfig, ParametersError, NONLINEAR_FILES,
    NONLINEAR_PROJECTIONS, NONLINEAR_TRANSFORMATIONS, PREPROCESSING_ANALYSIS, PREPROCESSING_FILES,
    PREPROCESSING_PROJECTIONS, RIGID_FILES, RIGID_PROJECTIONS, RIGID_TRANSFORMATIONS,
};
use super::quality;
use crate::config::SetupConfig;
use crate::core::frames::{self, FrameIndex, IndexError};
use crate::core::header::HeaderReader;
use crate::core::metadata::{MetadataError, MetadataTable};
use crate::core::template::{self, NamingTemplate, PatternError};

/// Errors raised during workspace setup.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error(
        "output folder '{}' for dataset '{}' already exists; use --force to overwrite it",
        .workspace.display(),
        .source_dir.display()
    )]
    Exists {
        workspace: PathBuf,
        source_dir: PathBuf,
    },

    #[error("missing input '{}': {reason}", .path.display())]
    MissingInput { path: PathBuf, reason: String },

    #[error("inconsistent file naming in '{}': {source}", .dir.display())]
    Pattern {
        dir: PathBuf,
        #[source]
        source: PatternError,
    },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Parameters(#[from] ParametersError),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for workspace operations.
pub type Result<T> = std::result::Result<T, WorkspaceError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Whether a workspace directory exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceState {
    Absent,
    Present,
}

impl WorkspaceState {
    pub fn of(workspace_dir: &Path) -> Self {
        if workspace_dir.exists() {
            WorkspaceState::Present
        } else {
            WorkspaceState::Absent
        }
    }
}

/// What to set up and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRequest {
    pub source_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub skip_preprocessing: bool,
    pub force: bool,
    /// Only files whose name contains this substring are part of the dataset.
    pub pattern: Option<String>,
}

impl SetupRequest {
    pub fn new(source_dir: impl Into<PathBuf>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            workspace_dir: workspace_dir.into(),
            skip_preprocessing: false,
            force: false,
            pattern: None,
        }
    }

    /// `<source_dir><suffix>` next to the source directory, e.g. `embryo_output`.
    pub fn default_workspace(source_dir: &Path, suffix: &str) -> PathBuf {
        let trimmed = source_dir
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        PathBuf::from(format!("{}{}", trimmed, suffix))
    }
}

/// Result of a successful setup.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub parameters_path: PathBuf,
    pub metadata_path: PathBuf,
    pub template: NamingTemplate,
    pub frames: FrameIndex,
    /// Frames excluded by the quality filter (on top of gaps in the listing).
    pub quality_excluded: BTreeSet<u32>,
    pub config: PipelineConfig,
}

/// Sub-directories created in a workspace.
pub fn workspace_subdirs(skip_preprocessing: bool) -> Vec<&'static str> {
    let mut dirs = Vec::with_capacity(9);
    if !skip_preprocessing {
        dirs.extend([
            PREPROCESSING_FILES,
            PREPROCESSING_ANALYSIS,
            PREPROCESSING_PROJECTIONS,
        ]);
    }
    dirs.extend([
        RIGID_FILES,
        RIGID_TRANSFORMATIONS,
        RIGID_PROJECTIONS,
        NONLINEAR_FILES,
        NONLINEAR_TRANSFORMATIONS,
        NONLINEAR_PROJECTIONS,
    ]);
    dirs
}

/// List the frame files of `dir`, sorted by name.
///
/// Only regular, non-hidden files whose name contains `pattern` (when given)
/// are returned.
pub fn list_frame_files(dir: &Path, pattern: Option<&str>) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(io_err(dir))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        if !entry.file_type().map_err(io_err(dir))?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            log::warn!("Skipping non UTF-8 file name {:?}", entry.file_name());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if pattern.map_or(true, |p| name.contains(p)) {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

/// Remove a workspace (directory tree or stray file). Returns whether anything
/// was removed.
pub fn remove_workspace(workspace_dir: &Path) -> Result<bool> {
    match WorkspaceState::of(workspace_dir) {
        WorkspaceState::Absent => Ok(false),
        WorkspaceState::Present => {
            if workspace_dir.is_dir() {
                fs::remove_dir_all(workspace_dir).map_err(io_err(workspace_dir))?;
            } else {
                fs::remove_file(workspace_dir).map_err(io_err(workspace_dir))?;
            }
            Ok(true)
        }
    }
}

/// Set up the workspace described by `request`.
///
/// Scans the source directory, infers the naming template and frame range,
/// reads every header into the metadata table, applies the quality filter,
/// synthesizes the parameters document and writes the whole workspace.
///
/// # Errors
///
/// - [`WorkspaceError::Exists`] if the workspace exists and `force` is not set;
///   nothing is modified
/// - [`WorkspaceError::MissingInput`] if the source directory is absent or holds
///   no matching files
/// - [`WorkspaceError::Pattern`] / [`WorkspaceError::Index`] for inconsistent
///   file naming
/// - header, metadata and I/O failures as they occur
pub fn setup(
    request: &SetupRequest,
    defaults: &SetupConfig,
    reader: &dyn HeaderReader,
) -> Result<Workspace> {
    let workspace_dir = request.workspace_dir.as_path();
    let state = WorkspaceState::of(workspace_dir);
    if state == WorkspaceState::Present && !request.force {
        return Err(WorkspaceError::Exists {
            workspace: workspace_dir.to_path_buf(),
            source_dir: request.source_dir.clone(),
        });
    }

    let source_dir = request.source_dir.as_path();
    if !source_dir.is_dir() {
        return Err(WorkspaceError::MissingInput {
            path: source_dir.to_path_buf(),
            reason: "source directory does not exist".to_string(),
        });
    }

    let files = list_frame_files(source_dir, request.pattern.as_deref())?;
    if files.is_empty() {
        return Err(WorkspaceError::MissingInput {
            path: source_dir.to_path_buf(),
            reason: match &request.pattern {
                Some(p) => format!("no files containing '{}'", p),
                None => "directory is empty".to_string(),
            },
        });
    }
    log::info!("Found {} files in {}", files.len(), source_dir.display());

    let template = template::infer(&files).map_err(|source| WorkspaceError::Pattern {
        dir: source_dir.to_path_buf(),
        source,
    })?;
    let mut frames = frames::index(&files, &template)?;

    let table = MetadataTable::build(source_dir, &files, &template, reader)?;
    let excluded = quality::filter(&table, frames.missing());
    let quality_excluded: BTreeSet<u32> = excluded.difference(frames.missing()).copied().collect();
    frames.exclude(excluded);

    let reference = table
        .rows()
        .first()
        .map(|row| row.header())
        .unwrap_or_default();
    let paths = BasePaths::new(source_dir, workspace_dir);
    let config = synthesize(
        &template,
        &frames,
        &paths,
        &reference,
        defaults,
        request.skip_preprocessing,
    );

    let staging = stage_workspace(workspace_dir, request.skip_preprocessing, |root| {
        table.write_csv(&root.join(&defaults.workspace.metadata_file))?;
        config.save(&root.join(&defaults.workspace.parameters_file))?;
        Ok(())
    })?;

    if state == WorkspaceState::Present {
        log::warn!("Removing old workspace {}", workspace_dir.display());
        remove_workspace(workspace_dir)?;
    }
    swap_into_place(staging, workspace_dir)?;
    log::info!("Workspace ready at {}", workspace_dir.display());

    Ok(Workspace {
        root: workspace_dir.to_path_buf(),
        parameters_path: workspace_dir.join(&defaults.workspace.parameters_file),
        metadata_path: workspace_dir.join(&defaults.workspace.metadata_file),
        template,
        frames,
        quality_excluded,
        config,
    })
}

/// Rename the staging directory to `workspace_dir`. The staging directory is
/// released from its guard first and removed by hand if the rename fails.
fn swap_into_place(staging: tempfile::TempDir, workspace_dir: &Path) -> Result<()> {
    let staged = staging.keep();
    if let Err(source) = fs::rename(&staged, workspace_dir) {
        if let Err(e) = fs::remove_dir_all(&staged) {
            log::warn!("Failed to remove staging directory {}: {}", staged.display(), e);
        }
        return Err(WorkspaceError::Io {
            path: workspace_dir.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Build the directory tree in a staging directory next to `workspace_dir`
/// and let `write_artifacts` fill it. The staging directory is removed on
/// failure.
fn stage_workspace<F>(
    workspace_dir: &Path,
    skip_preprocessing: bool,
    write_artifacts: F,
) -> Result<tempfile::TempDir>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let parent = match workspace_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(io_err(&parent))?;

    let staging = tempfile::Builder::new()
        .prefix(".workspace-staging-")
        .tempdir_in(&parent)
        .map_err(io_err(&parent))?;

    for name in workspace_subdirs(skip_preprocessing) {
        let dir = staging.path().join(name);
        fs::create_dir(&dir).map_err(io_err(&dir))?;
    }
    write_artifacts(staging.path())?;

    Ok(staging)
}

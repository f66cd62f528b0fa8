//! Workspace setup and stage configuration.

pub mod parameters;
pub mod quality;
pub mod stage;
pub mod workspace;

// Re-export key types for convenience
pub use parameters::{
    synthesize, BasePaths, ImageInfo, ParametersError, PipelineConfig, PreprocessingConfig,
    RegistrationConfig, TransformType,
};
pub use stage::{Stage, StageError, StageLocations};
pub use workspace::{setup, SetupRequest, Workspace, WorkspaceError, WorkspaceState};

//! Configuration types for workspace setup.
//!
//! These are the tool's own defaults, loaded from an optional YAML file. They
//! seed the stage sections of a freshly synthesized parameters document; the
//! document itself lives in [`crate::processors::parameters`].

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Defaults for the preprocessing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingDefaults {
    /// Intensities below this value are set to zero
    #[serde(default)]
    pub threshold: f64,

    /// Percentile used to saturate histogram and projection plots
    #[serde(default = "default_saturation_percentile")]
    pub saturation_percentile: f64,

    /// Number of bins in intensity histograms
    #[serde(default = "default_n_hist_bins")]
    pub n_hist_bins: u32,
}

fn default_saturation_percentile() -> f64 {
    99.999
}

fn default_n_hist_bins() -> u32 {
    100
}

impl Default for PreprocessingDefaults {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            saturation_percentile: default_saturation_percentile(),
            n_hist_bins: default_n_hist_bins(),
        }
    }
}

/// Defaults shared by the rigid and non-linear registration stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationDefaults {
    /// Reference time point all frames are registered to
    #[serde(default = "default_ref_tp")]
    pub ref_tp: u32,

    /// Pad registered images so nothing is cropped
    #[serde(default = "default_true")]
    pub padding: bool,

    /// Only check a single time point instead of the whole series
    #[serde(default)]
    pub check_tp: bool,

    /// Estimate transformations
    #[serde(default = "default_true")]
    pub compute_trsf: bool,

    /// Apply transformations and write registered images
    #[serde(default = "default_true")]
    pub apply_trsf: bool,

    /// Recompute transformations that already exist on disk
    #[serde(default = "default_true")]
    pub recompute: bool,
}

fn default_ref_tp() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for RegistrationDefaults {
    fn default() -> Self {
        Self {
            ref_tp: default_ref_tp(),
            padding: true,
            check_tp: false,
            compute_trsf: true,
            apply_trsf: true,
            recompute: true,
        }
    }
}

/// Defaults specific to the non-linear stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NonlinearDefaults {
    /// Keep intermediate vector-field files after they are applied
    #[serde(default)]
    pub keep_vectorfield: bool,
}

/// Workspace naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDefaults {
    /// Appended to the source directory name when no output is given
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,

    /// File name of the parameters document inside the workspace
    #[serde(default = "default_parameters_file")]
    pub parameters_file: String,

    /// File name of the metadata table inside the workspace
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

fn default_output_suffix() -> String {
    "_output".to_string()
}

fn default_parameters_file() -> String {
    "parameters.json".to_string()
}

fn default_metadata_file() -> String {
    "files.csv".to_string()
}

impl Default for WorkspaceDefaults {
    fn default() -> Self {
        Self {
            output_suffix: default_output_suffix(),
            parameters_file: default_parameters_file(),
            metadata_file: default_metadata_file(),
        }
    }
}

/// Main setup configuration combining all sub-configs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub preprocessing: PreprocessingDefaults,

    #[serde(default)]
    pub registration: RegistrationDefaults,

    #[serde(default)]
    pub nonlinear: NonlinearDefaults,

    #[serde(default)]
    pub workspace: WorkspaceDefaults,
}

impl SetupConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: SetupConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

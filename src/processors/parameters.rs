//! Parameters document synthesis.
//!
//! The parameters document (`parameters.json`) is the contract between setup
//! and every stage runner. It has a shared `image_info` section and one section
//! per stage. Each stage section is an immutable value assembled once here, and
//! every stage's input location is derived from the previous enabled stage's
//! output location, so the wiring never needs hand-editing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SetupConfig;
use crate::core::frames::FrameIndex;
use crate::core::header::ImageHeader;
use crate::core::template::NamingTemplate;

pub const PREPROCESSING_FILES: &str = "preprocessing-files";
pub const PREPROCESSING_ANALYSIS: &str = "preprocessing-analysis";
pub const PREPROCESSING_PROJECTIONS: &str = "preprocessing-projections";
pub const RIGID_FILES: &str = "rigid-files";
pub const RIGID_TRANSFORMATIONS: &str = "rigid-transformations";
pub const RIGID_PROJECTIONS: &str = "rigid-projections";
pub const NONLINEAR_FILES: &str = "nonlinear-files";
pub const NONLINEAR_TRANSFORMATIONS: &str = "nonlinear-transformations";
pub const NONLINEAR_PROJECTIONS: &str = "nonlinear-projections";

/// Errors raised while reading, writing or validating a parameters document.
#[derive(Error, Debug)]
pub enum ParametersError {
    #[error("failed to access parameters file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid parameters document '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("stage '{stage}' reads '{input}' but the previous stage writes '{expected}'")]
    BrokenWiring {
        stage: &'static str,
        input: String,
        expected: String,
    },
}

/// Result type for parameters operations.
pub type Result<T> = std::result::Result<T, ParametersError>;

/// Transformation model estimated by a registration stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformType {
    #[serde(rename = "rigid")]
    Rigid,
    #[serde(rename = "vectorfield")]
    VectorField,
}

/// Section shared by all stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub voxel_size: [f64; 3],
    pub first: u32,
    pub last: u32,
    pub not_to_do: Vec<u32>,
}

/// Threshold and crop stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    pub path_to_data: String,
    pub file_name: String,
    pub analysis_path: String,
    pub projection_path: String,
    pub output_format: String,
    pub analysis_samples: Vec<u32>,
    pub cropping_cube: [[u32; 2]; 3],
    pub n_hist_bins: u32,
    pub threshold: f64,
    pub saturation_percentile: f64,
}

/// Rigid or non-linear registration stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub path_to_data: String,
    pub file_name: String,
    pub trsf_folder: String,
    pub output_format: String,
    pub projection_path: String,
    #[serde(rename = "check_TP", with = "flag")]
    pub check_tp: bool,
    #[serde(with = "flag")]
    pub compute_trsf: bool,
    #[serde(rename = "ref_TP")]
    pub ref_tp: u32,
    pub trsf_type: TransformType,
    #[serde(with = "flag")]
    pub padding: bool,
    #[serde(with = "flag")]
    pub recompute: bool,
    #[serde(with = "flag")]
    pub apply_trsf: bool,
    /// Non-linear stage only.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_flag"
    )]
    pub keep_vectorfield: Option<bool>,
}

/// The whole parameters document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub image_info: ImageInfo,
    /// Absent when preprocessing is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<PreprocessingConfig>,
    pub rigid: RegistrationConfig,
    pub nonlinear: RegistrationConfig,
}

/// Serialize `value` as JSON with 4-space indentation, the layout the stage
/// runners write and read.
pub fn to_json_pretty<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl PipelineConfig {
    /// Serialize with 4-space indentation.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        to_json_pretty(self)
    }

    /// Write the document to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json_pretty().map_err(|source| ParametersError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json + "\n").map_err(|source| ParametersError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a document from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ParametersError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ParametersError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check that each stage reads what the previous enabled stage writes.
    ///
    /// Hand-edited documents can break this; synthesized ones never do.
    pub fn validate_wiring(&self) -> Result<()> {
        if let Some(pre) = &self.preprocessing {
            check_wiring("rigid", &self.rigid, &pre.output_format)?;
        }
        check_wiring("nonlinear", &self.nonlinear, &self.rigid.output_format)
    }
}

fn check_wiring(stage: &'static str, config: &RegistrationConfig, upstream: &str) -> Result<()> {
    let (dir, file) = split_output_format(upstream);
    if config.path_to_data != dir || config.file_name != file {
        return Err(ParametersError::BrokenWiring {
            stage,
            input: format!("{}{}", config.path_to_data, config.file_name),
            expected: upstream.to_string(),
        });
    }
    Ok(())
}

/// Source and workspace locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasePaths {
    pub source_dir: PathBuf,
    pub workspace_dir: PathBuf,
}

impl BasePaths {
    pub fn new(source_dir: impl Into<PathBuf>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            workspace_dir: workspace_dir.into(),
        }
    }

    /// Workspace sub-directory as a `/`-terminated string.
    pub fn workspace_subdir(&self, name: &str) -> String {
        dir_string(&self.workspace_dir.join(name))
    }
}

/// Render a directory path with a trailing `/`, the form stage runners
/// concatenate file names onto.
pub fn dir_string(path: &Path) -> String {
    let mut s = path.display().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// Split an `output_format` into its directory (with `/`) and file template.
pub fn split_output_format(output_format: &str) -> (String, String) {
    match output_format.rfind('/') {
        Some(pos) => (
            output_format[..=pos].to_string(),
            output_format[pos + 1..].to_string(),
        ),
        None => (String::new(), output_format.to_string()),
    }
}

/// Build the parameters document for a dataset.
///
/// - `image_info` takes its spacing from `reference` and its range and
///   exclusions from `frames`
/// - `preprocessing` crops to the full extent of `reference` by default
/// - `rigid` reads preprocessing's output, or the raw dataset when
///   `skip_preprocessing` is set (the preprocessing section is then omitted)
/// - `nonlinear` reads rigid's output
pub fn synthesize(
    template: &NamingTemplate,
    frames: &FrameIndex,
    paths: &BasePaths,
    reference: &ImageHeader,
    defaults: &SetupConfig,
    skip_preprocessing: bool,
) -> PipelineConfig {
    let image_info = ImageInfo {
        voxel_size: reference.spacing,
        first: frames.min(),
        last: frames.max(),
        not_to_do: frames.missing().iter().copied().collect(),
    };

    let raw_input = (dir_string(&paths.source_dir), template.placeholder());

    let preprocessing = (!skip_preprocessing).then(|| {
        let pre = &defaults.preprocessing;
        let [x, y, z] = reference.size;
        PreprocessingConfig {
            path_to_data: raw_input.0.clone(),
            file_name: raw_input.1.clone(),
            analysis_path: paths.workspace_subdir(PREPROCESSING_ANALYSIS),
            projection_path: paths.workspace_subdir(PREPROCESSING_PROJECTIONS),
            output_format: output_format(paths, PREPROCESSING_FILES, template, "preprocessed_"),
            analysis_samples: vec![frames.min(), frames.max()],
            cropping_cube: [[0, x], [0, y], [0, z]],
            n_hist_bins: pre.n_hist_bins,
            threshold: pre.threshold,
            saturation_percentile: pre.saturation_percentile,
        }
    });

    let rigid_input = match &preprocessing {
        Some(pre) => split_output_format(&pre.output_format),
        None => raw_input,
    };
    let ref_tp = reference_frame(frames, defaults.registration.ref_tp);

    let rigid = registration_stage(
        rigid_input,
        paths,
        [RIGID_TRANSFORMATIONS, RIGID_PROJECTIONS],
        output_format(paths, RIGID_FILES, template, "rigid_"),
        TransformType::Rigid,
        ref_tp,
        defaults,
    );

    let mut nonlinear = registration_stage(
        split_output_format(&rigid.output_format),
        paths,
        [NONLINEAR_TRANSFORMATIONS, NONLINEAR_PROJECTIONS],
        output_format(paths, NONLINEAR_FILES, template, "nonlinear_"),
        TransformType::VectorField,
        ref_tp,
        defaults,
    );
    nonlinear.keep_vectorfield = Some(defaults.nonlinear.keep_vectorfield);

    PipelineConfig {
        image_info,
        preprocessing,
        rigid,
        nonlinear,
    }
}

fn output_format(
    paths: &BasePaths,
    subdir: &str,
    template: &NamingTemplate,
    prefix: &str,
) -> String {
    format!(
        "{}{}",
        paths.workspace_subdir(subdir),
        template.with_affixes(prefix, ".tif").placeholder()
    )
}

fn registration_stage(
    (path_to_data, file_name): (String, String),
    paths: &BasePaths,
    [transformations, projections]: [&str; 2],
    output_format: String,
    trsf_type: TransformType,
    ref_tp: u32,
    defaults: &SetupConfig,
) -> RegistrationConfig {
    let reg = &defaults.registration;
    RegistrationConfig {
        path_to_data,
        file_name,
        trsf_folder: paths.workspace_subdir(transformations),
        output_format,
        projection_path: paths.workspace_subdir(projections),
        check_tp: reg.check_tp,
        compute_trsf: reg.compute_trsf,
        ref_tp,
        trsf_type,
        padding: reg.padding,
        recompute: reg.recompute,
        apply_trsf: reg.apply_trsf,
        keep_vectorfield: None,
    }
}

/// The configured reference frame, written as is. A frame that is missing or
/// excluded is reported so the registration stages are not started blind.
fn reference_frame(frames: &FrameIndex, configured: u32) -> u32 {
    if !frames.contains(configured) {
        log::warn!(
            "Reference frame {} is missing or excluded; set ref_tp to one of the frames {}-{}",
            configured,
            frames.min(),
            frames.max()
        );
    }
    configured
}

/// 0/1 integer flags, as the stage runners expect. Booleans are accepted on
/// input.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Repr {
        Int(i64),
        Bool(bool),
    }

    impl From<Repr> for bool {
        fn from(repr: Repr) -> Self {
            match repr {
                Repr::Int(v) => v != 0,
                Repr::Bool(b) => b,
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Repr::deserialize(deserializer).map(bool::from)
    }
}

mod optional_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::flag::Repr;

    pub fn serialize<S: Serializer>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_u8(u8::from(*v)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<bool>, D::Error> {
        Ok(Option::<Repr>::deserialize(deserializer)?.map(bool::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> ImageHeader {
        ImageHeader {
            dimensions: 3,
            size: [512, 256, 40],
            channels: 1,
            spacing: [0.3, 0.3, 2.0],
        }
    }

    fn paths() -> BasePaths {
        BasePaths::new("/data/embryo", "/data/embryo_output")
    }

    fn frames() -> FrameIndex {
        let mut frames = FrameIndex::new(1, 10);
        frames.exclude([4]);
        frames
    }

    fn build(skip_preprocessing: bool) -> PipelineConfig {
        synthesize(
            &NamingTemplate::new("img_", ".tif", 3),
            &frames(),
            &paths(),
            &reference(),
            &SetupConfig::default(),
            skip_preprocessing,
        )
    }

    #[test]
    fn test_image_info() {
        let config = build(false);
        assert_eq!(config.image_info.first, 1);
        assert_eq!(config.image_info.last, 10);
        assert_eq!(config.image_info.not_to_do, vec![4]);
        assert_eq!(config.image_info.voxel_size, [0.3, 0.3, 2.0]);
    }

    #[test]
    fn test_preprocessing_defaults() {
        let config = build(false);
        let pre = config.preprocessing.as_ref().unwrap();
        assert_eq!(pre.path_to_data, "/data/embryo/");
        assert_eq!(pre.file_name, "img_{t:03d}.tif");
        assert_eq!(
            pre.output_format,
            "/data/embryo_output/preprocessing-files/preprocessed_{t:03d}.tif"
        );
        assert_eq!(pre.analysis_path, "/data/embryo_output/preprocessing-analysis/");
        assert_eq!(pre.cropping_cube, [[0, 512], [0, 256], [0, 40]]);
        assert_eq!(pre.analysis_samples, vec![1, 10]);
        assert_eq!(pre.threshold, 0.0);
        assert_eq!(pre.saturation_percentile, 99.999);
        assert_eq!(pre.n_hist_bins, 100);
    }

    #[test]
    fn test_rigid_reads_preprocessing_output() {
        let config = build(false);
        let pre = config.preprocessing.as_ref().unwrap();
        assert_eq!(
            format!("{}{}", config.rigid.path_to_data, config.rigid.file_name),
            pre.output_format
        );
        assert_eq!(config.rigid.trsf_type, TransformType::Rigid);
        assert_eq!(config.rigid.ref_tp, 1);
        assert!(config.validate_wiring().is_ok());
    }

    #[test]
    fn test_skip_preprocessing_reads_raw_data() {
        let config = build(true);
        assert!(config.preprocessing.is_none());
        assert_eq!(config.rigid.path_to_data, "/data/embryo/");
        assert_eq!(config.rigid.file_name, "img_{t:03d}.tif");
        assert!(config.validate_wiring().is_ok());

        let json = config.to_json_pretty().unwrap();
        assert!(!json.contains("\"preprocessing\""));
    }

    #[test]
    fn test_nonlinear_reads_rigid_output() {
        let config = build(false);
        assert_eq!(config.nonlinear.path_to_data, "/data/embryo_output/rigid-files/");
        assert_eq!(config.nonlinear.file_name, "rigid_{t:03d}.tif");
        assert_eq!(config.nonlinear.trsf_type, TransformType::VectorField);
        assert_eq!(config.nonlinear.keep_vectorfield, Some(false));
        assert_eq!(config.rigid.keep_vectorfield, None);
    }

    #[test]
    fn test_reference_frame_is_kept_when_missing() {
        let mut frames = FrameIndex::new(1, 5);
        frames.exclude([1]);
        assert_eq!(reference_frame(&frames, 1), 1);
        assert_eq!(reference_frame(&frames, 3), 3);
        assert_eq!(reference_frame(&frames, 9), 9);
    }

    #[test]
    fn test_json_keys_and_flags() {
        let json = build(false).to_json_pretty().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let rigid = &value["rigid"];
        assert_eq!(rigid["check_TP"], 0);
        assert_eq!(rigid["compute_trsf"], 1);
        assert_eq!(rigid["ref_TP"], 1);
        assert_eq!(rigid["trsf_type"], "rigid");
        assert!(rigid.get("keep_vectorfield").is_none());
        assert_eq!(value["nonlinear"]["trsf_type"], "vectorfield");
        assert_eq!(value["nonlinear"]["keep_vectorfield"], 0);
        assert_eq!(value["image_info"]["not_to_do"], serde_json::json!([4]));

        let sections: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(sections.len(), 4);
        assert!(json.starts_with("{\n    \"image_info\": {"));
    }

    #[test]
    fn test_load_accepts_boolean_flags() {
        let mut value = serde_json::to_value(build(true)).unwrap();
        value["rigid"]["recompute"] = serde_json::json!(false);
        value["nonlinear"]["keep_vectorfield"] = serde_json::json!(true);

        let config: PipelineConfig = serde_json::from_value(value).unwrap();
        assert!(!config.rigid.recompute);
        assert_eq!(config.nonlinear.keep_vectorfield, Some(true));
    }

    #[test]
    fn test_validate_wiring_detects_hand_edits() {
        let mut config = build(false);
        config.nonlinear.path_to_data = "/elsewhere/".to_string();
        match config.validate_wiring().unwrap_err() {
            ParametersError::BrokenWiring { stage, .. } => assert_eq!(stage, "nonlinear"),
            other => panic!("Expected BrokenWiring, got {:?}", other),
        }
    }

    #[test]
    fn test_split_output_format() {
        assert_eq!(
            split_output_format("/w/rigid-files/rigid_{t:03d}.tif"),
            ("/w/rigid-files/".to_string(), "rigid_{t:03d}.tif".to_string())
        );
        assert_eq!(
            split_output_format("rigid_{t:03d}.tif"),
            (String::new(), "rigid_{t:03d}.tif".to_string())
        );
    }
}

//! Command-line interface for the volume pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::SetupConfig;
use crate::core::{MetadataTable, NamingTemplate, TiffHeaderReader};
use crate::processors::{quality, stage, workspace, PipelineConfig, Stage};

#[derive(Parser)]
#[command(name = "volume-pipeline")]
#[command(about = "Dataset setup for 3D time-lapse registration", version)]
pub struct Cli {
    /// Path to YAML config file with setup defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a dataset and create its workspace
    Setup {
        /// Directory containing one image file per time point
        directory: PathBuf,
        /// Workspace directory (defaults to <directory>_output)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite an existing workspace
        #[arg(short, long)]
        force: bool,
        /// Register the raw images directly, without preprocessing
        #[arg(long)]
        skip_preprocessing: bool,
        /// Only use files whose name contains this text
        #[arg(short, long)]
        pattern: Option<String>,
    },

    /// Show the frame plan of a parameters file and check stage inputs
    Inspect {
        /// Workspace parameters file
        parameters: PathBuf,
        /// Only inspect this stage
        #[arg(long)]
        stage: Option<Stage>,
        /// Use the analysis samples instead of the full range for preprocessing
        #[arg(long)]
        analysis: bool,
    },

    /// Check inputs, create output folders and write stage parameters
    Prepare {
        /// Workspace parameters file
        parameters: PathBuf,
        /// Stage to prepare
        #[arg(long)]
        stage: Stage,
        /// Empty the stage output folders first
        #[arg(long)]
        clean: bool,
    },

    /// Write the flattened parameters of one stage
    Derive {
        /// Workspace parameters file
        parameters: PathBuf,
        /// Stage to derive
        #[arg(long)]
        stage: Stage,
        /// Directory for the derived file (defaults to the workspace)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("...{}", tail(value, 36))
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Last `n` characters of `s`; paths are most telling at the end.
fn tail(s: &str, n: usize) -> &str {
    let skip = s.chars().count().saturating_sub(n);
    s.char_indices().nth(skip).map_or("", |(i, _)| &s[i..])
}

/// Compact `1-3, 5, 7-9` rendering of a sorted frame list.
fn frame_ranges(frames: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = frames.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{}-{}", start, end)
        });
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match SetupConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                SetupConfig::default()
            }
        },
        None => SetupConfig::default(),
    };

    let result = match cli.command {
        Commands::Setup {
            directory,
            output,
            force,
            skip_preprocessing,
            pattern,
        } => cmd_setup(directory, output, force, skip_preprocessing, pattern, &config),
        Commands::Inspect {
            parameters,
            stage,
            analysis,
        } => cmd_inspect(&parameters, stage, analysis, &config),
        Commands::Prepare {
            parameters,
            stage,
            clean,
        } => cmd_prepare(&parameters, stage, clean),
        Commands::Derive {
            parameters,
            stage,
            out_dir,
        } => cmd_derive(&parameters, stage, out_dir),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_parameters(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path)
        .with_context(|| format!("Failed to load parameters from {}", path.display()))
}

/// Directory holding the parameters file, used for sibling artifacts.
fn workspace_of(parameters: &Path) -> PathBuf {
    match parameters.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn cmd_setup(
    directory: PathBuf,
    output: Option<PathBuf>,
    force: bool,
    skip_preprocessing: bool,
    pattern: Option<String>,
    config: &SetupConfig,
) -> Result<()> {
    let start = Instant::now();

    let workspace_dir = output.unwrap_or_else(|| {
        workspace::SetupRequest::default_workspace(&directory, &config.workspace.output_suffix)
    });
    let request = workspace::SetupRequest {
        source_dir: directory,
        workspace_dir,
        skip_preprocessing,
        force,
        pattern,
    };

    let spinner = create_spinner("Reading image headers...");
    let result = workspace::setup(&request, config, &TiffHeaderReader);
    spinner.finish_and_clear();
    let ws = result?;

    let not_to_do = &ws.config.image_info.not_to_do;
    print_summary(
        "Workspace Setup Complete",
        &[
            ("Dataset", request.source_dir.display().to_string()),
            ("Workspace", ws.root.display().to_string()),
            ("File names", ws.template.placeholder()),
            ("Frames", format!("{}-{}", ws.frames.min(), ws.frames.max())),
            ("Frames to process", ws.frames.present_count().to_string()),
            ("Not to do", frame_ranges(not_to_do)),
            (
                "Quality excluded",
                ws.quality_excluded.len().to_string(),
            ),
            (
                "Preprocessing",
                if skip_preprocessing { "skipped" } else { "enabled" }.to_string(),
            ),
            ("Parameters", ws.parameters_path.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_inspect(
    parameters: &Path,
    only: Option<Stage>,
    analysis: bool,
    defaults: &SetupConfig,
) -> Result<()> {
    let config = load_parameters(parameters)?;
    if let Err(e) = config.validate_wiring() {
        warn!("{}", e);
    }

    let planned = stage::planned_frames(&config.image_info);
    let stages: Vec<Stage> = match only {
        Some(s) => vec![s],
        None => Stage::ALL
            .into_iter()
            .filter(|&s| s != Stage::Preprocessing || config.preprocessing.is_some())
            .collect(),
    };

    let mut items = vec![
        ("Parameters", parameters.display().to_string()),
        (
            "Frame range",
            format!("{}-{}", config.image_info.first, config.image_info.last),
        ),
        ("Not to do", frame_ranges(&config.image_info.not_to_do)),
        ("Planned frames", planned.len().to_string()),
    ];

    for s in stages {
        let frames = if analysis && s == Stage::Preprocessing {
            stage::analysis_frames(&config)?
        } else {
            planned.clone()
        };
        let status = match stage::verify_inputs(&config, s, &frames) {
            Ok(inputs) => format!("{} inputs ready", inputs.len()),
            Err(stage::StageError::MissingInput { files, .. }) => {
                format!("{} of {} inputs missing", files.len(), frames.len())
            }
            Err(e) => return Err(e.into()),
        };
        items.push((s.name(), status));
    }

    let metadata_path = workspace_of(parameters).join(&defaults.workspace.metadata_file);
    if metadata_path.is_file() {
        let raw_name = match &config.preprocessing {
            Some(pre) => &pre.file_name,
            None => &config.rigid.file_name,
        };
        let template = NamingTemplate::from_placeholder(raw_name)
            .with_context(|| format!("Invalid file name template '{}'", raw_name))?;
        let table = MetadataTable::read_csv(&metadata_path, &template)?;
        let pending: Vec<u32> = quality::outlier_frames(&table)
            .into_iter()
            .filter(|f| !config.image_info.not_to_do.contains(f))
            .collect();
        if !pending.is_empty() {
            warn!(
                "Frames {} deviate from the dataset median but are not in not_to_do",
                frame_ranges(&pending)
            );
        }
        items.push(("Unlisted outliers", frame_ranges(&pending)));
    } else {
        info!("No metadata table at {}", metadata_path.display());
    }

    print_summary("Parameters", &items);
    Ok(())
}

fn cmd_prepare(parameters: &Path, target: Stage, clean: bool) -> Result<()> {
    let start = Instant::now();
    let config = load_parameters(parameters)?;
    config.validate_wiring()?;

    let frames = stage::planned_frames(&config.image_info);
    let inputs = stage::verify_inputs(&config, target, &frames)?;
    let outputs = stage::prepare_outputs(&config, target, clean)?;
    let derived = stage::write_derived_copy(&config, target, &workspace_of(parameters))?;

    print_summary(
        &format!("Stage '{}' Prepared", target),
        &[
            ("Inputs", inputs.len().to_string()),
            ("Output folders", outputs.len().to_string()),
            ("Cleaned", clean.to_string()),
            ("Stage parameters", derived.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_derive(parameters: &Path, target: Stage, out_dir: Option<PathBuf>) -> Result<()> {
    let config = load_parameters(parameters)?;
    let dir = out_dir.unwrap_or_else(|| workspace_of(parameters));
    let derived = stage::write_derived_copy(&config, target, &dir)?;
    println!("{}", derived.display());
    Ok(())
}

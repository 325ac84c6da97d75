use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use dicom_recon::{
    Pipeline, PipelineConfig, PipelineError, convert_container_to_vti,
    imaging::{MriSliceAnalyzer, XrayClassifier},
    onnx::load_model,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "dicom-recon", version, about = "DICOM volume reconstruction and image analysis")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the artifact output directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a zipped DICOM series and print the result as JSON
    Analyze {
        zip: PathBuf,
        /// ONNX reconstruction model, overriding the configuration
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Re-export a canonical container (.cvol, or .h5 with the hdf5 feature) as a VTK ImageData file
    Convert { container: PathBuf, vti: PathBuf },
    /// Classify a chest X-ray
    Xray {
        image: PathBuf,
        #[arg(long)]
        model: PathBuf,
    },
    /// Classify and segment an MRI slice
    Mri {
        image: PathBuf,
        #[arg(long)]
        classifier: PathBuf,
        #[arg(long)]
        segmenter: PathBuf,
        /// Class names in model output order
        #[arg(long, value_delimiter = ',', default_value = "glioma,meningioma,notumor,pituitary")]
        classes: Vec<String>,
    },
}

fn print_json(value: &impl Serialize) -> Result<(), PipelineError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, mut config: PipelineConfig) -> Result<(), PipelineError> {
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }

    match cli.command {
        Command::Analyze { zip, model } => {
            if model.is_some() {
                config.reconstruction_model = model;
            }
            let pipeline = Arc::new(Pipeline::new(config)?);
            let result = pipeline.analyze_dicom_zip_async(zip).await?;
            print_json(&result)
        }
        Command::Convert { container, vti } => {
            let volume = convert_container_to_vti(&container, &vti)?;
            log::info!("converted {} with shape {:?}", container.display(), volume.dim());
            Ok(())
        }
        Command::Xray { image, model } => {
            let classifier = XrayClassifier::new(load_model(&model)?);
            print_json(&classifier.analyze_path(&image)?)
        }
        Command::Mri {
            image,
            classifier,
            segmenter,
            classes,
        } => {
            let analyzer =
                MriSliceAnalyzer::new(load_model(&classifier)?, load_model(&segmenter)?, classes);
            print_json(&analyzer.analyze_path(&image)?)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path),
        None => Ok(PipelineConfig::default()),
    };

    let log_level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let kind = if err.is_client_error() { "input" } else { "internal" };
            log::error!("{kind} error: {err}");
            ExitCode::FAILURE
        }
    }
}

//! relearn: continuously retrained object detection.
//!
//! Run a trainer and a detector separately:
//!   relearn trainer
//!   relearn detector
//!
//! or both in one process:
//!   relearn service
//!
//! Feed it and query it:
//!   relearn upload cat.jpg cat.txt --usage training
//!   relearn detect street.jpg

mod config;
mod dataset;
mod services;

use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use relearn_core::ImageUsageType;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relearn", version, about)]
struct Cli {
    /// Config file (default: ./relearn.toml if present).
    #[arg(long, global = true, env = "RELEARN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "RELEARN_IMAGE_SIZE")]
    image_size: Option<u32>,

    #[arg(long, global = true, env = "RELEARN_BATCH_SIZE")]
    batch_size: Option<u32>,

    #[arg(long, global = true, env = "RELEARN_EPOCHS")]
    epochs: Option<u32>,

    /// Number of label classes.
    #[arg(long, global = true, env = "RELEARN_CLASSES")]
    classes: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept images, train periodically and push models to detectors.
    Trainer,
    /// Answer detection requests with the newest model from the trainer.
    Detector,
    /// Trainer and detector in one process.
    Service,
    /// Send an image and its YOLO annotation to the trainer.
    Upload {
        image: PathBuf,
        annotation: PathBuf,
        #[arg(long, value_enum, default_value_t = Usage::Training)]
        usage: Usage,
    },
    /// Detect objects in an image and print the labels as JSON.
    Detect { image: PathBuf },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Usage {
    Training,
    Validation,
}

impl From<Usage> for ImageUsageType {
    fn from(usage: Usage) -> Self {
        match usage {
            Usage::Training => ImageUsageType::Training,
            Usage::Validation => ImageUsageType::Validation,
        }
    }
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(image_size) = self.image_size {
            config.training.image_size = image_size;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(classes) = self.classes {
            config.training.classes = classes;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("relearn=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.paths.make_absolute()?;

    match cli.command {
        Command::Trainer => services::run_trainer(config).await,
        Command::Detector => services::run_detector(config).await,
        Command::Service => services::run_service(config).await,
        Command::Upload {
            image,
            annotation,
            usage,
        } => services::upload(&config, &image, &annotation, usage.into()).await,
        Command::Detect { image } => services::detect(&config, &image).await,
    }
}

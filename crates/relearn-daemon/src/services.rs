//! Wiring of the trainer, detector and client roles onto a [`Messenger`].

use crate::config::Config;
use crate::dataset::DatasetDescriptor;
use anyhow::{Context, Result};
use relearn_core::command::ExternalCommand;
use relearn_core::{ImageUsageType, ModelStore, Role};
use relearn_detector::{DetectionClient, Inference, detector_structure, trainer_link_structure};
use relearn_messenger::Messenger;
use relearn_trainer::{
    Broadcaster, Corpus, ImageSource, StagingArea, TrainerStructure, TrainingError, TrainingLoop,
    TrainingSettings, trainer_structure,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Interpreter the tool scripts run under.
const SHELL: &str = "sh";
const TRAIN_SCRIPT: &str = "train.sh";
const DETECT_SCRIPT: &str = "detect.sh";
const TRAINING_MODEL: &str = "training.pt";
const DETECTION_MODEL: &str = "detection.pt";

/// Run a trainer until interrupted.
pub async fn run_trainer(config: Config) -> Result<()> {
    let trainer = Trainer::prepare(&config).await?;

    let messenger = Messenger::new();
    trainer.listen(&messenger, &config).await?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let training = trainer.training_loop.spawn(shutdown_rx);
    serve(messenger, shutdown, training).await
}

/// Run a detector until interrupted.
///
/// The detector connects out to the trainer for model updates and does not
/// reconnect if that link drops.
pub async fn run_detector(config: Config) -> Result<()> {
    let model = Arc::new(ModelStore::new(config.paths.models.join(DETECTION_MODEL)));
    let inference = Arc::new(inference(&config, model.clone()).await?);

    let messenger = Messenger::new();
    messenger
        .listen(
            config.detector.bind,
            Role::Client,
            Arc::new(detector_structure(inference)),
        )
        .await?;
    messenger
        .connect(
            &config.trainer.detector_url,
            Role::Detector,
            Role::Trainer,
            None,
            Arc::new(trainer_link_structure(model)),
        )
        .await
        .with_context(|| format!("failed to reach trainer at {}", config.trainer.detector_url))?;

    shutdown_signal().await?;
    messenger.stop().await;
    Ok(())
}

/// Run a trainer and a detector in one process.
///
/// Remote detectors may still connect. The local detector gets every model
/// straight from the training loop.
pub async fn run_service(config: Config) -> Result<()> {
    let trainer = Trainer::prepare(&config).await?;

    let detection_model = Arc::new(ModelStore::new(config.paths.models.join(DETECTION_MODEL)));
    if let Some(bytes) = trainer.model.read().await? {
        detection_model.replace(&bytes).await?;
        tracing::info!("Detection model seeded from {}", trainer.model.path().display());
    }
    let inference = Arc::new(inference(&config, detection_model.clone()).await?);

    let messenger = Messenger::new();
    trainer.listen(&messenger, &config).await?;
    messenger
        .listen(
            config.detector.bind,
            Role::Client,
            Arc::new(detector_structure(inference)),
        )
        .await?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let training = trainer
        .training_loop
        .publish_to(detection_model)
        .spawn(shutdown_rx);
    serve(messenger, shutdown, training).await
}

/// Send one image and its annotation to the trainer.
pub async fn upload(
    config: &Config,
    image: &Path,
    annotation: &Path,
    usage: ImageUsageType,
) -> Result<()> {
    let source = ImageSource::new();
    let messenger = Messenger::new();
    messenger
        .connect(
            &config.trainer.image_source_url,
            Role::ImageSource,
            Role::Trainer,
            None,
            source.structure(),
        )
        .await
        .with_context(|| format!("failed to reach trainer at {}", config.trainer.image_source_url))?;

    let sent = source.send_image(image, annotation, usage).await;
    messenger.stop().await;
    sent?;
    Ok(())
}

/// Ask a detector for the labels in `image` and print them as JSON.
pub async fn detect(config: &Config, image: &Path) -> Result<()> {
    let client = DetectionClient::new();
    let messenger = Messenger::new();
    messenger
        .connect(
            &config.detector.url,
            Role::Client,
            Role::Detector,
            None,
            client.structure(),
        )
        .await
        .with_context(|| format!("failed to reach detector at {}", config.detector.url))?;

    let labels = client.detect_file(image, config.client.timeout()).await;
    messenger.stop().await;
    let labels = labels?;
    println!("{}", serde_json::to_string_pretty(&labels)?);
    Ok(())
}

/// Trainer components shared by the trainer and service deployments.
struct Trainer {
    structure: Arc<TrainerStructure>,
    model: Arc<ModelStore>,
    training_loop: TrainingLoop,
}

impl Trainer {
    async fn prepare(config: &Config) -> Result<Self> {
        let paths = &config.paths;

        let staging = Arc::new(StagingArea::new(&paths.temp_images));
        staging.create_dirs().await.context("failed to create staging directories")?;
        let training = Corpus::new(&paths.training);
        let validation = Corpus::new(&paths.validation);
        for corpus in [&training, &validation] {
            corpus
                .create_dirs()
                .await
                .with_context(|| format!("failed to create {}", corpus.root().display()))?;
        }
        create_dir(&paths.models).await?;

        DatasetDescriptor::new(
            training.images_dir(),
            validation.images_dir(),
            config.training.classes,
        )
        .write(&paths.dataset)
        .await?;

        let model = Arc::new(ModelStore::new(paths.models.join(TRAINING_MODEL)));
        let broadcaster = Arc::new(Broadcaster::new(model.clone()));
        let structure = Arc::new(trainer_structure(staging.clone(), broadcaster.clone()));

        let training_loop = TrainingLoop::new(
            staging,
            training,
            validation,
            model.clone(),
            tool_command(config, TRAIN_SCRIPT),
            training_settings(config),
        )
        .with_parser(config.output.format.parser())
        .publish_to(broadcaster);

        Ok(Self {
            structure,
            model,
            training_loop,
        })
    }

    async fn listen(&self, messenger: &Messenger, config: &Config) -> Result<()> {
        messenger
            .listen(
                config.trainer.image_source_bind,
                Role::ImageSource,
                self.structure.clone(),
            )
            .await?;
        messenger
            .listen(
                config.trainer.detector_bind,
                Role::Detector,
                self.structure.clone(),
            )
            .await?;
        Ok(())
    }
}

async fn inference(config: &Config, model: Arc<ModelStore>) -> Result<Inference> {
    create_dir(&config.paths.models).await?;
    let inference = Inference::new(
        model,
        tool_command(config, DETECT_SCRIPT),
        &config.paths.temp_images,
        config.training.image_size,
    )
    .with_parser(config.output.format.parser());
    inference
        .create_dirs()
        .await
        .with_context(|| format!("failed to create {}", inference.temp_dir().display()))?;
    Ok(inference)
}

pub(crate) fn training_settings(config: &Config) -> TrainingSettings {
    TrainingSettings {
        image_size: config.training.image_size,
        batch_size: config.training.batch_size,
        epochs: config.training.epochs,
        interval: std::time::Duration::from_secs(config.training.interval_secs),
    }
}

/// `sh <scripts>/<script>`, run in the tool directory if one is configured.
///
/// Paths handed to the tool must already be absolute; see
/// [`PathsConfig::make_absolute`](crate::config::PathsConfig::make_absolute).
pub(crate) fn tool_command(config: &Config, script: &str) -> ExternalCommand {
    let command = ExternalCommand::new(SHELL, config.paths.scripts.join(script));
    match &config.paths.tool_dir {
        Some(dir) => command.with_working_dir(dir),
        None => command,
    }
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))
}

/// Serve until interrupted, then stop training and close every connection.
///
/// If training ends on its own the connections stay up; detection and
/// uploads keep working until the process is told to stop.
async fn serve(
    messenger: Messenger,
    shutdown: watch::Sender<bool>,
    mut training: JoinHandle<Result<(), TrainingError>>,
) -> Result<()> {
    let mut training_finished = false;
    tokio::select! {
        joined = &mut training => {
            training_finished = true;
            log_training_exit(joined);
            shutdown_signal().await?;
        }
        signal = shutdown_signal() => signal?,
    }

    let _ = shutdown.send(true);
    if !training_finished {
        log_training_exit(training.await);
    }
    messenger.stop().await;
    Ok(())
}

fn log_training_exit(joined: Result<Result<(), TrainingError>, JoinError>) {
    match joined {
        Ok(Ok(())) => tracing::debug!("training task finished"),
        Ok(Err(e)) => tracing::error!("Training stopped: {}", e),
        Err(e) => tracing::error!("Training task failed: {}", e),
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => interrupted?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    Ok(())
}

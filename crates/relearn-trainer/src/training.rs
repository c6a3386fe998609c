//! The background training loop.
//!
//! Each cycle promotes whatever has been staged since the last cycle, runs
//! the external training command if both corpora have images, stores the
//! produced weights and hands them to every publisher. A failed cycle is
//! logged and the loop carries on; only unrecoverable storage errors end it.

use crate::broadcast::ModelPublisher;
use crate::corpus::Corpus;
use crate::error::TrainingError;
use crate::staging::StagingArea;
use relearn_core::artifacts::{self, ArtifactParser, Yolov5Markers};
use relearn_core::command::ExternalCommand;
use relearn_core::{ImageUsageType, ModelStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct TrainingSettings {
    pub image_size: u32,
    pub batch_size: u32,
    pub epochs: u32,
    pub interval: Duration,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            image_size: 640,
            batch_size: 16,
            epochs: 3,
            interval: Duration::from_secs(10),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The named corpus has no images yet; training was not attempted.
    Skipped {
        promoted: usize,
        empty: ImageUsageType,
    },
    Trained {
        promoted: usize,
        model_bytes: usize,
    },
}

pub struct TrainingLoop {
    staging: Arc<StagingArea>,
    training: Corpus,
    validation: Corpus,
    model: Arc<ModelStore>,
    command: ExternalCommand,
    parser: Box<dyn ArtifactParser>,
    publishers: Vec<Arc<dyn ModelPublisher>>,
    settings: TrainingSettings,
}

impl TrainingLoop {
    pub fn new(
        staging: Arc<StagingArea>,
        training: Corpus,
        validation: Corpus,
        model: Arc<ModelStore>,
        command: ExternalCommand,
        settings: TrainingSettings,
    ) -> Self {
        Self {
            staging,
            training,
            validation,
            model,
            command,
            parser: Box::new(Yolov5Markers),
            publishers: Vec::new(),
            settings,
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ArtifactParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Deliver every trained model to `publisher` as well.
    pub fn publish_to(mut self, publisher: Arc<dyn ModelPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    fn corpus(&self, usage: ImageUsageType) -> Option<&Corpus> {
        match usage {
            ImageUsageType::Training => Some(&self.training),
            ImageUsageType::Validation => Some(&self.validation),
            ImageUsageType::Detect => None,
        }
    }

    /// Move staged uploads into their corpora. Returns how many moved.
    ///
    /// Records that fail to move go back to the staging area for the next
    /// cycle, as does the rest of the batch when a fatal error stops the
    /// pass. A record whose image has left the holding area is dropped.
    async fn promote_staged(&self) -> Result<usize, TrainingError> {
        let mut staged = self.staging.drain().into_iter();
        let mut retry = Vec::new();
        let mut fatal = None;
        let mut promoted = 0;
        while let Some(record) = staged.next() {
            let Some(corpus) = self.corpus(record.usage) else {
                tracing::warn!(image = %record.id, "Staged {} image has no corpus", record.usage);
                continue;
            };
            match corpus.promote(&record).await {
                Ok(()) => promoted += 1,
                Err(e) if e.is_fatal() => {
                    retry.push(record);
                    retry.extend(staged.by_ref());
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    if tokio::fs::try_exists(&record.image_path).await.unwrap_or(false) {
                        tracing::warn!(image = %record.id, "Failed to promote, retrying next cycle: {}", e);
                        retry.push(record);
                    } else {
                        tracing::warn!(image = %record.id, "Failed to promote, dropping: {}", e);
                    }
                }
            }
        }

        if !retry.is_empty() {
            tracing::info!(count = retry.len(), "Requeued staged images");
            self.staging.requeue(retry);
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        if promoted > 0 {
            tracing::info!(promoted, "Promoted staged images");
        }
        Ok(promoted)
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome, TrainingError> {
        let promoted = self.promote_staged().await?;

        let prior_weights = if self.model.exists().await {
            tracing::debug!(path = %self.model.path().display(), "resuming from existing weights");
            self.model.path().display().to_string()
        } else {
            String::new()
        };

        for (usage, corpus) in [
            (ImageUsageType::Training, &self.training),
            (ImageUsageType::Validation, &self.validation),
        ] {
            if corpus.is_empty().await? {
                tracing::info!(dir = %corpus.images_dir().display(), "No {} images yet, skipping training", usage);
                return Ok(CycleOutcome::Skipped {
                    promoted,
                    empty: usage,
                });
            }
        }

        let settings = &self.settings;
        tracing::info!(
            image_size = settings.image_size,
            batch_size = settings.batch_size,
            epochs = settings.epochs,
            "Training started"
        );
        let output = self
            .command
            .run([
                settings.image_size.to_string(),
                settings.batch_size.to_string(),
                settings.epochs.to_string(),
                prior_weights,
            ])
            .await?;
        if !output.success() {
            return Err(TrainingError::Exited {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let weights = self
            .parser
            .trained_weights(&output.stdout)
            .ok_or(TrainingError::MissingWeights {
                parser: self.parser.name(),
            })?;
        let weights = match self.command.working_dir() {
            Some(dir) => artifacts::resolve(dir, &weights),
            None => weights,
        };
        let model_bytes = tokio::fs::read(&weights)
            .await
            .map_err(|e| TrainingError::storage(&weights, e))?;
        self.model.replace(&model_bytes).await?;
        tracing::info!(weights = %weights.display(), bytes = model_bytes.len(), "Training finished");

        for publisher in &self.publishers {
            publisher.publish(&model_bytes).await;
        }
        Ok(CycleOutcome::Trained {
            promoted,
            model_bytes: model_bytes.len(),
        })
    }

    /// Run cycles until `shutdown` flips or an unrecoverable error occurs.
    ///
    /// A training run in progress at shutdown is killed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TrainingError> {
        while !*shutdown.borrow() {
            tokio::select! {
                outcome = self.run_cycle() => match outcome {
                    Ok(outcome) => tracing::debug!(?outcome, "training cycle finished"),
                    Err(e) if e.is_fatal() => {
                        tracing::error!("Training loop stopped: {}", e);
                        return Err(e);
                    }
                    Err(e) => tracing::warn!("Training cycle failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Training loop stopped");
        Ok(())
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), TrainingError>> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use relearn_core::artifacts::JsonResult;
    use relearn_core::{Outbox, Peer, PeerId, Role, TrainerMessage};
    use std::path::{Path, PathBuf};

    /// Writes `weights-<epochs>-<prior>` as last.pt and prints the yolov5 marker.
    const TRAIN_SCRIPT: &str = r#"
out="$(dirname "$0")/runs/train/exp/weights"
mkdir -p "$out"
printf 'weights-%s-%s' "$3" "$4" > "$out/last.pt"
echo "Optimizer stripped from $out/last.pt, 14.4MB"
echo "Optimizer stripped from $out/best.pt, 14.4MB"
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        staging: Arc<StagingArea>,
        training: Corpus,
        validation: Corpus,
        model: Arc<ModelStore>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let staging = Arc::new(StagingArea::new(dir.path().join("temp_images")));
            staging.create_dirs().await.unwrap();
            let training = Corpus::new(dir.path().join("training"));
            let validation = Corpus::new(dir.path().join("validation"));
            training.create_dirs().await.unwrap();
            validation.create_dirs().await.unwrap();
            let model = Arc::new(ModelStore::new(dir.path().join("training.pt")));
            Self {
                dir,
                staging,
                training,
                validation,
                model,
            }
        }

        fn script(&self, body: &str) -> PathBuf {
            let path = self.dir.path().join("train.sh");
            std::fs::write(&path, body).unwrap();
            path
        }

        fn training_loop(&self, script: &Path) -> TrainingLoop {
            TrainingLoop::new(
                self.staging.clone(),
                self.training.clone(),
                self.validation.clone(),
                self.model.clone(),
                ExternalCommand::new("sh", script),
                TrainingSettings {
                    interval: Duration::from_millis(10),
                    ..TrainingSettings::default()
                },
            )
        }

        async fn upload(&self, usage: ImageUsageType) -> uuid::Uuid {
            self.staging
                .accept_upload(b"img", "jpg", b"0 0.5 0.5 0.1 0.1", usage)
                .await
                .unwrap()
                .id
        }
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn detector() -> (Peer<TrainerMessage>, Outbox<TrainerMessage>) {
        Peer::channel(PeerId::new(), Role::Detector)
    }

    #[tokio::test]
    async fn cycle_promotes_trains_and_broadcasts() {
        let fx = Fixture::new().await;
        let train_id = fx.upload(ImageUsageType::Training).await;
        let val_id = fx.upload(ImageUsageType::Validation).await;

        let broadcaster = Arc::new(Broadcaster::new(fx.model.clone()));
        let (a, mut a_rx) = detector();
        let (b, mut b_rx) = detector();
        broadcaster.register(a).await.unwrap();
        broadcaster.register(b).await.unwrap();

        let script = fx.script(TRAIN_SCRIPT);
        let training_loop = fx.training_loop(&script).publish_to(broadcaster.clone());
        let outcome = training_loop.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Trained { promoted: 2, .. }));

        assert_eq!(files(&fx.training.images_dir()), vec![format!("{train_id}.jpg")]);
        assert_eq!(files(&fx.training.labels_dir()), vec![format!("{train_id}.txt")]);
        assert_eq!(files(&fx.validation.images_dir()), vec![format!("{val_id}.jpg")]);
        assert_eq!(files(&fx.validation.labels_dir()), vec![format!("{val_id}.txt")]);
        assert!(files(&fx.staging.holding_dir(ImageUsageType::Training)).is_empty());
        assert_eq!(fx.staging.available_len(), 0);

        let model = fx.model.read().await.unwrap().unwrap();
        assert_eq!(model, b"weights-3-");
        for rx in [&mut a_rx, &mut b_rx] {
            match rx.try_recv().unwrap().message {
                TrainerMessage::UpdateModelBroadcast { model_bytes } => {
                    assert_eq!(model_bytes, model)
                }
                other => panic!("unexpected message {other:?}"),
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn second_cycle_resumes_from_prior_weights() {
        let fx = Fixture::new().await;
        fx.upload(ImageUsageType::Training).await;
        fx.upload(ImageUsageType::Validation).await;
        let script = fx.script(TRAIN_SCRIPT);
        let training_loop = fx.training_loop(&script);

        training_loop.run_cycle().await.unwrap();
        training_loop.run_cycle().await.unwrap();

        let expected = format!("weights-3-{}", fx.model.path().display());
        assert_eq!(
            fx.model.read().await.unwrap().unwrap(),
            expected.into_bytes()
        );
    }

    #[tokio::test]
    async fn empty_validation_corpus_skips_training() {
        let fx = Fixture::new().await;
        fx.upload(ImageUsageType::Training).await;
        let marker = fx.dir.path().join("ran");
        let script = fx.script(&format!("touch {}\n", marker.display()));

        let outcome = fx.training_loop(&script).run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Skipped {
                promoted: 1,
                empty: ImageUsageType::Validation
            }
        );
        assert!(!marker.exists());
        assert!(!fx.model.exists().await);
    }

    #[tokio::test]
    async fn missing_marker_is_a_failed_run() {
        let fx = Fixture::new().await;
        fx.upload(ImageUsageType::Training).await;
        fx.upload(ImageUsageType::Validation).await;
        let script = fx.script("echo 'CUDA out of memory'\n");

        let err = fx.training_loop(&script).run_cycle().await.unwrap_err();
        assert!(matches!(err, TrainingError::MissingWeights { .. }));
        assert!(!err.is_fatal());
        assert!(!fx.model.exists().await);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failed_run_even_with_marker() {
        let fx = Fixture::new().await;
        fx.upload(ImageUsageType::Training).await;
        fx.upload(ImageUsageType::Validation).await;
        let script = fx.script(&format!("{TRAIN_SCRIPT}\necho boom >&2\nexit 2\n"));

        let err = fx.training_loop(&script).run_cycle().await.unwrap_err();
        match err {
            TrainingError::Exited { exit_code, stderr } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!fx.model.exists().await);
    }

    #[tokio::test]
    async fn json_contract_with_relative_path() {
        let fx = Fixture::new().await;
        fx.upload(ImageUsageType::Training).await;
        fx.upload(ImageUsageType::Validation).await;
        let workdir = fx.dir.path().join("tool");
        std::fs::create_dir(&workdir).unwrap();
        let script = fx.script(
            "mkdir -p out && printf json > out/w.pt\necho '{\"weights\": \"out/w.pt\"}'\n",
        );

        let training_loop = TrainingLoop::new(
            fx.staging.clone(),
            fx.training.clone(),
            fx.validation.clone(),
            fx.model.clone(),
            ExternalCommand::new("sh", &script).with_working_dir(&workdir),
            TrainingSettings::default(),
        )
        .with_parser(Box::new(JsonResult));
        training_loop.run_cycle().await.unwrap();
        assert_eq!(fx.model.read().await.unwrap().unwrap(), b"json");
    }

    #[tokio::test]
    async fn each_upload_is_promoted_exactly_once() {
        let fx = Fixture::new().await;
        let script = fx.script(TRAIN_SCRIPT);
        let training_loop = Arc::new(fx.training_loop(&script));

        let uploader = {
            let staging = fx.staging.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..20 {
                    let usage = if i % 2 == 0 {
                        ImageUsageType::Training
                    } else {
                        ImageUsageType::Validation
                    };
                    let record = staging.accept_upload(b"i", "png", b"a", usage).await.unwrap();
                    ids.push(format!("{}.png", record.id));
                    tokio::task::yield_now().await;
                }
                ids
            })
        };
        for _ in 0..5 {
            let _ = training_loop.run_cycle().await;
        }
        let mut ids = uploader.await.unwrap();
        training_loop.run_cycle().await.unwrap();

        let mut promoted = files(&fx.training.images_dir());
        promoted.extend(files(&fx.validation.images_dir()));
        promoted.sort();
        ids.sort();
        assert_eq!(promoted, ids);
        assert_eq!(fx.staging.available_len(), 0);
        assert!(files(&fx.staging.holding_dir(ImageUsageType::Validation)).is_empty());
    }

    #[tokio::test]
    async fn failed_promotion_is_retried_next_cycle() {
        let fx = Fixture::new().await;
        std::fs::remove_dir_all(fx.validation.root()).unwrap();
        let train_id = fx.upload(ImageUsageType::Training).await;
        let val_id = fx.upload(ImageUsageType::Validation).await;
        let script = fx.script(TRAIN_SCRIPT);
        let training_loop = fx.training_loop(&script);

        let outcome = training_loop.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Skipped {
                promoted: 1,
                empty: ImageUsageType::Validation
            }
        );
        assert_eq!(files(&fx.training.images_dir()), vec![format!("{train_id}.jpg")]);
        assert_eq!(fx.staging.available_len(), 1);
        assert_eq!(
            files(&fx.staging.holding_dir(ImageUsageType::Validation)),
            vec![format!("{val_id}.jpg"), format!("{val_id}.txt")]
        );

        fx.validation.create_dirs().await.unwrap();
        let outcome = training_loop.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Trained { promoted: 1, .. }));
        assert_eq!(files(&fx.validation.images_dir()), vec![format!("{val_id}.jpg")]);
        assert_eq!(files(&fx.validation.labels_dir()), vec![format!("{val_id}.txt")]);
        assert_eq!(fx.staging.available_len(), 0);
    }

    #[tokio::test]
    async fn vanished_staged_image_is_dropped() {
        let fx = Fixture::new().await;
        fx.upload(ImageUsageType::Training).await;
        for entry in std::fs::read_dir(fx.staging.holding_dir(ImageUsageType::Training)).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }
        let script = fx.script(TRAIN_SCRIPT);

        let outcome = fx.training_loop(&script).run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped { promoted: 0, .. }));
        assert_eq!(fx.staging.available_len(), 0);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let fx = Fixture::new().await;
        let script = fx.script(TRAIN_SCRIPT);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = fx.training_loop(&script).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

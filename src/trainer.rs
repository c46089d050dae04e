//! Single-run training.
//!
//! One [`SingleRunTrainer`] owns the epoch loop for one (fold, run): it
//! initializes the run state according to an [`InitStrategy`], alternates
//! training and validation passes, keeps the "latest" and "best" checkpoint
//! slots current, and honors cooperative interruption at epoch boundaries.

use crate::checkpoint::{load_weights, CheckpointManager, CheckpointRecord};
use crate::evaluator::{run_epoch, TaskMetrics};
use crate::logging::{ConsoleLogger, MetricLogger};
use crate::loss::{resolve_loss, Loss};
use crate::model::PropertyModel;
use crate::optimizer::{resolve_optimizer, Optimizer};
use crate::scheduler::{LrScheduler, MultiStepLrScheduler};
use crate::{
    DataLoader, InitStrategy, Normalizer, RunIdentity, TaskType, TrainResult, TrainerConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative interruption handle.
///
/// Cloning shares the flag, so one handle can be wired to a signal handler
/// while its clones sit inside trainers. The flag is only consulted at epoch
/// boundaries; an interrupted run always leaves a complete checkpoint behind.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether interruption has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Outcome of one training run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    /// Identity of the run.
    pub ident: RunIdentity,
    /// Epochs actually completed in this invocation.
    pub epochs_run: usize,
    /// Best watched validation score seen (lower is better).
    pub best_metric: f64,
    /// Whether the run stopped on an interruption request.
    pub interrupted: bool,
}

struct RunState {
    criterion: Box<dyn Loss>,
    optimizer: Box<dyn Optimizer>,
    scheduler: MultiStepLrScheduler,
    normalizer: Normalizer,
    start_epoch: usize,
    best_metric: f64,
}

/// Trains one model on one (fold, run).
pub struct SingleRunTrainer {
    config: TrainerConfig,
    ident: RunIdentity,
    checkpoints: CheckpointManager,
    interrupt: InterruptFlag,
    logger: Box<dyn MetricLogger>,
}

impl SingleRunTrainer {
    /// Create a trainer. The config is validated up front so a bad one never
    /// reaches the epoch loop.
    pub fn new(config: TrainerConfig, ident: RunIdentity) -> TrainResult<Self> {
        config.validate()?;
        let checkpoints =
            CheckpointManager::new(&config.checkpoint_dir, ident, config.gzip_checkpoints);
        Ok(Self {
            config,
            ident,
            checkpoints,
            interrupt: InterruptFlag::new(),
            logger: Box::new(ConsoleLogger),
        })
    }

    /// Replace the metric logger.
    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Share an externally controlled interruption flag.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Handle to this trainer's interruption flag.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Checkpoint slots of this run.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    fn fit_normalizer(&self, train_loader: &dyn DataLoader) -> TrainResult<Normalizer> {
        match self.config.task {
            // Classification targets are class indices and never normalized.
            TaskType::Classification => Ok(Normalizer::identity()),
            TaskType::Regression => {
                let targets: Vec<f64> = train_loader
                    .batches()
                    .flat_map(|batch| batch.targets.to_vec())
                    .collect();
                Normalizer::fit_with_fallback(&targets)
            }
        }
    }

    /// Validation score of the model as initialized. Seeds `best_metric` so
    /// the "best" slot is only overwritten by a genuine improvement.
    fn initial_score<M: PropertyModel>(
        &self,
        model: &mut M,
        criterion: &dyn Loss,
        normalizer: &Normalizer,
        val_loader: &dyn DataLoader,
    ) -> TrainResult<f64> {
        let metrics = run_epoch(model, val_loader, criterion, None, normalizer, &self.config)?;
        Ok(metrics.score())
    }

    fn initialize<M: PropertyModel>(
        &self,
        model: &mut M,
        init: &InitStrategy,
        seed: u64,
        train_loader: &dyn DataLoader,
        val_loader: &dyn DataLoader,
    ) -> TrainResult<RunState> {
        let criterion = resolve_loss(self.config.loss, self.config.robust, self.config.n_classes);
        let mut optimizer = resolve_optimizer(&self.config);
        let mut scheduler = MultiStepLrScheduler::new(
            self.config.learning_rate,
            self.config.milestones.clone(),
            self.config.gamma,
        );

        let (normalizer, start_epoch, best_metric) = match init {
            InitStrategy::Fresh => {
                let normalizer = self.fit_normalizer(train_loader)?;
                let best =
                    self.initial_score(model, criterion.as_ref(), &normalizer, val_loader)?;
                (normalizer, 0, best)
            }
            InitStrategy::Resume => {
                let record = self.checkpoints.load_latest()?;
                model.load_state_dict(record.model_state)?;
                optimizer.load_state_dict(record.optimizer_state)?;
                scheduler.load_state_dict(record.scheduler_state);
                optimizer.set_lr(scheduler.get_lr());
                log::info!(
                    "run {}: resumed from epoch {} (best {:.6})",
                    self.ident,
                    record.epoch,
                    record.best_metric
                );
                (record.normalizer, record.epoch, record.best_metric)
            }
            InitStrategy::FineTune(path) => {
                model.load_state_dict(load_weights(path)?)?;
                log::info!("run {}: fine-tuning from {}", self.ident, path.display());
                let normalizer = self.fit_normalizer(train_loader)?;
                let best =
                    self.initial_score(model, criterion.as_ref(), &normalizer, val_loader)?;
                (normalizer, 0, best)
            }
            InitStrategy::Transfer(path) => {
                model.load_state_dict(load_weights(path)?)?;
                model.freeze_all();
                model.replace_output_head(self.config.output_dim(), seed)?;
                log::info!(
                    "run {}: transfer from {}, training the output head only",
                    self.ident,
                    path.display()
                );
                let normalizer = self.fit_normalizer(train_loader)?;
                let best =
                    self.initial_score(model, criterion.as_ref(), &normalizer, val_loader)?;
                (normalizer, 0, best)
            }
        };

        Ok(RunState {
            criterion,
            optimizer,
            scheduler,
            normalizer,
            start_epoch,
            best_metric,
        })
    }

    fn log_metrics(
        &mut self,
        prefix: &str,
        metrics: &TaskMetrics,
        epoch: usize,
    ) -> TrainResult<()> {
        match metrics {
            TaskMetrics::Regression { loss, mae, rmse } => {
                self.logger.log_scalar(&format!("{}/loss", prefix), *loss, epoch)?;
                self.logger.log_scalar(&format!("{}/mae", prefix), *mae, epoch)?;
                self.logger.log_scalar(&format!("{}/rmse", prefix), *rmse, epoch)?;
            }
            TaskMetrics::Classification { loss, accuracy, auc } => {
                self.logger.log_scalar(&format!("{}/loss", prefix), *loss, epoch)?;
                self.logger
                    .log_scalar(&format!("{}/accuracy", prefix), *accuracy, epoch)?;
                self.logger.log_scalar(&format!("{}/auc", prefix), *auc, epoch)?;
            }
        }
        Ok(())
    }

    /// Train `model` for `config.epochs` further epochs.
    ///
    /// The metric logger is flushed on every exit path, interrupted and
    /// failed runs included.
    pub fn train<M: PropertyModel>(
        &mut self,
        model: &mut M,
        init: &InitStrategy,
        seed: u64,
        train_loader: &dyn DataLoader,
        val_loader: &dyn DataLoader,
    ) -> TrainResult<RunSummary> {
        let result = self.train_inner(model, init, seed, train_loader, val_loader);
        let flush_result = self.logger.flush();
        let summary = result?;
        flush_result?;
        Ok(summary)
    }

    fn train_inner<M: PropertyModel>(
        &mut self,
        model: &mut M,
        init: &InitStrategy,
        seed: u64,
        train_loader: &dyn DataLoader,
        val_loader: &dyn DataLoader,
    ) -> TrainResult<RunSummary> {
        let mut state = self.initialize(model, init, seed, train_loader, val_loader)?;
        log::info!(
            "run {}: {} trainable parameters, starting at epoch {} (best {:.6})",
            self.ident,
            model.num_trainable_parameters(),
            state.start_epoch,
            state.best_metric
        );

        // Both slots exist from run start: a run whose validation never
        // improves on the seeded baseline must still leave a loadable "best".
        if !self.checkpoints.best_path().exists() {
            let record = CheckpointRecord {
                epoch: state.start_epoch,
                model_state: model.state_dict(),
                optimizer_state: state.optimizer.state_dict(),
                scheduler_state: state.scheduler.state_dict(),
                normalizer: state.normalizer.clone(),
                best_metric: state.best_metric,
                config: self.config.clone(),
            };
            self.checkpoints.save(&record, true)?;
        }

        let mut epochs_run = 0;
        let mut interrupted = false;

        for epoch in state.start_epoch..state.start_epoch + self.config.epochs {
            if self.interrupt.is_interrupted() {
                log::warn!("run {}: interrupted before epoch {}", self.ident, epoch);
                interrupted = true;
                break;
            }

            let train_metrics = run_epoch(
                model,
                train_loader,
                state.criterion.as_ref(),
                Some(state.optimizer.as_mut()),
                &state.normalizer,
                &self.config,
            )?;
            self.log_metrics("train", &train_metrics, epoch)?;

            let val_metrics = run_epoch(
                model,
                val_loader,
                state.criterion.as_ref(),
                None,
                &state.normalizer,
                &self.config,
            )?;
            self.log_metrics("validation", &val_metrics, epoch)?;
            self.logger
                .log_scalar("train/learning_rate", state.optimizer.get_lr(), epoch)?;

            let score = val_metrics.score();
            let is_best = score < state.best_metric;
            if is_best {
                state.best_metric = score;
            }

            // The record names epoch + 1, so it must carry the scheduler
            // state as it stands entering that epoch.
            state.scheduler.step(state.optimizer.as_mut());

            let record = CheckpointRecord {
                epoch: epoch + 1,
                model_state: model.state_dict(),
                optimizer_state: state.optimizer.state_dict(),
                scheduler_state: state.scheduler.state_dict(),
                normalizer: state.normalizer.clone(),
                best_metric: state.best_metric,
                config: self.config.clone(),
            };
            self.checkpoints.save(&record, is_best)?;
            epochs_run += 1;
        }

        Ok(RunSummary {
            ident: self.ident,
            epochs_run,
            best_metric: state.best_metric,
            interrupted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MlpModel;
    use crate::InMemoryDataLoader;
    use ndarray::{Array1, Array2};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("matprop-train-{}-{}", tag, nanos));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn loaders() -> (InMemoryDataLoader, InMemoryDataLoader) {
        let inputs = Array2::from_shape_fn((24, 1), |(i, _)| i as f64 / 24.0);
        let targets = Array1::from_iter((0..24).map(|i| 2.0 * i as f64 / 24.0 + 0.5));
        let train = InMemoryDataLoader::from_arrays(inputs, targets, 8).unwrap();

        let inputs = Array2::from_shape_fn((8, 1), |(i, _)| (i as f64 + 0.5) / 8.0);
        let targets = Array1::from_iter((0..8).map(|i| 2.0 * (i as f64 + 0.5) / 8.0 + 0.5));
        let val = InMemoryDataLoader::from_arrays(inputs, targets, 8).unwrap();
        (train, val)
    }

    fn small_config(dir: &PathBuf, epochs: usize) -> TrainerConfig {
        TrainerConfig {
            epochs,
            learning_rate: 0.01,
            checkpoint_dir: dir.clone(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_run_trains_and_checkpoints() {
        let dir = temp_dir("fresh");
        let config = small_config(&dir, 3);
        let ident = RunIdentity::new(0, 0);
        let mut trainer = SingleRunTrainer::new(config, ident).unwrap();

        let (train, val) = loaders();
        let mut model = MlpModel::new(1, 8, 2, 0);
        let summary = trainer
            .train(&mut model, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();

        assert_eq!(summary.epochs_run, 3);
        assert!(!summary.interrupted);
        assert!(trainer.checkpoints().latest_path().exists());
        assert!(trainer.checkpoints().best_path().exists());

        let record = trainer.checkpoints().load_latest().unwrap();
        assert_eq!(record.epoch, 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resume_continues_epoch_counter() {
        let dir = temp_dir("resume");
        let ident = RunIdentity::new(0, 0);
        let (train, val) = loaders();

        let mut model = MlpModel::new(1, 8, 2, 0);
        let mut trainer = SingleRunTrainer::new(small_config(&dir, 2), ident).unwrap();
        trainer
            .train(&mut model, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();

        let mut trainer = SingleRunTrainer::new(small_config(&dir, 2), ident).unwrap();
        let summary = trainer
            .train(&mut model, &InitStrategy::Resume, 0, &train, &val)
            .unwrap();
        assert_eq!(summary.epochs_run, 2);

        let record = trainer.checkpoints().load_latest().unwrap();
        assert_eq!(record.epoch, 4);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_interrupt_before_first_epoch_stops_immediately() {
        let dir = temp_dir("interrupt");
        let ident = RunIdentity::new(0, 0);
        let mut trainer = SingleRunTrainer::new(small_config(&dir, 5), ident).unwrap();
        trainer.interrupt_flag().interrupt();

        let (train, val) = loaders();
        let mut model = MlpModel::new(1, 8, 2, 0);
        let summary = trainer
            .train(&mut model, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.epochs_run, 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_transfer_keeps_trunk_frozen() {
        let dir = temp_dir("transfer");
        let ident = RunIdentity::new(0, 0);
        let (train, val) = loaders();

        // Source run to produce a checkpoint.
        let mut source = MlpModel::new(1, 8, 2, 0);
        let mut trainer = SingleRunTrainer::new(small_config(&dir, 1), ident).unwrap();
        trainer
            .train(&mut source, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();
        let source_path = trainer.checkpoints().best_path();

        let mut target = MlpModel::new(1, 8, 2, 1);
        let target_dir = temp_dir("transfer-target");
        let mut trainer =
            SingleRunTrainer::new(small_config(&target_dir, 2), ident).unwrap();
        trainer
            .train(
                &mut target,
                &InitStrategy::Transfer(source_path.clone()),
                7,
                &train,
                &val,
            )
            .unwrap();

        // The trunk must be bit-identical to the source checkpoint.
        let source_weights = crate::checkpoint::load_weights(&source_path).unwrap();
        let trunk: Vec<f64> = target.parameters()["trunk_weight"].iter().copied().collect();
        assert_eq!(trunk, source_weights["trunk_weight"]);

        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::remove_dir_all(&target_dir).unwrap();
    }

    #[test]
    fn test_resume_across_milestone_matches_uninterrupted_run() {
        let dir_a = temp_dir("milestone-cont");
        let dir_b = temp_dir("milestone-resume");
        let ident = RunIdentity::new(0, 0);
        let (train, val) = loaders();

        let config = |dir: &PathBuf, epochs| TrainerConfig {
            epochs,
            learning_rate: 0.05,
            milestones: vec![1],
            checkpoint_dir: dir.clone(),
            ..Default::default()
        };

        // Two epochs straight through the milestone.
        let mut continuous = MlpModel::new(1, 8, 2, 0);
        SingleRunTrainer::new(config(&dir_a, 2), ident)
            .unwrap()
            .train(&mut continuous, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();

        // One epoch, then resume for the second.
        let mut resumed = MlpModel::new(1, 8, 2, 0);
        SingleRunTrainer::new(config(&dir_b, 1), ident)
            .unwrap()
            .train(&mut resumed, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();
        SingleRunTrainer::new(config(&dir_b, 1), ident)
            .unwrap()
            .train(&mut resumed, &InitStrategy::Resume, 0, &train, &val)
            .unwrap();

        let a = CheckpointManager::new(&dir_a, ident, false).load_latest().unwrap();
        let b = CheckpointManager::new(&dir_b, ident, false).load_latest().unwrap();
        assert_eq!(a.epoch, b.epoch);
        assert_eq!(a.scheduler_state, b.scheduler_state);
        assert_eq!(a.model_state, b.model_state);

        std::fs::remove_dir_all(&dir_a).unwrap();
        std::fs::remove_dir_all(&dir_b).unwrap();
    }

    #[test]
    fn test_best_slot_exists_from_run_start() {
        let dir = temp_dir("baseline-best");
        let ident = RunIdentity::new(0, 0);
        let (train, val) = loaders();

        // Zero epochs: no chance to improve on the seeded baseline.
        let mut model = MlpModel::new(1, 8, 2, 0);
        let mut trainer = SingleRunTrainer::new(small_config(&dir, 0), ident).unwrap();
        let summary = trainer
            .train(&mut model, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();
        assert_eq!(summary.epochs_run, 0);

        let best = trainer.checkpoints().load_best().unwrap();
        assert_eq!(best.epoch, 0);
        assert!((best.best_metric - summary.best_metric).abs() < 1e-12);
        assert!(trainer.checkpoints().load_latest().is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_best_checkpoint_tracks_watched_metric() {
        let dir = temp_dir("best-metric");
        let ident = RunIdentity::new(0, 0);
        let (train, val) = loaders();

        let mut model = MlpModel::new(1, 8, 2, 0);
        let mut trainer = SingleRunTrainer::new(small_config(&dir, 5), ident).unwrap();
        let summary = trainer
            .train(&mut model, &InitStrategy::Fresh, 0, &train, &val)
            .unwrap();

        let best = trainer.checkpoints().load_best().unwrap();
        assert!((best.best_metric - summary.best_metric).abs() < 1e-12);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

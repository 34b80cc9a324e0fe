//! Demo backend: paces epochs with a timer and produces monotonically
//! improving loss and accuracy.
//!
//! Loss follows `2.3 * e^(-k * epoch) + 0.05` and accuracy rises toward
//! 0.98 from chance level, where `k` grows with the learning rate and
//! shrinks with the batch size. Validation figures trail the training ones.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use kiln_core::task::TaskError;
use kiln_core::training::{EpochMetrics, TrainingConfig, TrainingSummary};

use super::{BackendFactory, Dataset, EvaluationReport, TrainingBackend};

const BASE_DECAY: f64 = 0.35;
const INITIAL_LOSS: f64 = 2.3;
const LOSS_FLOOR: f64 = 0.05;
const ACCURACY_CEILING: f64 = 0.98;

pub struct SimulatedBackendFactory {
    epoch_interval: Duration,
}

impl SimulatedBackendFactory {
    pub fn new(epoch_interval: Duration) -> Self {
        Self { epoch_interval }
    }
}

impl BackendFactory for SimulatedBackendFactory {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn create(&self) -> Result<Box<dyn TrainingBackend>, TaskError> {
        Ok(Box::new(SimulatedBackend::new(self.epoch_interval)))
    }
}

pub struct SimulatedBackend {
    epoch_interval: Duration,
    num_classes: Option<u32>,
    stop: AtomicBool,
    /// Final (loss, accuracy) of the last training run.
    trained: Cell<Option<(f64, f64)>>,
}

impl SimulatedBackend {
    pub fn new(epoch_interval: Duration) -> Self {
        Self {
            epoch_interval,
            num_classes: None,
            stop: AtomicBool::new(false),
            trained: Cell::new(None),
        }
    }

    fn chance(&self) -> f64 {
        1.0 / f64::from(self.num_classes.unwrap_or(2).max(1))
    }
}

/// Convergence rate for a config. Larger learning rates and smaller
/// batches converge faster in this model.
fn decay_rate(config: &TrainingConfig) -> f64 {
    let lr_factor = (config.learning_rate / 0.001).clamp(0.1, 10.0).sqrt();
    let batch_factor = (32.0 / f64::from(config.batch_size.max(1)))
        .clamp(0.25, 4.0)
        .powf(0.25);
    BASE_DECAY * lr_factor * batch_factor
}

fn epoch_metrics(epoch: u32, decay: f64, chance: f64) -> EpochMetrics {
    let e = f64::from(epoch);
    let loss = INITIAL_LOSS * (-decay * e).exp() + LOSS_FLOOR;
    let accuracy = ACCURACY_CEILING - (ACCURACY_CEILING - chance) * (-decay * 0.85 * e).exp();
    EpochMetrics {
        epoch,
        loss,
        accuracy,
        validation_loss: Some(loss * 1.08),
        validation_accuracy: Some(accuracy * 0.97),
        timestamp: Utc::now(),
    }
}

impl TrainingBackend for SimulatedBackend {
    fn initialize(&mut self, num_classes: u32) -> Result<(), TaskError> {
        if num_classes < 2 {
            return Err(TaskError::Backend(format!(
                "need at least 2 classes, got {num_classes}"
            )));
        }
        self.num_classes = Some(num_classes);
        self.stop.store(false, Ordering::Release);
        Ok(())
    }

    fn train(
        &self,
        config: &TrainingConfig,
        dataset: &Dataset,
        on_progress: &mut dyn FnMut(&EpochMetrics),
    ) -> Result<TrainingSummary, TaskError> {
        if self.num_classes.is_none() {
            return Err(TaskError::Backend("backend not initialized".into()));
        }
        if dataset.train.is_empty() {
            return Err(TaskError::Dataset(format!(
                "dataset {} has no training samples",
                dataset.dataset_id
            )));
        }

        let decay = decay_rate(config);
        let chance = self.chance();
        let mut summary = TrainingSummary::default();

        for epoch in 1..=config.epochs {
            if self.stop.load(Ordering::Acquire) {
                summary.stopped = true;
                break;
            }
            if !self.epoch_interval.is_zero() {
                thread::sleep(self.epoch_interval);
            }
            let metrics = epoch_metrics(epoch, decay, chance);
            on_progress(&metrics);
            summary.record(&metrics);
        }

        if let (Some(loss), Some(acc)) = (summary.final_loss, summary.final_accuracy) {
            self.trained.set(Some((loss, acc)));
        }
        Ok(summary)
    }

    fn evaluate(&self, dataset: &Dataset) -> Result<EvaluationReport, TaskError> {
        if self.num_classes.is_none() {
            return Err(TaskError::Backend("backend not initialized".into()));
        }
        if dataset.validation.is_empty() {
            return Err(TaskError::Dataset(format!(
                "dataset {} has no validation samples",
                dataset.dataset_id
            )));
        }
        let (loss, accuracy) = match self.trained.get() {
            Some((loss, acc)) => (loss * 1.08, acc * 0.97),
            None => (INITIAL_LOSS + LOSS_FLOOR, self.chance()),
        };
        Ok(EvaluationReport {
            loss,
            accuracy,
            samples: dataset.validation.len(),
        })
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn dispose(&mut self) {
        self.num_classes = None;
        self.trained.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DatasetLoader, SyntheticDatasetLoader};

    fn dataset() -> Dataset {
        SyntheticDatasetLoader::default().load(3).unwrap()
    }

    #[test]
    fn metrics_improve_every_epoch() {
        let mut backend = SimulatedBackend::new(Duration::ZERO);
        backend.initialize(4).unwrap();
        let mut seen = Vec::new();
        let config = TrainingConfig {
            epochs: 6,
            ..Default::default()
        };
        let summary = backend
            .train(&config, &dataset(), &mut |m| seen.push(m.clone()))
            .unwrap();

        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|w| w[1].loss < w[0].loss));
        assert!(seen.windows(2).all(|w| w[1].accuracy > w[0].accuracy));
        assert_eq!(summary.final_epoch, 6);
        assert!(!summary.stopped);
    }

    #[test]
    fn stop_ends_within_one_epoch() {
        let mut backend = SimulatedBackend::new(Duration::ZERO);
        backend.initialize(2).unwrap();
        let config = TrainingConfig {
            epochs: 50,
            ..Default::default()
        };
        let b = &backend;
        let summary = b
            .train(&config, &dataset(), &mut |m| {
                if m.epoch == 2 {
                    b.stop();
                }
            })
            .unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.final_epoch, 2);
    }

    #[test]
    fn train_requires_initialize() {
        let backend = SimulatedBackend::new(Duration::ZERO);
        let result = backend.train(&TrainingConfig::default(), &dataset(), &mut |_| {});
        assert!(matches!(result, Err(TaskError::Backend(_))));
    }

    #[test]
    fn higher_learning_rate_converges_faster() {
        let slow = TrainingConfig {
            learning_rate: 0.0005,
            ..Default::default()
        };
        let fast = TrainingConfig {
            learning_rate: 0.005,
            ..Default::default()
        };
        assert!(decay_rate(&fast) > decay_rate(&slow));
    }

    #[test]
    fn evaluate_uses_trained_state() {
        let mut backend = SimulatedBackend::new(Duration::ZERO);
        backend.initialize(4).unwrap();
        let ds = dataset();
        let fresh = backend.evaluate(&ds).unwrap();
        assert_eq!(fresh.accuracy, 0.25);

        backend
            .train(&TrainingConfig::default(), &ds, &mut |_| {})
            .unwrap();
        let trained = backend.evaluate(&ds).unwrap();
        assert!(trained.accuracy > fresh.accuracy);
        assert_eq!(trained.samples, ds.validation.len());
    }
}

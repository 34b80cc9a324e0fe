//! Task executor for the four ML task kinds.
//!
//! Runs on worker threads. Every kind loads its dataset through the
//! injected [`DatasetLoader`] and, where a model is needed, creates a fresh
//! backend from the [`BackendFactory`], always disposing it afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_core::task::{TaskError, TaskKind, TaskRequest};
use kiln_core::training::{EpochMetrics, TrainingConfig, TrainingSummary};
use kiln_core::types::DbId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::{BackendFactory, Dataset, DatasetLoader, Split, TrainingBackend};
use crate::executor::{TaskContext, TaskExecutor};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainPayload {
    pub dataset_id: DbId,
    #[serde(default)]
    pub config: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetPayload {
    pub dataset_id: DbId,
}

fn default_learning_rates() -> Vec<f64> {
    vec![0.0005, 0.001, 0.005]
}

fn default_batch_sizes() -> Vec<u32> {
    vec![16, 32, 64]
}

fn default_trial_epochs() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizePayload {
    pub dataset_id: DbId,
    #[serde(default = "default_learning_rates")]
    pub learning_rates: Vec<f64>,
    #[serde(default = "default_batch_sizes")]
    pub batch_sizes: Vec<u32>,
    #[serde(default = "default_trial_epochs")]
    pub trial_epochs: u32,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitStats {
    pub samples: usize,
    pub mean_sequence_length: f64,
    pub max_sequence_length: usize,
    /// Distinct token ids that occur in the split.
    pub vocabulary_used: usize,
    /// Sample count per class label.
    pub class_histogram: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessReport {
    pub dataset_id: DbId,
    pub num_classes: u32,
    pub vocabulary_size: u32,
    pub train: SplitStats,
    pub validation: SplitStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub learning_rate: f64,
    pub batch_size: u32,
    pub validation_loss: f64,
    pub validation_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub trials: Vec<TrialResult>,
    pub best: Option<TrialResult>,
    /// The search was stopped before every combination ran.
    pub cancelled: bool,
}

fn split_stats(split: &Split, num_classes: u32) -> SplitStats {
    let lengths: Vec<usize> = split.inputs.iter().map(Vec::len).collect();
    let total: usize = lengths.iter().sum();
    let vocabulary: BTreeSet<u32> = split.inputs.iter().flatten().copied().collect();
    let mut histogram = vec![0u64; num_classes as usize];
    for label in &split.labels {
        if let Some(slot) = histogram.get_mut(*label as usize) {
            *slot += 1;
        }
    }
    SplitStats {
        samples: split.len(),
        mean_sequence_length: if lengths.is_empty() {
            0.0
        } else {
            total as f64 / lengths.len() as f64
        },
        max_sequence_length: lengths.iter().copied().max().unwrap_or(0),
        vocabulary_used: vocabulary.len(),
        class_histogram: histogram,
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, TaskError> {
    serde_json::to_value(value).map_err(|e| TaskError::Backend(format!("result encoding: {e}")))
}

/// Initialize the backend, run `f`, and dispose regardless of outcome.
fn with_backend<T>(
    backend: &mut dyn TrainingBackend,
    num_classes: u32,
    f: impl FnOnce(&dyn TrainingBackend) -> Result<T, TaskError>,
) -> Result<T, TaskError> {
    let result = backend.initialize(num_classes).and_then(|()| f(&*backend));
    backend.dispose();
    result
}

// ---------------------------------------------------------------------------
// MlTaskExecutor
// ---------------------------------------------------------------------------

pub struct MlTaskExecutor {
    backends: Arc<dyn BackendFactory>,
    datasets: Arc<dyn DatasetLoader>,
}

impl MlTaskExecutor {
    pub fn new(backends: Arc<dyn BackendFactory>, datasets: Arc<dyn DatasetLoader>) -> Self {
        Self { backends, datasets }
    }

    fn load(&self, dataset_id: DbId, ctx: &TaskContext) -> Result<Dataset, TaskError> {
        let dataset = self.datasets.load(dataset_id)?;
        ctx.report_memory(dataset.approximate_size_mb());
        Ok(dataset)
    }

    fn train(&self, request: &TaskRequest, ctx: &TaskContext) -> Result<Value, TaskError> {
        let payload: TrainPayload = request.parse_payload()?;
        payload
            .config
            .validate()
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

        if ctx.is_cancelled() {
            return to_value(&TrainingSummary {
                stopped: true,
                ..Default::default()
            });
        }

        let dataset = self.load(payload.dataset_id, ctx)?;
        let mut backend = self.backends.create()?;
        let summary = with_backend(backend.as_mut(), dataset.num_classes, |b| {
            b.train(&payload.config, &dataset, &mut |metrics: &EpochMetrics| {
                ctx.report_progress(metrics);
                if ctx.is_cancelled() {
                    b.stop();
                }
            })
        })?;

        tracing::debug!(
            task_id = %ctx.task_id(),
            epochs = summary.final_epoch,
            stopped = summary.stopped,
            "Training task finished"
        );
        to_value(&summary)
    }

    fn evaluate(&self, request: &TaskRequest, ctx: &TaskContext) -> Result<Value, TaskError> {
        let payload: DatasetPayload = request.parse_payload()?;
        let dataset = self.load(payload.dataset_id, ctx)?;
        let mut backend = self.backends.create()?;
        let report = with_backend(backend.as_mut(), dataset.num_classes, |b| b.evaluate(&dataset))?;
        ctx.report_progress(&json!({
            "stage": "evaluated",
            "samples": report.samples,
        }));
        to_value(&report)
    }

    fn preprocess(&self, request: &TaskRequest, ctx: &TaskContext) -> Result<Value, TaskError> {
        let payload: DatasetPayload = request.parse_payload()?;
        let dataset = self.load(payload.dataset_id, ctx)?;

        let train = split_stats(&dataset.train, dataset.num_classes);
        ctx.report_progress(&json!({ "stage": "train", "samples": train.samples }));
        let validation = split_stats(&dataset.validation, dataset.num_classes);
        ctx.report_progress(&json!({ "stage": "validation", "samples": validation.samples }));

        to_value(&PreprocessReport {
            dataset_id: dataset.dataset_id,
            num_classes: dataset.num_classes,
            vocabulary_size: dataset.vocabulary_size,
            train,
            validation,
        })
    }

    /// Grid search over learning rate x batch size with short trials.
    fn optimize(&self, request: &TaskRequest, ctx: &TaskContext) -> Result<Value, TaskError> {
        let payload: OptimizePayload = request.parse_payload()?;
        if payload.learning_rates.is_empty() || payload.batch_sizes.is_empty() {
            return Err(TaskError::InvalidPayload(
                "optimize needs at least one learning rate and one batch size".into(),
            ));
        }
        let dataset = self.load(payload.dataset_id, ctx)?;

        let grid: Vec<(f64, u32)> = payload
            .learning_rates
            .iter()
            .flat_map(|lr| payload.batch_sizes.iter().map(move |bs| (*lr, *bs)))
            .collect();
        let total = grid.len();
        let mut trials = Vec::with_capacity(total);
        let mut cancelled = false;

        for (index, (learning_rate, batch_size)) in grid.into_iter().enumerate() {
            if ctx.is_cancelled() {
                cancelled = true;
                break;
            }
            let config = TrainingConfig {
                epochs: payload.trial_epochs.max(1),
                batch_size,
                learning_rate,
            };
            config
                .validate()
                .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

            let mut backend = self.backends.create()?;
            let mut last: Option<EpochMetrics> = None;
            with_backend(backend.as_mut(), dataset.num_classes, |b| {
                b.train(&config, &dataset, &mut |m: &EpochMetrics| last = Some(m.clone()))
            })?;

            let Some(last) = last else {
                continue;
            };
            let trial = TrialResult {
                learning_rate,
                batch_size,
                validation_loss: last.validation_loss.unwrap_or(last.loss),
                validation_accuracy: last.validation_accuracy.unwrap_or(last.accuracy),
            };
            ctx.report_progress(&json!({
                "trial": index + 1,
                "total": total,
                "learning_rate": learning_rate,
                "batch_size": batch_size,
                "validation_loss": trial.validation_loss,
                "validation_accuracy": trial.validation_accuracy,
            }));
            trials.push(trial);
        }

        let best = trials
            .iter()
            .min_by(|a, b| a.validation_loss.total_cmp(&b.validation_loss))
            .cloned();
        to_value(&OptimizeReport {
            trials,
            best,
            cancelled,
        })
    }
}

impl TaskExecutor for MlTaskExecutor {
    fn execute(&self, request: &TaskRequest, ctx: &TaskContext) -> Result<Value, TaskError> {
        match request.kind {
            TaskKind::Train => self.train(request, ctx),
            TaskKind::Evaluate => self.evaluate(request, ctx),
            TaskKind::Preprocess => self.preprocess(request, ctx),
            TaskKind::Optimize => self.optimize(request, ctx),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{SimulatedBackendFactory, SyntheticDatasetLoader};
    use assert_matches::assert_matches;
    use kiln_core::task::TaskProgress;
    use tokio::sync::mpsc;

    fn executor() -> MlTaskExecutor {
        MlTaskExecutor::new(
            Arc::new(SimulatedBackendFactory::new(Duration::ZERO)),
            Arc::new(SyntheticDatasetLoader::default()),
        )
    }

    fn run(kind: TaskKind, payload: Value) -> (Result<Value, TaskError>, Vec<TaskProgress>) {
        let request = TaskRequest::new(kind, payload);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TaskContext::detached(request.id, Some(tx));
        let result = executor().execute(&request, &ctx);
        drop(ctx);
        let mut progress = Vec::new();
        while let Ok(p) = rx.try_recv() {
            progress.push(p);
        }
        (result, progress)
    }

    #[test]
    fn train_reports_every_epoch() {
        let (result, progress) = run(
            TaskKind::Train,
            json!({"dataset_id": 5, "config": {"epochs": 4}}),
        );
        let summary: TrainingSummary = serde_json::from_value(result.unwrap()).unwrap();
        assert_eq!(summary.final_epoch, 4);
        assert!(!summary.stopped);

        let epochs: Vec<u64> = progress
            .iter()
            .map(|p| p.data["epoch"].as_u64().unwrap())
            .collect();
        assert_eq!(epochs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn train_rejects_invalid_config() {
        let (result, _) = run(
            TaskKind::Train,
            json!({"dataset_id": 5, "config": {"epochs": 0}}),
        );
        assert_matches!(result, Err(TaskError::InvalidPayload(_)));
    }

    #[test]
    fn missing_dataset_is_a_task_error() {
        let (result, _) = run(TaskKind::Evaluate, json!({"dataset_id": -1}));
        assert_matches!(result, Err(TaskError::Dataset(_)));
    }

    #[test]
    fn preprocess_counts_classes() {
        let (result, progress) = run(TaskKind::Preprocess, json!({"dataset_id": 2}));
        let report: PreprocessReport = serde_json::from_value(result.unwrap()).unwrap();
        assert_eq!(report.train.samples, 200);
        assert_eq!(report.train.class_histogram.iter().sum::<u64>(), 200);
        assert_eq!(report.train.class_histogram.len(), report.num_classes as usize);
        assert!(report.train.mean_sequence_length >= 8.0);
        assert_eq!(progress.len(), 2);
    }

    #[test]
    fn optimize_picks_lowest_validation_loss() {
        let (result, progress) = run(
            TaskKind::Optimize,
            json!({
                "dataset_id": 3,
                "learning_rates": [0.0005, 0.005],
                "batch_sizes": [32],
            }),
        );
        let report: OptimizeReport = serde_json::from_value(result.unwrap()).unwrap();
        assert_eq!(report.trials.len(), 2);
        assert_eq!(progress.len(), 2);
        assert!(!report.cancelled);
        assert_eq!(report.best.unwrap().learning_rate, 0.005);
    }

    #[test]
    fn cancelled_train_is_stopped_summary() {
        let request = TaskRequest::new(TaskKind::Train, json!({"dataset_id": 1}));
        let ctx = TaskContext::detached(request.id, None);
        ctx.cancellation().cancel();
        let value = executor().execute(&request, &ctx).unwrap();
        let summary: TrainingSummary = serde_json::from_value(value).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.final_epoch, 0);
    }

    #[test]
    fn evaluate_reports_once() {
        let (result, progress) = run(TaskKind::Evaluate, json!({"dataset_id": 4}));
        assert!(result.unwrap()["accuracy"].as_f64().unwrap() > 0.0);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].data["stage"], "evaluated");
    }
}

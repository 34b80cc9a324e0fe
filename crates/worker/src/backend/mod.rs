//! Training backends and dataset loading.
//!
//! The executor only depends on the [`TrainingBackend`] contract. Which
//! implementation runs is decided once at startup by [`select_backend`].

pub mod dataset;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use kiln_core::error::CoreError;
use kiln_core::task::TaskError;
use kiln_core::training::{EpochMetrics, TrainingConfig, TrainingSummary};
use kiln_core::types::DbId;
use serde::{Deserialize, Serialize};

pub use dataset::SyntheticDatasetLoader;
pub use simulated::SimulatedBackendFactory;

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// Tokenized samples with their class labels.
#[derive(Debug, Clone, Default)]
pub struct Split {
    pub inputs: Vec<Vec<u32>>,
    pub labels: Vec<u32>,
}

impl Split {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub dataset_id: DbId,
    pub num_classes: u32,
    pub vocabulary_size: u32,
    pub train: Split,
    pub validation: Split,
}

impl Dataset {
    /// Rough in-memory footprint of the token data, in megabytes.
    pub fn approximate_size_mb(&self) -> f64 {
        let tokens: usize = self
            .train
            .inputs
            .iter()
            .chain(self.validation.inputs.iter())
            .map(Vec::len)
            .sum();
        let labels = self.train.len() + self.validation.len();
        ((tokens + labels) * std::mem::size_of::<u32>()) as f64 / (1024.0 * 1024.0)
    }
}

/// Resolves a dataset id to tokenized training and validation splits.
pub trait DatasetLoader: Send + Sync {
    fn load(&self, dataset_id: DbId) -> Result<Dataset, TaskError>;
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// One numerical training backend instance, created per task.
///
/// `train` invokes `on_progress` at least once per completed epoch. After
/// `stop` is called, `train` returns within one epoch with
/// `stopped = true`.
pub trait TrainingBackend {
    fn initialize(&mut self, num_classes: u32) -> Result<(), TaskError>;

    fn train(
        &self,
        config: &TrainingConfig,
        dataset: &Dataset,
        on_progress: &mut dyn FnMut(&EpochMetrics),
    ) -> Result<TrainingSummary, TaskError>;

    fn evaluate(&self, dataset: &Dataset) -> Result<EvaluationReport, TaskError>;

    fn stop(&self);

    fn dispose(&mut self);
}

pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self) -> Result<Box<dyn TrainingBackend>, TaskError>;
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Timer-paced synthetic metrics.
    Simulated,
    /// An externally provided numerical backend.
    Native,
}

impl BackendKind {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "demo" => Ok(BackendKind::Simulated),
            "native" => Ok(BackendKind::Native),
            other => Err(CoreError::Configuration(format!(
                "TRAINING_BACKEND must be 'simulated' or 'native', got '{other}'"
            ))),
        }
    }
}

/// Pick the backend factory for the configured kind.
///
/// `native` needs a factory injected by the embedding application; without
/// one this is a configuration error.
pub fn select_backend(
    kind: BackendKind,
    simulated_epoch: Duration,
    native: Option<Arc<dyn BackendFactory>>,
) -> Result<Arc<dyn BackendFactory>, CoreError> {
    let factory: Arc<dyn BackendFactory> = match kind {
        BackendKind::Simulated => Arc::new(SimulatedBackendFactory::new(simulated_epoch)),
        BackendKind::Native => native.ok_or_else(|| {
            CoreError::Configuration(
                "TRAINING_BACKEND=native but no native backend is linked into this build".into(),
            )
        })?,
    };
    tracing::info!(backend = factory.name(), "Training backend selected");
    Ok(factory)
}

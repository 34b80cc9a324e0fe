//! Deterministic synthetic datasets for demo mode and tests.

use kiln_core::task::TaskError;
use kiln_core::types::DbId;

use super::{Dataset, DatasetLoader, Split};

/// Generates token sequences from a seeded linear congruential generator,
/// so the same dataset id always yields the same data.
#[derive(Debug, Clone)]
pub struct SyntheticDatasetLoader {
    pub train_samples: usize,
    pub validation_samples: usize,
    pub vocabulary_size: u32,
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for SyntheticDatasetLoader {
    fn default() -> Self {
        Self {
            train_samples: 200,
            validation_samples: 50,
            vocabulary_size: 500,
            min_length: 8,
            max_length: 32,
        }
    }
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound.max(1)
    }
}

impl SyntheticDatasetLoader {
    fn split(&self, rng: &mut Lcg, samples: usize, num_classes: u32) -> Split {
        let span = (self.max_length.saturating_sub(self.min_length) + 1) as u64;
        let mut split = Split::default();
        for _ in 0..samples {
            let len = self.min_length + rng.below(span) as usize;
            let tokens = (0..len)
                .map(|_| rng.below(u64::from(self.vocabulary_size)) as u32)
                .collect();
            split.inputs.push(tokens);
            split.labels.push(rng.below(u64::from(num_classes)) as u32);
        }
        split
    }
}

impl DatasetLoader for SyntheticDatasetLoader {
    fn load(&self, dataset_id: DbId) -> Result<Dataset, TaskError> {
        if dataset_id <= 0 {
            return Err(TaskError::Dataset(format!("dataset {dataset_id} not found")));
        }
        let num_classes = 2 + (dataset_id % 4) as u32;
        let mut rng = Lcg(dataset_id as u64);
        let train = self.split(&mut rng, self.train_samples, num_classes);
        let validation = self.split(&mut rng, self.validation_samples, num_classes);

        Ok(Dataset {
            dataset_id,
            num_classes,
            vocabulary_size: self.vocabulary_size,
            train,
            validation,
        })
    }
}

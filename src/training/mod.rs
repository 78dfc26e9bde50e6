pub mod alignment_runner;
pub mod feature_cache;
pub mod gaussian_schedule;
pub mod stage;
pub mod subsample;
pub mod worker_pool;

pub use alignment_runner::AlignmentRunner;
pub use feature_cache::FeatureCache;
pub use gaussian_schedule::{target_gaussians, GaussianSchedule};
pub use stage::{StageInput, StageOutput, StageState, TrainingStage};
pub use subsample::CorpusSubsampler;
pub use worker_pool::CancellationToken;

use crate::types::{Corpus, Subset};

/// Read-only view of the data a stage trains on.
#[derive(Debug, Clone, Copy)]
pub struct StageData<'a> {
    pub corpus: &'a Corpus,
    pub subset: &'a Subset,
    pub features: &'a FeatureCache,
}

impl<'a> StageData<'a> {
    pub fn new(corpus: &'a Corpus, subset: &'a Subset, features: &'a FeatureCache) -> Self {
        Self {
            corpus,
            subset,
            features,
        }
    }
}

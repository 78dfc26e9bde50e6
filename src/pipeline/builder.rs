use std::path::PathBuf;

use crate::config::TrainingConfiguration;
use crate::error::TrainingError;
use crate::pipeline::checkpoint::CheckpointStore;
use crate::pipeline::defaults::JsonFeatureReader;
use crate::pipeline::runtime::{TrainingPipeline, TrainingPipelineParts};
use crate::pipeline::traits::{AcousticModelEngine, AlignmentEngine, FeatureExtractor};
use crate::training::CancellationToken;

pub struct TrainingPipelineBuilder {
    config: TrainingConfiguration,
    feature_extractor: Option<Box<dyn FeatureExtractor>>,
    model_engine: Option<Box<dyn AcousticModelEngine>>,
    alignment_engine: Option<Box<dyn AlignmentEngine>>,
    checkpoint_dir: Option<PathBuf>,
    resume: bool,
    cancel: Option<CancellationToken>,
    num_jobs: Option<usize>,
}

impl TrainingPipelineBuilder {
    pub fn new(config: TrainingConfiguration) -> Self {
        Self {
            config,
            feature_extractor: None,
            model_engine: None,
            alignment_engine: None,
            checkpoint_dir: None,
            resume: true,
            cancel: None,
            num_jobs: None,
        }
    }

    pub fn with_feature_extractor(mut self, feature_extractor: Box<dyn FeatureExtractor>) -> Self {
        self.feature_extractor = Some(feature_extractor);
        self
    }

    pub fn with_model_engine(mut self, model_engine: Box<dyn AcousticModelEngine>) -> Self {
        self.model_engine = Some(model_engine);
        self
    }

    pub fn with_alignment_engine(mut self, alignment_engine: Box<dyn AlignmentEngine>) -> Self {
        self.alignment_engine = Some(alignment_engine);
        self
    }

    /// Completed stages are written under `dir`; the failed stage's last
    /// model is kept there as well.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Reuse matching checkpoints. On by default; off retrains every stage
    /// and overwrites the manifest.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Overrides the worker count derived from `use_mp` / `num_jobs`.
    pub fn with_num_jobs(mut self, num_jobs: usize) -> Self {
        self.num_jobs = Some(num_jobs);
        self
    }

    pub fn build(self) -> Result<TrainingPipeline, TrainingError> {
        self.config.validate()?;
        if self.num_jobs == Some(0) {
            return Err(TrainingError::config("num_jobs must be positive"));
        }
        let model_engine = self.model_engine.ok_or_else(|| {
            TrainingError::engine("build training pipeline", "no acoustic model engine configured")
        })?;
        let alignment_engine = self.alignment_engine.ok_or_else(|| {
            TrainingError::engine("build training pipeline", "no alignment engine configured")
        })?;
        let checkpoints = self
            .checkpoint_dir
            .map(CheckpointStore::open)
            .transpose()?;
        let workers = if self.config.use_mp {
            self.num_jobs.unwrap_or_else(|| self.config.worker_count())
        } else {
            1
        };

        Ok(TrainingPipeline::from_parts(TrainingPipelineParts {
            feature_extractor: self
                .feature_extractor
                .unwrap_or_else(|| Box::new(JsonFeatureReader)),
            model_engine,
            alignment_engine,
            checkpoints,
            resume: self.resume,
            cancel: self.cancel.unwrap_or_default(),
            workers,
            config: self.config,
        }))
    }
}

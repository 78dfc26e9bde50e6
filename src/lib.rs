//! Staged GMM-HMM acoustic model training.
//!
//! A [`TrainingConfiguration`] declares an ordered list of stages
//! (monophone, triphone, LDA+MLLT, speaker-adapted). The
//! [`TrainingPipeline`] runs them in order: each stage draws a corpus subset,
//! aligns it with two-tier beam search, accumulates statistics in parallel
//! and re-estimates the model while growing its Gaussian count. The numeric
//! work is done by the engines behind the traits in [`pipeline::traits`].

pub mod config;
pub mod error;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod training;
pub mod types;

pub use config::{StageConfig, StageKind, TrainingConfiguration};
pub use error::{AlignmentFailure, StageFailure, TrainingError};
pub use pipeline::builder::TrainingPipelineBuilder;
pub use pipeline::runtime::{TrainingOutcome, TrainingPipeline};
pub use pipeline::traits::{AcousticModelEngine, AlignmentEngine, FeatureExtractor};
pub use plan::TrainingPlan;
pub use report::TrainingReport;
pub use training::{target_gaussians, CancellationToken, CorpusSubsampler};
pub use types::{AlignmentSet, Corpus, Model, Subset, Utterance};

use crate::config::{FeatureConfig, FmllrUpdateType, SpliceContext, StageKind};
use crate::error::TrainingError;
use crate::training::StageData;
use crate::types::{
    AlignmentSet, Features, LdaTransform, Model, SufficientStats, TransformChain, Utterance,
    UtteranceAlignment, UtteranceId,
};

/// Turns audio into frames. Must be a pure function of its inputs.
pub trait FeatureExtractor: Send + Sync {
    fn extract(
        &self,
        utterance: &Utterance,
        config: &FeatureConfig,
    ) -> Result<Features, TrainingError>;
}

/// Viterbi search against a model snapshot.
pub trait AlignmentEngine: Send + Sync {
    /// `Ok(None)` means the search found no complete path within `beam`.
    /// `Err` is an engine failure and is not retried.
    fn align(
        &self,
        model: &Model,
        transforms: &TransformChain,
        utterance: &Utterance,
        features: &Features,
        beam: f64,
    ) -> Result<Option<UtteranceAlignment>, TrainingError>;
}

pub struct FlatStartRequest<'a> {
    pub data: StageData<'a>,
    pub transforms: &'a TransformChain,
    pub feature_dim: usize,
    pub initial_gaussians: Option<usize>,
    pub max_gaussians: usize,
}

/// Context-dependent reseeding: cluster the states of `seed` into
/// `num_leaves` tied states in the space given by `transforms`.
pub struct TreeRequest<'a> {
    pub kind: StageKind,
    pub seed: &'a Model,
    pub alignments: &'a AlignmentSet,
    pub transforms: &'a TransformChain,
    pub data: StageData<'a>,
    pub num_leaves: usize,
    /// `None` selects the engine's own threshold.
    pub cluster_threshold: Option<f64>,
}

pub struct LdaRequest<'a> {
    pub seed: &'a Model,
    pub alignments: &'a AlignmentSet,
    pub transforms: &'a TransformChain,
    pub data: StageData<'a>,
    pub splice: SpliceContext,
    pub dimension: usize,
}

pub struct MlltRequest<'a> {
    pub model: &'a Model,
    pub lda: &'a LdaTransform,
    pub alignments: &'a AlignmentSet,
    pub data: StageData<'a>,
    pub iteration: u32,
}

pub struct FmllrRequest<'a> {
    pub model: &'a Model,
    pub alignments: &'a AlignmentSet,
    pub transforms: &'a TransformChain,
    pub data: StageData<'a>,
    pub speaker: &'a str,
    pub utterance_ids: &'a [UtteranceId],
    pub update_type: FmllrUpdateType,
    pub silence_weight: f64,
}

/// Numeric GMM-HMM operations. Every method returns new values; inputs are
/// never modified.
pub trait AcousticModelEngine: Send + Sync {
    fn flat_start(&self, request: &FlatStartRequest<'_>) -> Result<Model, TrainingError>;

    fn build_tree(&self, request: &TreeRequest<'_>) -> Result<Model, TrainingError>;

    fn estimate_lda(&self, request: &LdaRequest<'_>) -> Result<LdaTransform, TrainingError>;

    /// Refines the LDA transform with an MLLT step, returning the new
    /// transform and the model re-expressed in the new space.
    fn update_mllt(
        &self,
        request: &MlltRequest<'_>,
    ) -> Result<(LdaTransform, Model), TrainingError> {
        Ok((request.lda.clone(), request.model.clone()))
    }

    fn estimate_fmllr(&self, request: &FmllrRequest<'_>) -> Result<Vec<f64>, TrainingError>;

    fn accumulate(
        &self,
        model: &Model,
        transforms: &TransformChain,
        utterance: &Utterance,
        features: &Features,
        alignment: &UtteranceAlignment,
    ) -> Result<SufficientStats, TrainingError>;

    fn reestimate(
        &self,
        model: &Model,
        stats: &SufficientStats,
        target_gaussians: usize,
    ) -> Result<Model, TrainingError>;

    /// Applies the silence boost to a freshly re-estimated model. The factor
    /// replaces any earlier boost rather than compounding with it.
    fn boost_silence(&self, model: &Model, factor: f64) -> Result<Model, TrainingError> {
        Ok(Model {
            silence_boost: factor,
            ..model.clone()
        })
    }
}

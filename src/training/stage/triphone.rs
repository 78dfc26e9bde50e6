use crate::config::{StageKind, TriphoneParams};
use crate::error::TrainingError;
use crate::pipeline::traits::TreeRequest;

use super::{Seeded, StageContext, StageInput, StageStrategy};

/// Context-dependent stage: clusters the incoming model's states into a
/// decision tree with `num_leaves` tied states.
pub(super) struct TriphoneStage {
    params: TriphoneParams,
}

impl TriphoneStage {
    pub(super) fn new(params: TriphoneParams) -> Self {
        Self { params }
    }
}

impl StageStrategy for TriphoneStage {
    fn seed(&self, ctx: &StageContext<'_>, input: &StageInput) -> Result<Seeded, TrainingError> {
        let seed = ctx.seed_model(input)?;
        let alignment = ctx.seed_alignment(seed, &input.transforms)?;
        let model = ctx.engine.build_tree(&TreeRequest {
            kind: StageKind::Triphone,
            seed,
            alignments: &alignment,
            transforms: &input.transforms,
            data: ctx.data,
            num_leaves: self.params.num_leaves(),
            cluster_threshold: self.params.cluster_threshold(),
        })?;
        Ok(Seeded {
            model,
            transforms: input.transforms.clone(),
            alignment: Some(alignment),
        })
    }
}

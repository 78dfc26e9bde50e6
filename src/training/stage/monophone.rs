use crate::config::MonophoneParams;
use crate::error::TrainingError;
use crate::pipeline::traits::FlatStartRequest;

use super::{Seeded, StageContext, StageInput, StageStrategy};

/// Flat-start stage. Ignores any incoming model.
pub(super) struct MonophoneStage {
    params: MonophoneParams,
}

impl MonophoneStage {
    pub(super) fn new(params: MonophoneParams) -> Self {
        Self { params }
    }
}

impl StageStrategy for MonophoneStage {
    fn seed(&self, ctx: &StageContext<'_>, input: &StageInput) -> Result<Seeded, TrainingError> {
        let feature_dim = ctx
            .data
            .features
            .dim_of(&ctx.data.subset.utterance_ids)
            .ok_or_else(|| {
                ctx.failure(
                    None,
                    ctx.data.subset.len(),
                    "no utterance in the subset has usable features",
                )
            })?;

        let model = ctx.engine.flat_start(&FlatStartRequest {
            data: ctx.data,
            transforms: &input.transforms,
            feature_dim,
            initial_gaussians: self.params.initial_gaussians,
            max_gaussians: self.params.common.max_gaussians,
        })?;
        Ok(Seeded {
            model,
            transforms: input.transforms.clone(),
            alignment: None,
        })
    }
}

use crate::config::{LdaParams, StageKind};
use crate::error::TrainingError;
use crate::pipeline::traits::{LdaRequest, MlltRequest, TreeRequest};
use crate::types::{AlignmentSet, Model, TransformChain};

use super::{Refinement, Seeded, StageContext, StageInput, StageStrategy};

/// Estimates a spliced LDA projection from the incoming alignments, rebuilds
/// the tree in the projected space and refines the projection with MLLT on
/// the configured iterations.
pub(super) struct LdaStage {
    params: LdaParams,
    mllt_iterations: Vec<u32>,
}

impl LdaStage {
    pub(super) fn new(params: LdaParams) -> Self {
        let mllt_iterations = params.mllt_iterations();
        Self {
            params,
            mllt_iterations,
        }
    }
}

impl StageStrategy for LdaStage {
    fn seed(&self, ctx: &StageContext<'_>, input: &StageInput) -> Result<Seeded, TrainingError> {
        let seed = ctx.seed_model(input)?;
        let alignment = ctx.seed_alignment(seed, &input.transforms)?;
        let lda = ctx.engine.estimate_lda(&LdaRequest {
            seed,
            alignments: &alignment,
            transforms: &input.transforms,
            data: ctx.data,
            splice: self.params.splice(),
            dimension: self.params.lda_dimension,
        })?;
        // Speaker transforms from earlier stages live in the old feature space.
        let transforms = TransformChain {
            lda: Some(lda),
            fmllr: None,
        };
        let model = ctx.engine.build_tree(&TreeRequest {
            kind: StageKind::Lda,
            seed,
            alignments: &alignment,
            transforms: &transforms,
            data: ctx.data,
            num_leaves: self.params.num_leaves(),
            cluster_threshold: None,
        })?;
        Ok(Seeded {
            model,
            transforms,
            alignment: Some(alignment),
        })
    }

    fn refine(
        &self,
        ctx: &StageContext<'_>,
        iteration: u32,
        model: &Model,
        alignments: &AlignmentSet,
        transforms: &TransformChain,
    ) -> Result<Option<Refinement>, TrainingError> {
        if !self.mllt_iterations.contains(&iteration) {
            return Ok(None);
        }
        let Some(lda) = &transforms.lda else {
            return Ok(None);
        };
        let (lda, model) = ctx.engine.update_mllt(&MlltRequest {
            model,
            lda,
            alignments,
            data: ctx.data,
            iteration,
        })?;
        tracing::debug!(
            stage = ctx.name,
            iteration,
            mllt_updates = lda.mllt_updates,
            "mllt updated"
        );
        Ok(Some(Refinement {
            model: Some(model),
            transforms: TransformChain {
                lda: Some(lda),
                fmllr: transforms.fmllr.clone(),
            },
        }))
    }
}

use std::collections::BTreeMap;

use crate::config::{FmllrUpdateType, SatParams, StageKind};
use crate::error::TrainingError;
use crate::pipeline::traits::{FmllrRequest, TreeRequest};
use crate::training::worker_pool::run_ordered;
use crate::types::{AlignmentSet, Model, SpeakerTransforms, TransformChain, UtteranceId};

use super::{Refinement, Seeded, StageContext, StageInput, StageStrategy};

/// Speaker-adapted training: per-speaker fMLLR transforms estimated against
/// the incoming model, a rebuilt tree in the adapted space, and transform
/// re-estimation on the configured iterations and once more at the end.
pub(super) struct SatStage {
    params: SatParams,
    fmllr_iterations: Vec<u32>,
}

impl SatStage {
    pub(super) fn new(params: SatParams) -> Self {
        let fmllr_iterations = params.fmllr_iterations();
        Self {
            params,
            fmllr_iterations,
        }
    }

    /// Aligned utterances grouped by speaker. Utterances without a speaker
    /// label form their own group.
    fn speakers(
        ctx: &StageContext<'_>,
        alignments: &AlignmentSet,
    ) -> Vec<(String, Vec<UtteranceId>)> {
        let mut groups: BTreeMap<String, Vec<UtteranceId>> = BTreeMap::new();
        for id in alignments.alignments.keys() {
            let speaker = ctx
                .data
                .corpus
                .get(id)
                .and_then(|utt| utt.speaker.clone())
                .unwrap_or_else(|| id.clone());
            groups.entry(speaker).or_default().push(id.clone());
        }
        groups.into_iter().collect()
    }

    fn estimate(
        &self,
        ctx: &StageContext<'_>,
        model: &Model,
        alignments: &AlignmentSet,
        transforms: &TransformChain,
        previous: Option<&SpeakerTransforms>,
    ) -> Result<SpeakerTransforms, TrainingError> {
        let update_type = self.params.fmllr_update_type;
        let mut result = SpeakerTransforms {
            update_type,
            per_speaker: previous.map(|p| p.per_speaker.clone()).unwrap_or_default(),
        };
        if update_type == FmllrUpdateType::NoUpdate {
            return Ok(result);
        }

        let speakers = Self::speakers(ctx, alignments);
        let estimates = run_ordered(&speakers, ctx.workers, ctx.cancel, |(speaker, ids)| {
            ctx.engine.estimate_fmllr(&FmllrRequest {
                model,
                alignments,
                transforms,
                data: ctx.data,
                speaker,
                utterance_ids: ids,
                update_type,
                silence_weight: self.params.silence_weight,
            })
        })
        .ok_or_else(|| ctx.cancelled(None))?;

        let mut estimated = 0;
        for ((speaker, _), estimate) in speakers.iter().zip(estimates) {
            match estimate {
                Ok(matrix) => {
                    result.per_speaker.insert(speaker.clone(), matrix);
                    estimated += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        stage = ctx.name,
                        speaker = %speaker,
                        error = %err,
                        "fmllr estimation failed, keeping previous transform"
                    );
                }
            }
        }
        if estimated == 0 && !speakers.is_empty() {
            return Err(ctx.failure(
                None,
                alignments.unaligned.len(),
                "fmllr estimation failed for every speaker",
            ));
        }
        tracing::debug!(stage = ctx.name, speakers = estimated, "fmllr transforms estimated");
        Ok(result)
    }
}

impl StageStrategy for SatStage {
    fn seed(&self, ctx: &StageContext<'_>, input: &StageInput) -> Result<Seeded, TrainingError> {
        let seed = ctx.seed_model(input)?;
        if self.params.lda && input.transforms.lda.is_none() {
            return Err(ctx.failure(
                None,
                0,
                "lda: true but no earlier stage produced an lda transform",
            ));
        }
        let alignment = ctx.seed_alignment(seed, &input.transforms)?;

        let mut transforms = TransformChain {
            lda: if self.params.lda {
                input.transforms.lda.clone()
            } else {
                None
            },
            fmllr: None,
        };
        let fmllr = self.estimate(ctx, seed, &alignment, &transforms, None)?;
        transforms.fmllr = Some(fmllr);

        let model = ctx.engine.build_tree(&TreeRequest {
            kind: StageKind::Sat,
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
        if !self.fmllr_iterations.contains(&iteration) {
            return Ok(None);
        }
        let fmllr = self.estimate(ctx, model, alignments, transforms, transforms.fmllr.as_ref())?;
        Ok(Some(Refinement {
            model: None,
            transforms: TransformChain {
                lda: transforms.lda.clone(),
                fmllr: Some(fmllr),
            },
        }))
    }

    fn finalize(
        &self,
        ctx: &StageContext<'_>,
        model: &Model,
        alignments: &AlignmentSet,
        transforms: TransformChain,
    ) -> Result<TransformChain, TrainingError> {
        if alignments.alignments.is_empty() {
            return Ok(transforms);
        }
        let fmllr = self.estimate(ctx, model, alignments, &transforms, transforms.fmllr.as_ref())?;
        Ok(TransformChain {
            fmllr: Some(fmllr),
            ..transforms
        })
    }
}

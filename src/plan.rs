use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{StageConfig, StageKind, TrainingConfiguration};
use crate::training::{CorpusSubsampler, GaussianSchedule};
use crate::types::Corpus;

/// Dry-run view of what each stage would train on. Utterances carried over
/// from alignment failures are not known ahead of time and are not included.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingPlan {
    pub corpus_size: usize,
    pub workers: usize,
    pub stages: Vec<StagePlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub index: usize,
    pub name: String,
    pub kind: StageKind,
    pub subset_size: usize,
    pub full_corpus: bool,
    pub speakers: usize,
    pub num_iterations: u32,
    pub max_gaussians: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_leaves: Option<usize>,
    /// Gaussian target per iteration, from the stage's starting count.
    pub gaussian_targets: Vec<usize>,
    pub realignment_iterations: Vec<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transform_iterations: Vec<u32>,
}

impl TrainingPlan {
    pub fn new(config: &TrainingConfiguration, corpus: &Corpus) -> Self {
        let subsampler =
            CorpusSubsampler::new(config.subset_strategy, config.prefer_short_utterances);
        let stages = config
            .training
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let common = stage.common();
                let subset = subsampler.select(
                    corpus,
                    common.subset_size(),
                    config.seed.wrapping_add(index as u64),
                    &[],
                );
                let speakers = subset
                    .utterance_ids
                    .iter()
                    .filter_map(|id| corpus.get(id))
                    .map(|utt| utt.speaker.as_deref().unwrap_or(utt.id.as_str()))
                    .collect::<BTreeSet<_>>()
                    .len();
                let (num_leaves, initial, transform_iterations) = match stage {
                    StageConfig::Monophone(p) => {
                        (None, p.initial_gaussians.unwrap_or(0), Vec::new())
                    }
                    StageConfig::Triphone(p) => (Some(p.num_leaves()), p.num_leaves(), Vec::new()),
                    StageConfig::Lda(p) => {
                        (Some(p.num_leaves()), p.num_leaves(), p.mllt_iterations())
                    }
                    StageConfig::Sat(p) => {
                        (Some(p.num_leaves()), p.num_leaves(), p.fmllr_iterations())
                    }
                };
                let schedule = GaussianSchedule::new(
                    common.num_iterations,
                    common.max_gaussians,
                    common.power(),
                );
                StagePlan {
                    index,
                    name: stage.name(index),
                    kind: stage.kind(),
                    subset_size: subset.len(),
                    full_corpus: subset.is_full_corpus,
                    speakers,
                    num_iterations: common.num_iterations,
                    max_gaussians: common.max_gaussians,
                    num_leaves,
                    gaussian_targets: schedule.targets(initial),
                    realignment_iterations: (1..=common.num_iterations)
                        .filter(|&it| common.realigns_on(it))
                        .collect(),
                    transform_iterations,
                }
            })
            .collect();

        Self {
            corpus_size: corpus.len(),
            workers: config.worker_count(),
            stages,
        }
    }
}

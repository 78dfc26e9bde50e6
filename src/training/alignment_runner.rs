use std::sync::Arc;

use crate::config::AlignmentSearchConfig;
use crate::error::{AlignmentFailure, TrainingError};
use crate::pipeline::traits::AlignmentEngine;
use crate::training::worker_pool::{run_ordered, CancellationToken};
use crate::training::StageData;
use crate::types::{
    AlignmentSet, Features, Model, TransformChain, UnalignedReason, UnalignedUtterance, Utterance,
    UtteranceAlignment,
};

enum Attempt {
    Aligned(UtteranceAlignment),
    /// No complete path within the beam.
    Exhausted,
    Failed(String),
}

struct Job<'a> {
    utterance: &'a Utterance,
    features: Arc<Features>,
}

/// Two-tier beam search over a subset: everything at `beam`, then only the
/// failures at `retry_beam`. Never more than two tiers.
pub struct AlignmentRunner<'a> {
    engine: &'a dyn AlignmentEngine,
    search: AlignmentSearchConfig,
    workers: usize,
    cancel: &'a CancellationToken,
    stage: &'a str,
}

impl<'a> AlignmentRunner<'a> {
    pub fn new(
        engine: &'a dyn AlignmentEngine,
        search: AlignmentSearchConfig,
        workers: usize,
        cancel: &'a CancellationToken,
        stage: &'a str,
    ) -> Self {
        Self {
            engine,
            search,
            workers: workers.max(1),
            cancel,
            stage,
        }
    }

    pub fn search(&self) -> AlignmentSearchConfig {
        self.search
    }

    /// Aligns every utterance in `data.subset` against `model`.
    ///
    /// Partial failure is not an error: unaligned utterances are listed in the
    /// returned set. Fails with [`AlignmentFailure`] only if nothing aligned.
    pub fn align(
        &self,
        model: &Model,
        transforms: &TransformChain,
        data: StageData<'_>,
        iteration: u32,
    ) -> Result<AlignmentSet, TrainingError> {
        let mut set = AlignmentSet {
            iteration,
            ..AlignmentSet::default()
        };

        let mut jobs = Vec::with_capacity(data.subset.len());
        for id in &data.subset.utterance_ids {
            let Some(utterance) = data.corpus.get(id) else {
                set.unaligned.push(UnalignedUtterance {
                    utterance_id: id.clone(),
                    reason: UnalignedReason::Engine("utterance is not in the corpus".to_string()),
                });
                continue;
            };
            match data.features.get(id) {
                Some(features) => jobs.push(Job {
                    utterance,
                    features,
                }),
                None => set.unaligned.push(UnalignedUtterance {
                    utterance_id: id.clone(),
                    reason: UnalignedReason::FeaturesUnavailable(
                        data.features
                            .failure(id)
                            .unwrap_or("no features cached")
                            .to_string(),
                    ),
                }),
            }
        }

        let first = self.run_tier(model, transforms, &jobs, self.search.beam, iteration)?;
        let mut retry_jobs = Vec::new();
        for (job, attempt) in jobs.iter().zip(first) {
            match attempt {
                Attempt::Aligned(alignment) => {
                    set.alignments
                        .insert(job.utterance.id.clone(), alignment);
                }
                Attempt::Exhausted => retry_jobs.push(Job {
                    utterance: job.utterance,
                    features: Arc::clone(&job.features),
                }),
                Attempt::Failed(message) => set.unaligned.push(UnalignedUtterance {
                    utterance_id: job.utterance.id.clone(),
                    reason: UnalignedReason::Engine(message),
                }),
            }
        }

        if !retry_jobs.is_empty() {
            if self.search.retry_beam > self.search.beam {
                tracing::warn!(
                    stage = self.stage,
                    iteration,
                    count = retry_jobs.len(),
                    beam = self.search.beam,
                    retry_beam = self.search.retry_beam,
                    "realigning utterances that failed at the initial beam"
                );
                let second =
                    self.run_tier(
                        model,
                        transforms,
                        &retry_jobs,
                        self.search.retry_beam,
                        iteration,
                    )?;
                for (job, attempt) in retry_jobs.iter().zip(second) {
                    match attempt {
                        Attempt::Aligned(alignment) => {
                            set.retried += 1;
                            set.alignments
                                .insert(job.utterance.id.clone(), alignment);
                        }
                        Attempt::Exhausted => set.unaligned.push(UnalignedUtterance {
                            utterance_id: job.utterance.id.clone(),
                            reason: UnalignedReason::BeamExhausted,
                        }),
                        Attempt::Failed(message) => set.unaligned.push(UnalignedUtterance {
                            utterance_id: job.utterance.id.clone(),
                            reason: UnalignedReason::Engine(message),
                        }),
                    }
                }
            } else {
                set.unaligned
                    .extend(retry_jobs.iter().map(|job| UnalignedUtterance {
                        utterance_id: job.utterance.id.clone(),
                        reason: UnalignedReason::BeamExhausted,
                    }));
            }
        }

        if !set.unaligned.is_empty() {
            tracing::warn!(
                stage = self.stage,
                iteration,
                unaligned = set.unaligned.len(),
                "some utterances could not be aligned and are excluded this round"
            );
        }
        tracing::debug!(
            stage = self.stage,
            iteration,
            aligned = set.aligned_count(),
            retried = set.retried,
            "alignment pass complete"
        );

        if set.alignments.is_empty() && !data.subset.is_empty() {
            return Err(AlignmentFailure {
                retry_beam: self.search.retry_beam,
                unaligned: set.unaligned_ids(),
            }
            .into());
        }
        Ok(set)
    }

    fn run_tier(
        &self,
        model: &Model,
        transforms: &TransformChain,
        jobs: &[Job<'_>],
        beam: f64,
        iteration: u32,
    ) -> Result<Vec<Attempt>, TrainingError> {
        run_ordered(jobs, self.workers, self.cancel, |job| {
            match self
                .engine
                .align(model, transforms, job.utterance, &job.features, beam)
            {
                Ok(Some(mut alignment)) => {
                    alignment.utterance_id = job.utterance.id.clone();
                    alignment.beam = beam;
                    Attempt::Aligned(alignment)
                }
                Ok(None) => Attempt::Exhausted,
                Err(err) => Attempt::Failed(err.to_string()),
            }
        })
        .ok_or_else(|| TrainingError::Cancelled {
            stage: self.stage.to_string(),
            iteration: Some(iteration),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureConfig, SubsetSize};
    use crate::pipeline::traits::FeatureExtractor;
    use crate::pipeline::test_support::{seeded_cache, test_corpus, test_model, MockEngine};
    use crate::training::FeatureCache;
    use crate::types::Subset;

    const SEARCH: AlignmentSearchConfig = AlignmentSearchConfig {
        beam: 10.0,
        retry_beam: 40.0,
    };

    fn full_subset(corpus: &crate::types::Corpus) -> Subset {
        Subset {
            requested: SubsetSize::Full,
            utterance_ids: corpus.utterances().iter().map(|u| u.id.clone()).collect(),
            is_full_corpus: true,
        }
    }

    #[test]
    fn retried_utterance_appears_once_with_retry_beam() {
        let corpus = test_corpus(2, 3);
        let subset = full_subset(&corpus);
        let engine = MockEngine::new().with_hard(["spk000-utt0001"]);
        let cache = seeded_cache(&corpus, &engine);
        let cancel = CancellationToken::new();
        let runner = AlignmentRunner::new(&engine, SEARCH, 3, &cancel, "00_monophone");
        let data = StageData::new(&corpus, &subset, &cache);

        let set = runner
            .align(&test_model(), &TransformChain::default(), data, 1)
            .unwrap();
        assert_eq!(set.aligned_count(), 6);
        assert_eq!(set.retried, 1);
        let retried = &set.alignments["spk000-utt0001"];
        assert_eq!(retried.beam, 40.0);
        assert_eq!(set.alignments["spk000-utt0000"].beam, 10.0);
        assert!(set.unaligned.is_empty());
        // 6 first-tier attempts + 1 retry, nothing else.
        assert_eq!(engine.align_calls(), 7);
    }

    #[test]
    fn utterance_failing_both_tiers_is_excluded_not_fatal() {
        let corpus = test_corpus(2, 3);
        let subset = full_subset(&corpus);
        let engine = MockEngine::new().with_unalignable(["spk001-utt0002"]);
        let cache = seeded_cache(&corpus, &engine);
        let cancel = CancellationToken::new();
        let runner = AlignmentRunner::new(&engine, SEARCH, 2, &cancel, "00_monophone");

        let set = runner
            .align(
                &test_model(),
                &TransformChain::default(),
                StageData::new(&corpus, &subset, &cache),
                1,
            )
            .unwrap();
        assert_eq!(set.aligned_count(), 5);
        assert_eq!(set.unaligned_ids(), vec!["spk001-utt0002".to_string()]);
        assert_eq!(set.unaligned[0].reason, UnalignedReason::BeamExhausted);
    }

    #[test]
    fn equal_beams_do_not_retry() {
        let corpus = test_corpus(1, 2);
        let subset = full_subset(&corpus);
        let engine = MockEngine::new().with_hard(["spk000-utt0000"]);
        let cache = seeded_cache(&corpus, &engine);
        let cancel = CancellationToken::new();
        let search = AlignmentSearchConfig {
            beam: 10.0,
            retry_beam: 10.0,
        };
        let runner = AlignmentRunner::new(&engine, search, 1, &cancel, "00_monophone");

        let set = runner
            .align(
                &test_model(),
                &TransformChain::default(),
                StageData::new(&corpus, &subset, &cache),
                1,
            )
            .unwrap();
        assert_eq!(set.aligned_count(), 1);
        assert_eq!(engine.align_calls(), 2);
    }

    #[test]
    fn all_failures_raise_alignment_failure() {
        let corpus = test_corpus(2, 2);
        let subset = full_subset(&corpus);
        let engine = MockEngine::new().with_unalignable(
            corpus.utterances().iter().map(|u| u.id.clone()),
        );
        let cache = seeded_cache(&corpus, &engine);
        let cancel = CancellationToken::new();
        let runner = AlignmentRunner::new(&engine, SEARCH, 2, &cancel, "00_monophone");

        let err = runner
            .align(
                &test_model(),
                &TransformChain::default(),
                StageData::new(&corpus, &subset, &cache),
                2,
            )
            .unwrap_err();
        match err {
            TrainingError::Alignment(failure) => {
                assert_eq!(failure.unaligned.len(), 4);
                assert_eq!(failure.retry_beam, 40.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_features_are_reported_as_unaligned() {
        let corpus = test_corpus(1, 3);
        let subset = full_subset(&corpus);
        let engine = MockEngine::new();
        let mut cache = FeatureCache::new();
        for utt in corpus.utterances().iter().skip(1) {
            let features = engine.extract(utt, &FeatureConfig::default()).unwrap();
            cache.insert(utt.id.clone(), features);
        }
        let cancel = CancellationToken::new();
        let runner = AlignmentRunner::new(&engine, SEARCH, 1, &cancel, "00_monophone");

        let set = runner
            .align(
                &test_model(),
                &TransformChain::default(),
                StageData::new(&corpus, &subset, &cache),
                1,
            )
            .unwrap();
        assert_eq!(set.aligned_count(), 2);
        assert!(matches!(
            set.unaligned[0].reason,
            UnalignedReason::FeaturesUnavailable(_)
        ));
    }

    #[test]
    fn identical_inputs_give_identical_alignment_sets() {
        let corpus = test_corpus(3, 4);
        let subset = full_subset(&corpus);
        let engine = MockEngine::new().with_hard(["spk002-utt0003", "spk000-utt0000"]);
        let cache = seeded_cache(&corpus, &engine);
        let cancel = CancellationToken::new();
        let model = test_model();

        let a = AlignmentRunner::new(&engine, SEARCH, 4, &cancel, "s")
            .align(&model, &TransformChain::default(), StageData::new(&corpus, &subset, &cache), 1)
            .unwrap();
        let b = AlignmentRunner::new(&engine, SEARCH, 1, &cancel, "s")
            .align(&model, &TransformChain::default(), StageData::new(&corpus, &subset, &cache), 1)
            .unwrap();
        assert_eq!(a, b);
    }
}

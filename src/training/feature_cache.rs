use std::collections::HashMap;
use std::sync::Arc;

use crate::config::FeatureConfig;
use crate::error::TrainingError;
use crate::pipeline::traits::FeatureExtractor;
use crate::training::worker_pool::{run_ordered, CancellationToken};
use crate::types::{Corpus, Features, UtteranceId};

/// Read-only (during alignment) per-utterance feature store shared by every
/// worker and every stage of a run.
#[derive(Debug, Default)]
pub struct FeatureCache {
    entries: HashMap<UtteranceId, Arc<Features>>,
    failures: HashMap<UtteranceId, String>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Features>> {
        self.entries.get(id).cloned()
    }

    /// Extraction error recorded for `id` by the most recent attempt.
    pub fn failure(&self, id: &str) -> Option<&str> {
        self.failures.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, id: impl Into<UtteranceId>, features: Features) {
        let id = id.into();
        self.failures.remove(&id);
        self.entries.insert(id, Arc::new(features));
    }

    /// Feature dimension of the first cached utterance among `ids`.
    pub fn dim_of(&self, ids: &[UtteranceId]) -> Option<usize> {
        ids.iter()
            .filter_map(|id| self.entries.get(id))
            .map(|f| f.dim())
            .find(|&d| d > 0)
    }

    /// Extracts features for every id in `ids` not cached yet. Previously
    /// failed utterances are attempted again. Returns the number of failures.
    pub(crate) fn ensure(
        &mut self,
        corpus: &Corpus,
        ids: &[UtteranceId],
        extractor: &dyn FeatureExtractor,
        config: &FeatureConfig,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, TrainingError> {
        let missing: Vec<&UtteranceId> = ids
            .iter()
            .filter(|id| !self.entries.contains_key(id.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        tracing::debug!(count = missing.len(), "extracting features");

        let results = run_ordered(&missing, workers, cancel, |id| match corpus.get(id) {
            Some(utt) => extractor.extract(utt, config),
            None => Err(TrainingError::engine(
                "feature extraction",
                format!("utterance {id} is not in the corpus"),
            )),
        })
        .ok_or_else(|| TrainingError::Cancelled {
            stage: "feature extraction".to_string(),
            iteration: None,
        })?;

        let mut failed = 0;
        for (id, result) in missing.into_iter().zip(results) {
            match result {
                Ok(features) if features.num_frames() > 0 => {
                    self.insert(id.clone(), features);
                }
                Ok(_) => {
                    failed += 1;
                    self.failures
                        .insert(id.clone(), "extractor returned no frames".to_string());
                }
                Err(err) => {
                    failed += 1;
                    tracing::warn!(utterance = %id, error = %err, "feature extraction failed");
                    self.failures.insert(id.clone(), err.to_string());
                }
            }
        }
        Ok(failed)
    }
}

use std::sync::Arc;

use crate::config::{FailedUtterancePolicy, TrainingConfiguration};
use crate::error::TrainingError;
use crate::pipeline::checkpoint::{CheckpointKey, CheckpointManifest, CheckpointStore};
use crate::pipeline::traits::{AcousticModelEngine, AlignmentEngine, FeatureExtractor};
use crate::report::TrainingReport;
use crate::training::stage::StageContext;
use crate::training::{
    AlignmentRunner, CancellationToken, CorpusSubsampler, FeatureCache, StageData, StageInput,
    StageOutput, TrainingStage,
};
use crate::types::{AlignmentSet, Corpus, Model, TransformChain};

/// Result of a complete training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Model of the last stage.
    pub model: Arc<Model>,
    /// Alignments of the last stage's subset against `model`.
    pub alignments: Arc<AlignmentSet>,
    pub transforms: TransformChain,
    pub report: TrainingReport,
}

/// Runs the configured stages in order, handing each stage's model,
/// alignments and transforms to the next.
pub struct TrainingPipeline {
    config: TrainingConfiguration,
    feature_extractor: Box<dyn FeatureExtractor>,
    model_engine: Box<dyn AcousticModelEngine>,
    alignment_engine: Box<dyn AlignmentEngine>,
    checkpoints: Option<CheckpointStore>,
    resume: bool,
    cancel: CancellationToken,
    subsampler: CorpusSubsampler,
    workers: usize,
}

pub(crate) struct TrainingPipelineParts {
    pub config: TrainingConfiguration,
    pub feature_extractor: Box<dyn FeatureExtractor>,
    pub model_engine: Box<dyn AcousticModelEngine>,
    pub alignment_engine: Box<dyn AlignmentEngine>,
    pub checkpoints: Option<CheckpointStore>,
    pub resume: bool,
    pub cancel: CancellationToken,
    pub workers: usize,
}

impl TrainingPipeline {
    pub(crate) fn from_parts(parts: TrainingPipelineParts) -> Self {
        let subsampler = CorpusSubsampler::new(
            parts.config.subset_strategy,
            parts.config.prefer_short_utterances,
        );
        Self {
            config: parts.config,
            feature_extractor: parts.feature_extractor,
            model_engine: parts.model_engine,
            alignment_engine: parts.alignment_engine,
            checkpoints: parts.checkpoints,
            resume: parts.resume,
            cancel: parts.cancel,
            subsampler,
            workers: parts.workers,
        }
    }

    pub fn config(&self) -> &TrainingConfiguration {
        &self.config
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Handle that stops the run at the next iteration boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Trains every stage on `corpus` and returns the final model.
    ///
    /// A stage failure aborts the run; later stages are never attempted and
    /// the failed stage is not checkpointed.
    pub fn run(&self, corpus: &Corpus) -> Result<TrainingOutcome, TrainingError> {
        if corpus.is_empty() {
            return Err(TrainingError::config("corpus contains no utterances"));
        }
        tracing::info!(
            utterances = corpus.len(),
            stages = self.config.training.len(),
            workers = self.workers,
            "training started"
        );

        let keys: Vec<CheckpointKey> = (0..self.config.training.len())
            .filter_map(|index| CheckpointKey::new(&self.config, index, corpus))
            .collect();
        let mut manifest = self.prepare_manifest(&keys)?;
        let mut resumable = manifest.as_ref().map_or(0, |m| m.stages.len());

        let mut report = TrainingReport::new(corpus.len());
        let mut features = FeatureCache::new();
        let mut input = StageInput::default();
        let mut last: Option<(Arc<Model>, Arc<AlignmentSet>, TransformChain)> = None;

        for (index, stage) in self.config.training.iter().enumerate() {
            let name = stage.name(index);

            if index < resumable {
                if let Some(output) = self.load_checkpoint(&name) {
                    tracing::info!(stage = %name, "resumed from checkpoint");
                    let (next, handoff) = hand_off(output, &mut report);
                    input = next;
                    last = Some(handoff);
                    continue;
                }
                resumable = index;
                if let (Some(store), Some(manifest)) = (&self.checkpoints, manifest.as_mut()) {
                    manifest.stages.truncate(index);
                    store.save_manifest(manifest)?;
                }
            }

            if self.cancel.is_cancelled() {
                return Err(TrainingError::Cancelled {
                    stage: name,
                    iteration: None,
                });
            }

            let priority = match self.config.failed_utterance_policy {
                FailedUtterancePolicy::Prioritize => input
                    .alignments
                    .as_ref()
                    .map(|a| a.unaligned_ids())
                    .unwrap_or_default(),
                FailedUtterancePolicy::Ignore => Vec::new(),
            };
            let subset = self.subsampler.select(
                corpus,
                stage.common().subset_size(),
                self.config.seed.wrapping_add(index as u64),
                &priority,
            );
            tracing::info!(
                stage = %name,
                selected = subset.len(),
                full_corpus = subset.is_full_corpus,
                carried_over = priority.len(),
                "subset selected"
            );

            let failed = features.ensure(
                corpus,
                &subset.utterance_ids,
                self.feature_extractor.as_ref(),
                &self.config.features,
                self.workers,
                &self.cancel,
            )?;
            if failed > 0 {
                tracing::warn!(
                    stage = %name,
                    failed,
                    "feature extraction failed for some utterances"
                );
            }

            let runner = AlignmentRunner::new(
                self.alignment_engine.as_ref(),
                self.config.search(),
                self.workers,
                &self.cancel,
                &name,
            );
            let ctx = StageContext {
                index,
                name: &name,
                config: stage,
                data: StageData::new(corpus, &subset, &features),
                engine: self.model_engine.as_ref(),
                runner: &runner,
                workers: self.workers,
                cancel: &self.cancel,
            };

            match TrainingStage::new(ctx).run(&input) {
                Ok(output) => {
                    if let (Some(store), Some(manifest), Some(key)) =
                        (&self.checkpoints, manifest.as_mut(), keys.get(index))
                    {
                        store.save_stage(manifest, key.clone(), &output)?;
                    }
                    let (next, handoff) = hand_off(output, &mut report);
                    input = next;
                    last = Some(handoff);
                }
                Err(abort) => {
                    if let (Some(store), Some(model)) = (&self.checkpoints, &abort.partial_model) {
                        match store.save_partial_model(&name, model) {
                            Ok(path) => tracing::info!(
                                stage = %name,
                                path = %path.display(),
                                "partial model saved"
                            ),
                            Err(err) => tracing::warn!(
                                stage = %name,
                                error = %err,
                                "could not save partial model"
                            ),
                        }
                    }
                    return Err(abort.error);
                }
            }
        }

        let (model, alignments, transforms) =
            last.ok_or_else(|| TrainingError::config("training must declare at least one stage"))?;
        tracing::info!(
            num_gaussians = model.num_gaussians,
            trained = report.trained_stage_count(),
            resumed = report.stages.len() - report.trained_stage_count(),
            "training complete"
        );
        Ok(TrainingOutcome {
            model,
            alignments,
            transforms,
            report,
        })
    }

    /// Loads the manifest and drops entries that no longer match the
    /// configuration. `None` when checkpointing is off.
    fn prepare_manifest(
        &self,
        keys: &[CheckpointKey],
    ) -> Result<Option<CheckpointManifest>, TrainingError> {
        let Some(store) = &self.checkpoints else {
            return Ok(None);
        };
        let mut manifest = store.load_manifest()?;
        let keep = if self.resume {
            manifest.matching_prefix(keys)
        } else {
            0
        };
        if manifest.stages.len() > keep {
            tracing::info!(
                kept = keep,
                discarded = manifest.stages.len() - keep,
                "discarding stale checkpoints"
            );
            manifest.stages.truncate(keep);
            store.save_manifest(&manifest)?;
        }
        Ok(Some(manifest))
    }

    fn load_checkpoint(&self, name: &str) -> Option<StageOutput> {
        let store = self.checkpoints.as_ref()?;
        match store.load_stage(name) {
            Ok(output) => Some(output),
            Err(err) => {
                tracing::warn!(
                    stage = name,
                    error = %err,
                    "checkpoint unreadable, retraining from this stage"
                );
                None
            }
        }
    }
}

fn hand_off(
    output: StageOutput,
    report: &mut TrainingReport,
) -> (StageInput, (Arc<Model>, Arc<AlignmentSet>, TransformChain)) {
    let StageOutput {
        model,
        alignments,
        transforms,
        report: stage_report,
    } = output;
    report.stages.push(stage_report);
    let alignments = Arc::new(alignments);
    let input = StageInput {
        model: Some(Arc::clone(&model)),
        alignments: Some(Arc::clone(&alignments)),
        transforms: transforms.clone(),
    };
    (input, (model, alignments, transforms))
}

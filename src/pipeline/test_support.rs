//! Deterministic in-memory engines for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::{FeatureConfig, StageKind};
use crate::error::TrainingError;
use crate::pipeline::traits::{
    AcousticModelEngine, AlignmentEngine, FeatureExtractor, FlatStartRequest, FmllrRequest,
    LdaRequest, MlltRequest, TreeRequest,
};
use crate::training::FeatureCache;
use crate::types::{
    Corpus, Features, LdaTransform, Model, Segment, SufficientStats, TransformChain, Utterance,
    UtteranceAlignment,
};

pub(crate) const FEATURE_DIM: usize = 13;
/// Beam at which utterances marked hard start aligning.
pub(crate) const HARD_BEAM: f64 = 40.0;

#[derive(Default)]
pub(crate) struct MockEngine {
    hard: HashSet<String>,
    unalignable: HashSet<String>,
    unreadable: HashSet<String>,
    unaccumulable: HashSet<String>,
    failing_speakers: HashSet<String>,
    failing_kind: Option<StageKind>,
    diverge_after: Option<u32>,
    unalignable_from: Option<u32>,
    extract_calls: AtomicUsize,
    align_calls: AtomicUsize,
    reestimate_calls: AtomicUsize,
    mllt_calls: AtomicUsize,
    fmllr_calls: AtomicUsize,
    seeds: Mutex<Vec<(StageKind, StageKind)>>,
}

fn to_set<I, S>(ids: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ids.into_iter().map(Into::into).collect()
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Utterances that only align at [`HARD_BEAM`] or wider.
    pub(crate) fn with_hard<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hard = to_set(ids);
        self
    }

    pub(crate) fn with_unalignable<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unalignable = to_set(ids);
        self
    }

    pub(crate) fn with_unreadable<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unreadable = to_set(ids);
        self
    }

    pub(crate) fn with_unaccumulable<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unaccumulable = to_set(ids);
        self
    }

    pub(crate) fn with_failing_speakers<I, S>(mut self, speakers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_speakers = to_set(speakers);
        self
    }

    /// Seeding a stage of `kind` fails with an engine error.
    pub(crate) fn with_failing_kind(mut self, kind: StageKind) -> Self {
        self.failing_kind = Some(kind);
        self
    }

    /// Statistics turn non-finite once the model reaches `generation`.
    pub(crate) fn with_divergence_after(mut self, generation: u32) -> Self {
        self.diverge_after = Some(generation);
        self
    }

    /// Nothing aligns against models of `generation` or later.
    pub(crate) fn with_alignment_lost_at(mut self, generation: u32) -> Self {
        self.unalignable_from = Some(generation);
        self
    }

    pub(crate) fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn align_calls(&self) -> usize {
        self.align_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn reestimate_calls(&self) -> usize {
        self.reestimate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn mllt_calls(&self) -> usize {
        self.mllt_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fmllr_calls(&self) -> usize {
        self.fmllr_calls.load(Ordering::SeqCst)
    }

    /// `(built kind, seed model kind)` for every tree built so far.
    pub(crate) fn seeds(&self) -> Vec<(StageKind, StageKind)> {
        self.seeds.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn check_kind(&self, kind: StageKind) -> Result<(), TrainingError> {
        if self.failing_kind == Some(kind) {
            return Err(TrainingError::engine("seed model", format!("{kind} seeding failed")));
        }
        Ok(())
    }
}

impl FeatureExtractor for MockEngine {
    fn extract(
        &self,
        utterance: &Utterance,
        _config: &FeatureConfig,
    ) -> Result<Features, TrainingError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreadable.contains(&utterance.id) {
            return Err(TrainingError::engine("extract features", "unreadable audio"));
        }
        let num_frames = utterance.duration_ms.map_or(50, |ms| (ms / 10).max(1)) as usize;
        let seed = utterance.id.bytes().map(u32::from).sum::<u32>() % 17;
        let frames = (0..num_frames)
            .map(|t| {
                (0..FEATURE_DIM)
                    .map(|d| ((seed as usize + t + d) % 23) as f32 * 0.1)
                    .collect()
            })
            .collect();
        Ok(Features { frames })
    }
}

impl AlignmentEngine for MockEngine {
    fn align(
        &self,
        model: &Model,
        _transforms: &TransformChain,
        utterance: &Utterance,
        features: &Features,
        beam: f64,
    ) -> Result<Option<UtteranceAlignment>, TrainingError> {
        self.align_calls.fetch_add(1, Ordering::SeqCst);
        if self.unalignable.contains(&utterance.id)
            || (self.hard.contains(&utterance.id) && beam < HARD_BEAM)
            || self.unalignable_from.is_some_and(|g| model.generation >= g)
        {
            return Ok(None);
        }
        let num_frames = features.num_frames();
        let end_ms = num_frames as u64 * 10;
        Ok(Some(UtteranceAlignment {
            utterance_id: utterance.id.clone(),
            beam,
            log_likelihood: -(num_frames as f64) * (1.0 + 1.0 / (model.generation as f64 + 1.0)),
            num_frames,
            phones: vec![Segment {
                label: "sil".to_string(),
                start_ms: 0,
                end_ms,
            }],
            words: vec![Segment {
                label: utterance.transcript.clone(),
                start_ms: 0,
                end_ms,
            }],
        }))
    }
}

impl AcousticModelEngine for MockEngine {
    fn flat_start(&self, request: &FlatStartRequest<'_>) -> Result<Model, TrainingError> {
        self.check_kind(StageKind::Monophone)?;
        Ok(Model {
            kind: StageKind::Monophone,
            generation: 0,
            num_gaussians: request
                .initial_gaussians
                .unwrap_or_else(|| (request.max_gaussians / 10).max(1)),
            num_leaves: 40,
            feature_dim: request.feature_dim,
            silence_boost: 1.0,
            log_likelihood: None,
            parameters: vec![0.0; 4],
        })
    }

    fn build_tree(&self, request: &TreeRequest<'_>) -> Result<Model, TrainingError> {
        self.check_kind(request.kind)?;
        if let Ok(mut seeds) = self.seeds.lock() {
            seeds.push((request.kind, request.seed.kind));
        }
        let feature_dim = request
            .transforms
            .lda
            .as_ref()
            .map_or(request.seed.feature_dim, |lda| lda.dimension);
        Ok(Model {
            kind: request.kind,
            generation: 0,
            num_gaussians: request.num_leaves,
            num_leaves: request.num_leaves,
            feature_dim,
            silence_boost: 1.0,
            log_likelihood: None,
            parameters: request.seed.parameters.clone(),
        })
    }

    fn estimate_lda(&self, request: &LdaRequest<'_>) -> Result<LdaTransform, TrainingError> {
        self.check_kind(StageKind::Lda)?;
        Ok(LdaTransform {
            splice: request.splice,
            dimension: request.dimension,
            matrix: vec![0.5; request.dimension * request.splice.width()],
            mllt_updates: 0,
        })
    }

    fn update_mllt(
        &self,
        request: &MlltRequest<'_>,
    ) -> Result<(LdaTransform, Model), TrainingError> {
        self.mllt_calls.fetch_add(1, Ordering::SeqCst);
        let lda = LdaTransform {
            mllt_updates: request.lda.mllt_updates + 1,
            ..request.lda.clone()
        };
        Ok((lda, request.model.clone()))
    }

    fn estimate_fmllr(&self, request: &FmllrRequest<'_>) -> Result<Vec<f64>, TrainingError> {
        self.fmllr_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_speakers.contains(request.speaker) {
            return Err(TrainingError::engine("estimate fmllr", "singular statistics"));
        }
        Ok(vec![1.0, request.utterance_ids.len() as f64])
    }

    fn accumulate(
        &self,
        model: &Model,
        _transforms: &TransformChain,
        utterance: &Utterance,
        _features: &Features,
        alignment: &UtteranceAlignment,
    ) -> Result<SufficientStats, TrainingError> {
        if self.unaccumulable.contains(&utterance.id) {
            return Err(TrainingError::engine("accumulate", "invalid alignment"));
        }
        let diverged = self.diverge_after.is_some_and(|g| model.generation >= g);
        Ok(SufficientStats {
            utterances: 1,
            num_frames: alignment.num_frames as u64,
            log_likelihood: if diverged { f64::NAN } else { alignment.log_likelihood },
            accumulators: vec![alignment.num_frames as f64, 1.0],
        })
    }

    fn reestimate(
        &self,
        model: &Model,
        stats: &SufficientStats,
        target_gaussians: usize,
    ) -> Result<Model, TrainingError> {
        self.reestimate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Model {
            generation: model.generation + 1,
            num_gaussians: target_gaussians,
            log_likelihood: stats.log_likelihood_per_frame(),
            parameters: stats.accumulators.clone(),
            ..model.clone()
        })
    }
}

/// `speakers * per_speaker` utterances with ids `spkSSS-uttUUUU`, in
/// speaker-major order. Durations vary so shortest-first selection has
/// something to sort.
pub(crate) fn test_corpus(speakers: usize, per_speaker: usize) -> Corpus {
    let mut utterances = Vec::with_capacity(speakers * per_speaker);
    for s in 0..speakers {
        for u in 0..per_speaker {
            let n = s * per_speaker + u;
            utterances.push(Utterance {
                id: format!("spk{s:03}-utt{u:04}"),
                speaker: Some(format!("spk{s:03}")),
                transcript: "the cat sat".to_string(),
                audio_path: None,
                features_path: None,
                duration_ms: Some(500 + 70 * (n as u64 % 13)),
            });
        }
    }
    match Corpus::new(utterances) {
        Ok(corpus) => corpus,
        Err(err) => panic!("test corpus is valid: {err}"),
    }
}

/// Cache holding features for every corpus utterance the engine can read.
pub(crate) fn seeded_cache(corpus: &Corpus, engine: &MockEngine) -> FeatureCache {
    let config = FeatureConfig::default();
    let mut cache = FeatureCache::new();
    for utt in corpus.utterances() {
        if let Ok(features) = engine.extract(utt, &config) {
            cache.insert(utt.id.clone(), features);
        }
    }
    cache
}

pub(crate) fn test_model() -> Model {
    Model {
        kind: StageKind::Monophone,
        generation: 0,
        num_gaussians: 100,
        num_leaves: 40,
        feature_dim: FEATURE_DIM,
        silence_boost: 1.0,
        log_likelihood: None,
        parameters: Vec::new(),
    }
}

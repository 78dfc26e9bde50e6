use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{FmllrUpdateType, SpliceContext, StageKind, SubsetSize};
use crate::error::TrainingError;

pub type UtteranceId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub id: UtteranceId,
    #[serde(default)]
    pub speaker: Option<String>,
    pub transcript: String,
    #[serde(default)]
    pub audio_path: Option<PathBuf>,
    /// Precomputed feature frames, read by `JsonFeatureReader`.
    #[serde(default)]
    pub features_path: Option<PathBuf>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Full utterance set with speaker metadata, as handed over by the corpus loader.
#[derive(Debug, Clone)]
pub struct Corpus {
    utterances: Vec<Utterance>,
    index: HashMap<UtteranceId, usize>,
}

impl Corpus {
    pub fn new(utterances: Vec<Utterance>) -> Result<Self, TrainingError> {
        let mut index = HashMap::with_capacity(utterances.len());
        for (pos, utt) in utterances.iter().enumerate() {
            if index.insert(utt.id.clone(), pos).is_some() {
                return Err(TrainingError::config(format!(
                    "duplicate utterance id in corpus: {}",
                    utt.id
                )));
            }
        }
        Ok(Self { utterances, index })
    }

    /// Reads a JSON array of utterances.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TrainingError::io("read corpus manifest", e))?;
        let utterances: Vec<Utterance> = serde_json::from_str(&data)
            .map_err(|e| TrainingError::json("parse corpus manifest", e))?;
        Self::new(utterances)
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn get(&self, id: &str) -> Option<&Utterance> {
        self.index.get(id).map(|&pos| &self.utterances[pos])
    }

    /// Position of an utterance in corpus order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

/// Ordered utterance ids selected for one stage. Always a subset of the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    pub requested: SubsetSize,
    pub utterance_ids: Vec<UtteranceId>,
    pub is_full_corpus: bool,
}

impl Subset {
    pub fn len(&self) -> usize {
        self.utterance_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterance_ids.is_empty()
    }
}

/// Frame sequence produced by the feature extractor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Features {
    pub frames: Vec<Vec<f32>>,
}

impl Features {
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn dim(&self) -> usize {
        self.frames.first().map_or(0, Vec::len)
    }
}

/// Trained acoustic model artifact. Never mutated after publication; each
/// re-estimation produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub kind: StageKind,
    /// Number of re-estimations applied since the stage seeded this model.
    pub generation: u32,
    pub num_gaussians: usize,
    pub num_leaves: usize,
    pub feature_dim: usize,
    /// Silence weight multiplier in effect for alignment. 1.0 means unboosted.
    pub silence_boost: f64,
    /// Average per-frame log-likelihood of the statistics that produced this model.
    pub log_likelihood: Option<f64>,
    /// Engine-owned parameter payload.
    pub parameters: Vec<f64>,
}

impl Model {
    /// Equality up to `tolerance` on every numeric field.
    pub fn approx_eq(&self, other: &Model, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance;
        self.kind == other.kind
            && self.num_gaussians == other.num_gaussians
            && self.num_leaves == other.num_leaves
            && self.feature_dim == other.feature_dim
            && close(self.silence_boost, other.silence_boost)
            && match (self.log_likelihood, other.log_likelihood) {
                (Some(a), Some(b)) => close(a, b),
                (None, None) => true,
                _ => false,
            }
            && self.parameters.len() == other.parameters.len()
            && self
                .parameters
                .iter()
                .zip(&other.parameters)
                .all(|(&a, &b)| close(a, b))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdaTransform {
    pub splice: SpliceContext,
    pub dimension: usize,
    /// Row-major `dimension x (input_dim * splice width)` matrix.
    pub matrix: Vec<f64>,
    pub mllt_updates: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTransforms {
    pub update_type: FmllrUpdateType,
    pub per_speaker: BTreeMap<String, Vec<f64>>,
}

/// Feature-space transforms handed from stage to stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformChain {
    pub lda: Option<LdaTransform>,
    pub fmllr: Option<SpeakerTransforms>,
}

impl TransformChain {
    pub fn is_empty(&self) -> bool {
        self.lda.is_none() && self.fmllr.is_none()
    }

    pub fn speaker_transform(&self, speaker: &str) -> Option<&[f64]> {
        self.fmllr
            .as_ref()
            .and_then(|t| t.per_speaker.get(speaker))
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub label: String,
    /// Millisecond interval is [start_ms, end_ms).
    pub start_ms: u64,
    pub end_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceAlignment {
    pub utterance_id: UtteranceId,
    /// Beam that produced this path.
    pub beam: f64,
    pub log_likelihood: f64,
    pub num_frames: usize,
    pub phones: Vec<Segment>,
    pub words: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnalignedReason {
    /// No complete path within the retry beam.
    BeamExhausted,
    FeaturesUnavailable(String),
    Engine(String),
    Accumulation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnalignedUtterance {
    pub utterance_id: UtteranceId,
    pub reason: UnalignedReason,
}

/// Alignments produced against one model snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlignmentSet {
    pub iteration: u32,
    pub alignments: BTreeMap<UtteranceId, UtteranceAlignment>,
    pub unaligned: Vec<UnalignedUtterance>,
    /// Utterances that needed the retry beam.
    pub retried: usize,
}

impl AlignmentSet {
    pub fn aligned_count(&self) -> usize {
        self.alignments.len()
    }

    pub fn unaligned_ids(&self) -> Vec<UtteranceId> {
        self.unaligned
            .iter()
            .map(|u| u.utterance_id.clone())
            .collect()
    }

    /// Moves an aligned utterance to the unaligned list.
    pub(crate) fn exclude(&mut self, utterance_id: &str, reason: UnalignedReason) {
        if self.alignments.remove(utterance_id).is_some() {
            self.unaligned.push(UnalignedUtterance {
                utterance_id: utterance_id.to_string(),
                reason,
            });
        }
    }
}

/// Summable per-utterance statistics. Merging is element-wise addition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SufficientStats {
    pub utterances: usize,
    pub num_frames: u64,
    pub log_likelihood: f64,
    pub accumulators: Vec<f64>,
}

impl SufficientStats {
    pub fn merge(&mut self, other: &SufficientStats) {
        self.utterances += other.utterances;
        self.num_frames += other.num_frames;
        self.log_likelihood += other.log_likelihood;
        if self.accumulators.len() < other.accumulators.len() {
            self.accumulators.resize(other.accumulators.len(), 0.0);
        }
        for (acc, &v) in self.accumulators.iter_mut().zip(&other.accumulators) {
            *acc += v;
        }
    }

    pub fn log_likelihood_per_frame(&self) -> Option<f64> {
        (self.num_frames > 0).then(|| self.log_likelihood / self.num_frames as f64)
    }
}

//! On-disk stage checkpoints.
//!
//! Layout under the checkpoint root:
//!
//! ```text
//! manifest.json
//! 00_monophone/model.json
//! 00_monophone/alignments.json
//! 00_monophone/transforms.json
//! 00_monophone/report.json
//! 01_triphone/partial_model.json   (failed stage, never listed in the manifest)
//! ```
//!
//! Stage files are written before the manifest entry that names them, so a
//! stage appears in the manifest only once all of its files are complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{
    AlignmentSearchConfig, FailedUtterancePolicy, FeatureConfig, StageConfig, StageKind,
    SubsetStrategy, TrainingConfiguration,
};
use crate::error::TrainingError;
use crate::report::StageReport;
use crate::training::StageOutput;
use crate::types::{AlignmentSet, Corpus, Model, TransformChain};

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;
const MODEL_FILE: &str = "model.json";
const ALIGNMENTS_FILE: &str = "alignments.json";
const TRANSFORMS_FILE: &str = "transforms.json";
const REPORT_FILE: &str = "report.json";
const PARTIAL_MODEL_FILE: &str = "partial_model.json";

/// Everything that determines a stage's result. A checkpoint is reused only
/// when its key equals the key computed for the current run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub stage: StageConfig,
    pub search: AlignmentSearchConfig,
    pub features: FeatureConfig,
    pub seed: u64,
    pub subset_strategy: SubsetStrategy,
    pub prefer_short_utterances: bool,
    pub failed_utterance_policy: FailedUtterancePolicy,
    pub corpus_size: usize,
    pub corpus_fingerprint: String,
}

impl CheckpointKey {
    pub fn new(config: &TrainingConfiguration, index: usize, corpus: &Corpus) -> Option<Self> {
        let stage = config.training.get(index)?.clone();
        Some(Self {
            stage,
            search: config.search(),
            features: config.features.clone(),
            seed: config.seed.wrapping_add(index as u64),
            subset_strategy: config.subset_strategy,
            prefer_short_utterances: config.prefer_short_utterances,
            failed_utterance_policy: config.failed_utterance_policy,
            corpus_size: corpus.len(),
            corpus_fingerprint: corpus_fingerprint(corpus),
        })
    }
}

/// SHA-256 over utterance ids and speakers in corpus order, as lowercase hex.
fn corpus_fingerprint(corpus: &Corpus) -> String {
    let mut hasher = Sha256::new();
    for utt in corpus.utterances() {
        hasher.update(utt.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(utt.speaker.as_deref().unwrap_or("").as_bytes());
        hasher.update([0xffu8]);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub index: usize,
    pub name: String,
    pub kind: StageKind,
    pub key: CheckpointKey,
    pub completed_at: String,
    pub num_gaussians: usize,
    pub aligned: usize,
    pub unaligned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub stages: Vec<CheckpointEntry>,
}

impl Default for CheckpointManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            stages: Vec::new(),
        }
    }
}

impl CheckpointManifest {
    /// Number of leading stages whose recorded key equals `keys`. Resuming
    /// stops at the first mismatch: later stages depend on earlier output.
    pub fn matching_prefix(&self, keys: &[CheckpointKey]) -> usize {
        self.stages
            .iter()
            .zip(keys)
            .enumerate()
            .take_while(|(index, (entry, key))| entry.index == *index && entry.key == **key)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TrainingError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| TrainingError::io("create checkpoint directory", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Missing manifest means no completed stages.
    pub fn load_manifest(&self) -> Result<CheckpointManifest, TrainingError> {
        let path = self.root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(CheckpointManifest::default());
        }
        let manifest: CheckpointManifest = read_json(&path, "parse checkpoint manifest")?;
        if manifest.version != MANIFEST_VERSION {
            tracing::warn!(
                found = manifest.version,
                expected = MANIFEST_VERSION,
                "ignoring checkpoint manifest with a different version"
            );
            return Ok(CheckpointManifest::default());
        }
        Ok(manifest)
    }

    pub fn save_manifest(&self, manifest: &CheckpointManifest) -> Result<(), TrainingError> {
        write_json(&self.root.join(MANIFEST_FILE), manifest)
    }

    /// Writes the stage artifacts, then records the stage in `manifest`,
    /// dropping any entries for later stages.
    pub fn save_stage(
        &self,
        manifest: &mut CheckpointManifest,
        key: CheckpointKey,
        output: &StageOutput,
    ) -> Result<(), TrainingError> {
        let dir = self.stage_dir(&output.report.name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| TrainingError::io("create stage checkpoint directory", e))?;
        write_json(&dir.join(MODEL_FILE), output.model.as_ref())?;
        write_json(&dir.join(ALIGNMENTS_FILE), &output.alignments)?;
        write_json(&dir.join(TRANSFORMS_FILE), &output.transforms)?;
        write_json(&dir.join(REPORT_FILE), &output.report)?;
        // Left behind by an earlier failed run of this stage.
        match std::fs::remove_file(dir.join(PARTIAL_MODEL_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(TrainingError::io("remove stale partial model", e)),
        }

        let index = output.report.index;
        manifest.stages.truncate(index);
        manifest.stages.push(CheckpointEntry {
            index,
            name: output.report.name.clone(),
            kind: output.report.kind,
            key,
            completed_at: Utc::now().to_rfc3339(),
            num_gaussians: output.model.num_gaussians,
            aligned: output.alignments.aligned_count(),
            unaligned: output.alignments.unaligned.len(),
        });
        self.save_manifest(manifest)?;
        tracing::info!(stage = %output.report.name, dir = %dir.display(), "checkpoint written");
        Ok(())
    }

    /// Loads a completed stage. The returned report is marked as resumed.
    pub fn load_stage(&self, name: &str) -> Result<StageOutput, TrainingError> {
        let dir = self.stage_dir(name);
        let model: Model = read_json(&dir.join(MODEL_FILE), "parse checkpoint model")?;
        let alignments: AlignmentSet =
            read_json(&dir.join(ALIGNMENTS_FILE), "parse checkpoint alignments")?;
        let transforms: TransformChain =
            read_json(&dir.join(TRANSFORMS_FILE), "parse checkpoint transforms")?;
        let mut report: StageReport = read_json(&dir.join(REPORT_FILE), "parse checkpoint report")?;
        report.resumed = true;
        Ok(StageOutput {
            model: Arc::new(model),
            alignments,
            transforms,
            report,
        })
    }

    /// Keeps the last intermediate model of a failed stage for inspection.
    pub fn save_partial_model(&self, name: &str, model: &Model) -> Result<PathBuf, TrainingError> {
        let dir = self.stage_dir(name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| TrainingError::io("create stage checkpoint directory", e))?;
        let path = dir.join(PARTIAL_MODEL_FILE);
        write_json(&path, model)?;
        Ok(path)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path, context: &'static str) -> Result<T, TrainingError> {
    let data =
        std::fs::read_to_string(path).map_err(|e| TrainingError::io("read checkpoint file", e))?;
    serde_json::from_str(&data).map_err(|e| TrainingError::json(context, e))
}

/// Write-then-rename so readers never observe a half-written file.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| TrainingError::json("serialize checkpoint file", e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).map_err(|e| TrainingError::io("write checkpoint file", e))?;
    std::fs::rename(&tmp, path).map_err(|e| TrainingError::io("rename checkpoint file", e))
}

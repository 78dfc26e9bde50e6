use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::StageKind;
use crate::error::TrainingError;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub schema_version: u32,
    pub generated_at: String,
    pub corpus_size: usize,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub index: usize,
    pub name: String,
    pub kind: StageKind,
    pub subset_size: usize,
    pub full_corpus: bool,
    /// Loaded from a checkpoint instead of trained.
    pub resumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_alignment: Option<AlignmentSummary>,
    pub iterations: Vec<IterationReport>,
    pub final_num_gaussians: usize,
    pub final_alignment: AlignmentSummary,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlignmentSummary {
    pub aligned: usize,
    pub retried: usize,
    pub unaligned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub realigned: bool,
    pub alignment: AlignmentSummary,
    pub transforms_refined: bool,
    pub target_gaussians: usize,
    pub num_gaussians: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_likelihood_per_frame: Option<f64>,
}

impl TrainingReport {
    pub fn new(corpus_size: usize) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            generated_at: Utc::now().to_rfc3339(),
            corpus_size,
            stages: Vec::new(),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, TrainingError> {
        serde_json::to_string_pretty(self).map_err(|e| TrainingError::json("serialize report", e))
    }

    pub fn trained_stage_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.resumed).count()
    }
}

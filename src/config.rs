use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Parsed training configuration. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfiguration {
    #[serde(default = "default_beam")]
    pub beam: f64,
    #[serde(default = "default_retry_beam")]
    pub retry_beam: f64,
    #[serde(default = "default_true")]
    pub use_mp: bool,
    /// Worker count for parallel alignment. `None` uses available parallelism.
    #[serde(default)]
    pub num_jobs: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub failed_utterance_policy: FailedUtterancePolicy,
    #[serde(default)]
    pub subset_strategy: SubsetStrategy,
    #[serde(default = "default_true")]
    pub prefer_short_utterances: bool,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub training: Vec<StageConfig>,
}

fn default_beam() -> f64 {
    TrainingConfiguration::DEFAULT_BEAM
}
fn default_retry_beam() -> f64 {
    TrainingConfiguration::DEFAULT_RETRY_BEAM
}
fn default_true() -> bool {
    true
}
fn default_seed() -> u64 {
    TrainingConfiguration::DEFAULT_SEED
}

impl TrainingConfiguration {
    pub const DEFAULT_BEAM: f64 = 10.0;
    pub const DEFAULT_RETRY_BEAM: f64 = 40.0;
    pub const DEFAULT_SEED: u64 = 1234;

    pub fn from_yaml_str(yaml: &str) -> Result<Self, TrainingError> {
        serde_yaml::from_str(yaml).map_err(|e| TrainingError::yaml("parse training config", e))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TrainingError::io("read training config", e))?;
        Self::from_yaml_str(&data)
    }

    pub fn search(&self) -> AlignmentSearchConfig {
        AlignmentSearchConfig {
            beam: self.beam,
            retry_beam: self.retry_beam,
        }
    }

    /// Number of alignment workers this configuration asks for.
    pub fn worker_count(&self) -> usize {
        if !self.use_mp {
            return 1;
        }
        self.num_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Checks every cross-stage and per-stage constraint. Nothing runs
    /// before this passes.
    pub fn validate(&self) -> Result<(), TrainingError> {
        self.search().validate()?;
        self.features.validate()?;
        if self.num_jobs == Some(0) {
            return Err(TrainingError::config("num_jobs must be positive"));
        }
        if self.training.is_empty() {
            return Err(TrainingError::config("training must declare at least one stage"));
        }

        let mut prev_max_gaussians: Option<(String, usize)> = None;
        let mut lda_available = false;
        for (index, stage) in self.training.iter().enumerate() {
            let name = stage.name(index);
            stage.validate(&name)?;
            if index == 0 && stage.kind() != StageKind::Monophone {
                return Err(TrainingError::config(format!(
                    "{name}: the first stage must be monophone, other kinds reseed from a previous model"
                )));
            }

            let max_gaussians = stage.common().max_gaussians;
            if let Some((prev_name, prev_max)) = &prev_max_gaussians {
                if max_gaussians < *prev_max {
                    return Err(TrainingError::config(format!(
                        "{name}: max_gaussians {max_gaussians} is lower than {prev_max} declared by {prev_name}"
                    )));
                }
            }
            prev_max_gaussians = Some((name.clone(), max_gaussians));

            if stage.requires_lda_transform() && !lda_available {
                return Err(TrainingError::config(format!(
                    "{name}: lda: true requires an lda transform, but no earlier stage passes one on"
                )));
            }
            // Tracks what each stage hands to the next: lda stages produce the
            // transform, sat stages without `lda: true` drop it.
            match stage {
                StageConfig::Lda(_) => lda_available = true,
                StageConfig::Sat(p) if !p.lda => lda_available = false,
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSearchConfig {
    pub beam: f64,
    pub retry_beam: f64,
}

impl AlignmentSearchConfig {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if !(self.beam.is_finite() && self.beam > 0.0) {
            return Err(TrainingError::config(format!(
                "beam must be positive, got {}",
                self.beam
            )));
        }
        if !(self.retry_beam.is_finite() && self.retry_beam >= self.beam) {
            return Err(TrainingError::config(format!(
                "retry_beam ({}) must be at least beam ({})",
                self.retry_beam, self.beam
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(rename = "type", default = "default_feature_type")]
    pub feature_type: String,
    #[serde(default)]
    pub use_energy: bool,
    /// Frame shift in milliseconds.
    #[serde(default = "default_frame_shift")]
    pub frame_shift: u32,
    #[serde(default)]
    pub use_pitch: bool,
}

fn default_feature_type() -> String {
    "mfcc".to_string()
}
fn default_frame_shift() -> u32 {
    FeatureConfig::DEFAULT_FRAME_SHIFT_MS
}

impl FeatureConfig {
    pub const DEFAULT_FRAME_SHIFT_MS: u32 = 10;

    fn validate(&self) -> Result<(), TrainingError> {
        if self.frame_shift == 0 {
            return Err(TrainingError::config("features.frame_shift must be positive"));
        }
        if self.feature_type.trim().is_empty() {
            return Err(TrainingError::config("features.type must not be empty"));
        }
        Ok(())
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            feature_type: default_feature_type(),
            use_energy: false,
            frame_shift: Self::DEFAULT_FRAME_SHIFT_MS,
            use_pitch: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedUtterancePolicy {
    /// Subset selection ignores earlier alignment failures.
    #[default]
    Ignore,
    /// Utterances left unaligned by the previous stage are selected first.
    Prioritize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsetStrategy {
    #[default]
    SpeakerBalanced,
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Monophone,
    Triphone,
    Lda,
    Sat,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monophone => "monophone",
            Self::Triphone => "triphone",
            Self::Lda => "lda",
            Self::Sat => "sat",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubsetSize {
    Full,
    Utterances(usize),
}

/// Parameters shared by every stage kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonStageParams {
    pub num_iterations: u32,
    pub max_gaussians: usize,
    /// Utterance count; 0 or absent trains on the full corpus.
    #[serde(default)]
    pub subset: Option<usize>,
    #[serde(default)]
    pub boost_silence: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
    /// 1-based iterations that realign. Absent means every iteration.
    #[serde(default)]
    pub realignment_iterations: Option<Vec<u32>>,
}

impl CommonStageParams {
    pub const DEFAULT_POWER: f64 = 0.25;

    pub fn subset_size(&self) -> SubsetSize {
        match self.subset {
            None | Some(0) => SubsetSize::Full,
            Some(n) => SubsetSize::Utterances(n),
        }
    }

    pub fn power(&self) -> f64 {
        self.power.unwrap_or(Self::DEFAULT_POWER)
    }

    pub fn boost_silence(&self) -> Option<f64> {
        self.boost_silence.filter(|&b| b != 1.0)
    }

    pub fn realigns_on(&self, iteration: u32) -> bool {
        iteration == 1
            || self
                .realignment_iterations
                .as_ref()
                .map_or(true, |its| its.contains(&iteration))
    }

    fn validate(&self, name: &str) -> Result<(), TrainingError> {
        if self.num_iterations == 0 {
            return Err(TrainingError::config(format!(
                "{name}: num_iterations must be positive"
            )));
        }
        if self.max_gaussians == 0 {
            return Err(TrainingError::config(format!(
                "{name}: max_gaussians must be positive"
            )));
        }
        if let Some(boost) = self.boost_silence {
            if !(boost.is_finite() && boost >= 1.0) {
                return Err(TrainingError::config(format!(
                    "{name}: boost_silence must be >= 1, got {boost}"
                )));
            }
        }
        if let Some(power) = self.power {
            if !(power > 0.0 && power <= 1.0) {
                return Err(TrainingError::config(format!(
                    "{name}: power must be in (0, 1], got {power}"
                )));
            }
        }
        if let Some(its) = &self.realignment_iterations {
            check_iterations(name, "realignment_iterations", its, self.num_iterations)?;
        }
        Ok(())
    }
}

fn check_iterations(
    name: &str,
    key: &str,
    iterations: &[u32],
    num_iterations: u32,
) -> Result<(), TrainingError> {
    if let Some(bad) = iterations
        .iter()
        .find(|&&it| it == 0 || it > num_iterations)
    {
        return Err(TrainingError::config(format!(
            "{name}: {key} entry {bad} is outside 1..={num_iterations}"
        )));
    }
    Ok(())
}

fn default_transform_iterations(num_iterations: u32) -> Vec<u32> {
    [2, 4, 6, 12]
        .into_iter()
        .filter(|&it| it <= num_iterations)
        .collect()
}

fn check_num_leaves(
    name: &str,
    num_leaves: Option<usize>,
    max_gaussians: usize,
) -> Result<(), TrainingError> {
    match num_leaves {
        Some(0) => Err(TrainingError::config(format!(
            "{name}: num_leaves must be positive"
        ))),
        Some(n) if n > max_gaussians => Err(TrainingError::config(format!(
            "{name}: num_leaves ({n}) exceeds max_gaussians ({max_gaussians})"
        ))),
        _ => Ok(()),
    }
}

fn resolve_num_leaves(num_leaves: Option<usize>, max_gaussians: usize, default: usize) -> usize {
    num_leaves.unwrap_or_else(|| default.min(max_gaussians))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonophoneParams {
    #[serde(flatten)]
    pub common: CommonStageParams,
    #[serde(default)]
    pub initial_gaussians: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriphoneParams {
    #[serde(flatten)]
    pub common: CommonStageParams,
    #[serde(default)]
    pub num_leaves: Option<usize>,
    /// -1 selects the engine's default clustering threshold.
    #[serde(default)]
    pub cluster_threshold: Option<f64>,
}

impl TriphoneParams {
    pub const DEFAULT_NUM_LEAVES: usize = 1000;

    pub fn num_leaves(&self) -> usize {
        resolve_num_leaves(
            self.num_leaves,
            self.common.max_gaussians,
            Self::DEFAULT_NUM_LEAVES,
        )
    }

    /// `None` means the engine chooses.
    pub fn cluster_threshold(&self) -> Option<f64> {
        self.cluster_threshold.filter(|&t| t != -1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdaParams {
    #[serde(flatten)]
    pub common: CommonStageParams,
    #[serde(default)]
    pub num_leaves: Option<usize>,
    #[serde(default = "default_lda_dimension")]
    pub lda_dimension: usize,
    #[serde(default = "default_splice_context")]
    pub splice_left_context: usize,
    #[serde(default = "default_splice_context")]
    pub splice_right_context: usize,
    #[serde(default)]
    pub mllt_iterations: Option<Vec<u32>>,
}

fn default_lda_dimension() -> usize {
    40
}
fn default_splice_context() -> usize {
    3
}

impl LdaParams {
    pub const DEFAULT_NUM_LEAVES: usize = 2500;

    pub fn num_leaves(&self) -> usize {
        resolve_num_leaves(
            self.num_leaves,
            self.common.max_gaussians,
            Self::DEFAULT_NUM_LEAVES,
        )
    }

    pub fn splice(&self) -> SpliceContext {
        SpliceContext {
            left: self.splice_left_context,
            right: self.splice_right_context,
        }
    }

    pub fn mllt_iterations(&self) -> Vec<u32> {
        self.mllt_iterations
            .clone()
            .unwrap_or_else(|| default_transform_iterations(self.common.num_iterations))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceContext {
    pub left: usize,
    pub right: usize,
}

impl SpliceContext {
    pub fn width(&self) -> usize {
        self.left + self.right + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FmllrUpdateType {
    #[default]
    Full,
    Diag,
    Offset,
    #[serde(rename = "none")]
    NoUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatParams {
    #[serde(flatten)]
    pub common: CommonStageParams,
    #[serde(default)]
    pub num_leaves: Option<usize>,
    /// Consume the transform produced by an earlier LDA stage.
    #[serde(default)]
    pub lda: bool,
    #[serde(default)]
    pub fmllr_update_type: FmllrUpdateType,
    #[serde(default)]
    pub fmllr_iterations: Option<Vec<u32>>,
    #[serde(default)]
    pub silence_weight: f64,
}

impl SatParams {
    pub const DEFAULT_NUM_LEAVES: usize = 2500;

    pub fn num_leaves(&self) -> usize {
        resolve_num_leaves(
            self.num_leaves,
            self.common.max_gaussians,
            Self::DEFAULT_NUM_LEAVES,
        )
    }

    pub fn fmllr_iterations(&self) -> Vec<u32> {
        self.fmllr_iterations
            .clone()
            .unwrap_or_else(|| default_transform_iterations(self.common.num_iterations))
    }
}

/// One entry of the `training` list, tagged by stage kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageConfig {
    Monophone(MonophoneParams),
    Triphone(TriphoneParams),
    Lda(LdaParams),
    Sat(SatParams),
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Monophone(_) => StageKind::Monophone,
            Self::Triphone(_) => StageKind::Triphone,
            Self::Lda(_) => StageKind::Lda,
            Self::Sat(_) => StageKind::Sat,
        }
    }

    pub fn common(&self) -> &CommonStageParams {
        match self {
            Self::Monophone(p) => &p.common,
            Self::Triphone(p) => &p.common,
            Self::Lda(p) => &p.common,
            Self::Sat(p) => &p.common,
        }
    }

    /// Stable identifier used for logging and checkpoint directories.
    pub fn name(&self, index: usize) -> String {
        format!("{index:02}_{}", self.kind())
    }

    pub fn requires_lda_transform(&self) -> bool {
        matches!(self, Self::Sat(p) if p.lda)
    }

    fn validate(&self, name: &str) -> Result<(), TrainingError> {
        let common = self.common();
        common.validate(name)?;
        match self {
            Self::Monophone(p) => {
                if let Some(initial) = p.initial_gaussians {
                    if initial == 0 || initial > common.max_gaussians {
                        return Err(TrainingError::config(format!(
                            "{name}: initial_gaussians must be in 1..={}",
                            common.max_gaussians
                        )));
                    }
                }
            }
            Self::Triphone(p) => {
                check_num_leaves(name, p.num_leaves, common.max_gaussians)?;
                if let Some(threshold) = p.cluster_threshold {
                    if threshold != -1.0 && !(threshold.is_finite() && threshold > 0.0) {
                        return Err(TrainingError::config(format!(
                            "{name}: cluster_threshold must be -1 or positive, got {threshold}"
                        )));
                    }
                }
            }
            Self::Lda(p) => {
                check_num_leaves(name, p.num_leaves, common.max_gaussians)?;
                if p.lda_dimension == 0 {
                    return Err(TrainingError::config(format!(
                        "{name}: lda_dimension must be positive"
                    )));
                }
                if let Some(its) = &p.mllt_iterations {
                    check_iterations(name, "mllt_iterations", its, common.num_iterations)?;
                }
            }
            Self::Sat(p) => {
                check_num_leaves(name, p.num_leaves, common.max_gaussians)?;
                if let Some(its) = &p.fmllr_iterations {
                    check_iterations(name, "fmllr_iterations", its, common.num_iterations)?;
                }
                if !(0.0..=1.0).contains(&p.silence_weight) {
                    return Err(TrainingError::config(format!(
                        "{name}: silence_weight must be in [0, 1], got {}",
                        p.silence_weight
                    )));
                }
            }
        }
        Ok(())
    }
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gmm_trainer_rs::config::FeatureConfig;
use gmm_trainer_rs::pipeline::checkpoint::CheckpointStore;
use gmm_trainer_rs::pipeline::traits::{FlatStartRequest, FmllrRequest, LdaRequest, TreeRequest};
use gmm_trainer_rs::types::{
    Features, LdaTransform, Segment, SufficientStats, TransformChain, UtteranceAlignment,
};
use gmm_trainer_rs::{
    AcousticModelEngine, AlignmentEngine, Corpus, FeatureExtractor, Model, StageKind,
    TrainingConfiguration, TrainingError, TrainingOutcome, TrainingPipelineBuilder, Utterance,
};
use libtest_mimic::{Arguments, Failed, Trial};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

const SUITE_NAME: &str = "pipeline_scenarios";
const FEATURE_DIM: usize = 13;
const HARD_BEAM: f64 = 40.0;

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    description: String,
    corpus: CorpusShape,
    #[serde(default)]
    engine: EngineBehavior,
    config: TrainingConfiguration,
    #[serde(default)]
    expect: Expectations,
}

#[derive(Debug, Deserialize)]
struct CorpusShape {
    speakers: usize,
    utterances_per_speaker: usize,
    #[serde(default = "default_corpus_seed")]
    seed: u64,
}

fn default_corpus_seed() -> u64 {
    7
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EngineBehavior {
    unalignable_all: bool,
    unalignable: Vec<String>,
    /// Every n-th utterance in corpus order only aligns at the retry beam.
    hard_every: usize,
    failing_kind: Option<StageKind>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Expectations {
    stages: Vec<ExpectedStage>,
    error: Option<ExpectedError>,
    /// `[built kind, seed model kind]` for every tree built, in order.
    seeds: Option<Vec<(StageKind, StageKind)>>,
    checkpoints: Option<usize>,
    partial_model: Option<String>,
    resume_idempotent: bool,
}

#[derive(Debug, Deserialize)]
struct ExpectedStage {
    kind: StageKind,
    subset_size: Option<usize>,
    full_corpus: Option<bool>,
    gaussians: Option<Vec<usize>>,
    final_gaussians: Option<usize>,
    min_retried: Option<usize>,
    final_unaligned: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ExpectedError {
    Config,
    Stage {
        stage_index: usize,
        #[serde(default)]
        iteration: Option<u32>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    reestimates: AtomicUsize,
    seeds: Mutex<Vec<(StageKind, StageKind)>>,
}

/// Deterministic stand-in for the numeric engines.
#[derive(Clone)]
struct ScenarioEngine {
    unalignable_all: bool,
    unalignable: Arc<HashSet<String>>,
    hard: Arc<HashSet<String>>,
    failing_kind: Option<StageKind>,
    counters: Arc<Counters>,
}

impl ScenarioEngine {
    fn new(behavior: &EngineBehavior, corpus: &Corpus) -> Self {
        let hard = if behavior.hard_every > 0 {
            corpus
                .utterances()
                .iter()
                .enumerate()
                .filter(|(pos, _)| pos % behavior.hard_every == 0)
                .map(|(_, utt)| utt.id.clone())
                .collect()
        } else {
            HashSet::new()
        };
        Self {
            unalignable_all: behavior.unalignable_all,
            unalignable: Arc::new(behavior.unalignable.iter().cloned().collect()),
            hard: Arc::new(hard),
            failing_kind: behavior.failing_kind,
            counters: Arc::new(Counters::default()),
        }
    }

    fn check_kind(&self, kind: StageKind) -> Result<(), TrainingError> {
        if self.failing_kind == Some(kind) {
            return Err(TrainingError::engine("seed model", format!("{kind} seeding failed")));
        }
        Ok(())
    }

    fn seeds(&self) -> Vec<(StageKind, StageKind)> {
        self.counters
            .seeds
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl FeatureExtractor for ScenarioEngine {
    fn extract(
        &self,
        utterance: &Utterance,
        _config: &FeatureConfig,
    ) -> Result<Features, TrainingError> {
        let num_frames = utterance.duration_ms.map_or(100, |ms| (ms / 100).max(1)) as usize;
        let offset = utterance.id.len() % 7;
        Ok(Features {
            frames: (0..num_frames)
                .map(|t| {
                    (0..FEATURE_DIM)
                        .map(|d| ((t + d + offset) % 11) as f32 * 0.25)
                        .collect()
                })
                .collect(),
        })
    }
}

impl AlignmentEngine for ScenarioEngine {
    fn align(
        &self,
        model: &Model,
        _transforms: &TransformChain,
        utterance: &Utterance,
        features: &Features,
        beam: f64,
    ) -> Result<Option<UtteranceAlignment>, TrainingError> {
        if self.unalignable_all
            || self.unalignable.contains(&utterance.id)
            || (self.hard.contains(&utterance.id) && beam < HARD_BEAM)
        {
            return Ok(None);
        }
        let num_frames = features.num_frames();
        Ok(Some(UtteranceAlignment {
            utterance_id: utterance.id.clone(),
            beam,
            log_likelihood: -(num_frames as f64) * (2.0 - model.generation as f64 * 0.01),
            num_frames,
            phones: vec![Segment {
                label: "sil".to_string(),
                start_ms: 0,
                end_ms: num_frames as u64 * 10,
            }],
            words: Vec::new(),
        }))
    }
}

impl AcousticModelEngine for ScenarioEngine {
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
            parameters: vec![0.0; 2],
        })
    }

    fn build_tree(&self, request: &TreeRequest<'_>) -> Result<Model, TrainingError> {
        self.check_kind(request.kind)?;
        if let Ok(mut seeds) = self.counters.seeds.lock() {
            seeds.push((request.kind, request.seed.kind));
        }
        Ok(Model {
            kind: request.kind,
            generation: 0,
            num_gaussians: request.num_leaves,
            num_leaves: request.num_leaves,
            feature_dim: request
                .transforms
                .lda
                .as_ref()
                .map_or(request.seed.feature_dim, |lda| lda.dimension),
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
            matrix: vec![0.1; request.dimension],
            mllt_updates: 0,
        })
    }

    fn estimate_fmllr(&self, request: &FmllrRequest<'_>) -> Result<Vec<f64>, TrainingError> {
        Ok(vec![1.0, request.utterance_ids.len() as f64])
    }

    fn accumulate(
        &self,
        _model: &Model,
        _transforms: &TransformChain,
        _utterance: &Utterance,
        _features: &Features,
        alignment: &UtteranceAlignment,
    ) -> Result<SufficientStats, TrainingError> {
        Ok(SufficientStats {
            utterances: 1,
            num_frames: alignment.num_frames as u64,
            log_likelihood: alignment.log_likelihood,
            accumulators: vec![alignment.num_frames as f64, alignment.log_likelihood],
        })
    }

    fn reestimate(
        &self,
        model: &Model,
        stats: &SufficientStats,
        target_gaussians: usize,
    ) -> Result<Model, TrainingError> {
        self.counters.reestimates.fetch_add(1, Ordering::SeqCst);
        Ok(Model {
            generation: model.generation + 1,
            num_gaussians: target_gaussians,
            log_likelihood: stats.log_likelihood_per_frame(),
            parameters: stats.accumulators.clone(),
            ..model.clone()
        })
    }
}

fn main() {
    let args = Arguments::from_args();
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let scenario_dir = repo_root.join("test-data").join("scenarios");

    let paths = match scenario_paths(&scenario_dir) {
        Ok(paths) if !paths.is_empty() => paths,
        Ok(_) => {
            run_setup_failure(
                &args,
                format!("No scenarios found under {}.", scenario_dir.display()),
            );
            return;
        }
        Err(err) => {
            run_setup_failure(&args, err);
            return;
        }
    };

    let tests = paths
        .into_iter()
        .map(|path| {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            Trial::test(format!("{SUITE_NAME}::{stem}"), move || {
                run_scenario(&path).map_err(Failed::from)
            })
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}

fn run_setup_failure(args: &Arguments, message: String) {
    let test = Trial::test(format!("{SUITE_NAME}::setup"), move || {
        Err(Failed::from(message))
    });
    libtest_mimic::run(args, vec![test]).exit();
}

fn scenario_paths(dir: &Path) -> Result<Vec<PathBuf>, String> {
    let entries = fs::read_dir(dir)
        .map_err(|err| format!("Failed to read scenario dir '{}': {err}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    paths.sort();
    Ok(paths)
}

fn load_scenario(path: &Path) -> Result<Scenario, String> {
    let data = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read scenario '{}': {err}", path.display()))?;
    serde_yaml::from_str(&data)
        .map_err(|err| format!("Failed to parse scenario '{}': {err}", path.display()))
}

fn synthetic_corpus(shape: &CorpusShape) -> Result<Corpus, String> {
    let mut rng = StdRng::seed_from_u64(shape.seed);
    let mut utterances = Vec::with_capacity(shape.speakers * shape.utterances_per_speaker);
    for s in 0..shape.speakers {
        for u in 0..shape.utterances_per_speaker {
            utterances.push(Utterance {
                id: format!("s{s:03}_u{u:04}"),
                speaker: Some(format!("s{s:03}")),
                transcript: "one two three".to_string(),
                audio_path: None,
                features_path: None,
                duration_ms: Some(rng.gen_range(800..6000)),
            });
        }
    }
    Corpus::new(utterances).map_err(|err| err.to_string())
}

fn run_scenario(path: &Path) -> Result<(), String> {
    let scenario = load_scenario(path)?;
    let corpus = synthetic_corpus(&scenario.corpus)?;
    let checkpoint_dir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let engine = ScenarioEngine::new(&scenario.engine, &corpus);
    let label = if scenario.description.is_empty() {
        path.display().to_string()
    } else {
        scenario.description.clone()
    };

    let outcome = match run_pipeline(&scenario, &corpus, &engine, checkpoint_dir.path()) {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            check_error(&scenario.expect, &err).map_err(|message| format!("{label}: {message}"))?;
            None
        }
    };

    if let Some(seeds) = &scenario.expect.seeds {
        let observed = engine.seeds();
        if &observed != seeds {
            return Err(format!("{label}: seeds {observed:?}, expected {seeds:?}"));
        }
    }
    if let Some(expected) = scenario.expect.checkpoints {
        let manifest = CheckpointStore::open(checkpoint_dir.path())
            .and_then(|store| store.load_manifest())
            .map_err(|err| err.to_string())?;
        if manifest.stages.len() != expected {
            return Err(format!(
                "{label}: {} checkpoint(s), expected {expected}",
                manifest.stages.len()
            ));
        }
    }
    if let Some(stage_name) = &scenario.expect.partial_model {
        let path = checkpoint_dir.path().join(stage_name).join("partial_model.json");
        if !path.is_file() {
            return Err(format!("{label}: missing partial model {}", path.display()));
        }
    }

    let Some(outcome) = outcome else {
        return Ok(());
    };
    check_stages(&scenario.expect, &outcome).map_err(|message| format!("{label}: {message}"))?;

    if scenario.expect.resume_idempotent {
        check_resume(&scenario, &corpus, checkpoint_dir.path(), &outcome)
            .map_err(|message| format!("{label}: {message}"))?;
    }
    Ok(())
}

fn run_pipeline(
    scenario: &Scenario,
    corpus: &Corpus,
    engine: &ScenarioEngine,
    checkpoint_dir: &Path,
) -> Result<TrainingOutcome, TrainingError> {
    TrainingPipelineBuilder::new(scenario.config.clone())
        .with_feature_extractor(Box::new(engine.clone()))
        .with_model_engine(Box::new(engine.clone()))
        .with_alignment_engine(Box::new(engine.clone()))
        .with_checkpoint_dir(checkpoint_dir)
        .build()?
        .run(corpus)
}

fn check_error(expect: &Expectations, err: &TrainingError) -> Result<(), String> {
    match (&expect.error, err) {
        (None, _) => Err(format!("unexpected failure: {err}")),
        (Some(ExpectedError::Config), err) if err.is_config_error() => Ok(()),
        (Some(ExpectedError::Config), _) => {
            Err(format!("expected a configuration error, got: {err}"))
        }
        (
            Some(ExpectedError::Stage {
                stage_index,
                iteration,
            }),
            TrainingError::Stage(failure),
        ) => {
            if failure.stage_index != *stage_index {
                return Err(format!("expected failure of stage {stage_index}, got: {failure}"));
            }
            match iteration {
                Some(it) if failure.iteration != Some(*it) => {
                    Err(format!("expected failure at iteration {it}, got: {failure}"))
                }
                _ => Ok(()),
            }
        }
        (Some(ExpectedError::Stage { .. }), _) => {
            Err(format!("expected a stage failure, got: {err}"))
        }
    }
}

fn check_stages(expect: &Expectations, outcome: &TrainingOutcome) -> Result<(), String> {
    if let Some(err) = &expect.error {
        return Err(format!("expected failure {err:?}, but training succeeded"));
    }
    let stages = &outcome.report.stages;
    if !expect.stages.is_empty() && stages.len() != expect.stages.len() {
        return Err(format!(
            "{} stage(s) trained, expected {}",
            stages.len(),
            expect.stages.len()
        ));
    }
    for (report, expected) in stages.iter().zip(&expect.stages) {
        let name = &report.name;
        if report.kind != expected.kind {
            return Err(format!("{name}: kind {}, expected {}", report.kind, expected.kind));
        }
        if let Some(size) = expected.subset_size {
            if report.subset_size != size {
                return Err(format!("{name}: subset of {}, expected {size}", report.subset_size));
            }
        }
        if let Some(full) = expected.full_corpus {
            if report.full_corpus != full {
                return Err(format!("{name}: full_corpus {}, expected {full}", report.full_corpus));
            }
        }
        if let Some(gaussians) = &expected.gaussians {
            let observed: Vec<usize> =
                report.iterations.iter().map(|it| it.num_gaussians).collect();
            if &observed != gaussians {
                return Err(format!("{name}: gaussians {observed:?}, expected {gaussians:?}"));
            }
        }
        if let Some(count) = expected.final_gaussians {
            if report.final_num_gaussians != count {
                return Err(format!(
                    "{name}: {} final gaussians, expected {count}",
                    report.final_num_gaussians
                ));
            }
        }
        if let Some(min) = expected.min_retried {
            let retried: usize = report.iterations.iter().map(|it| it.alignment.retried).sum();
            if retried < min {
                return Err(format!(
                    "{name}: {retried} retried alignment(s), expected at least {min}"
                ));
            }
        }
        if let Some(unaligned) = expected.final_unaligned {
            if report.final_alignment.unaligned != unaligned {
                return Err(format!(
                    "{name}: {} unaligned, expected {unaligned}",
                    report.final_alignment.unaligned
                ));
            }
        }
    }
    Ok(())
}

/// Reruns against the checkpoints of the first run. Nothing is re-estimated
/// and the final model matches.
fn check_resume(
    scenario: &Scenario,
    corpus: &Corpus,
    checkpoint_dir: &Path,
    first: &TrainingOutcome,
) -> Result<(), String> {
    let engine = ScenarioEngine::new(&scenario.engine, corpus);
    let second = run_pipeline(scenario, corpus, &engine, checkpoint_dir)
        .map_err(|err| format!("resumed run failed: {err}"))?;

    let reestimates = engine.counters.reestimates.load(Ordering::SeqCst);
    if reestimates != 0 {
        return Err(format!("resumed run re-estimated {reestimates} time(s)"));
    }
    if second.report.trained_stage_count() != 0 {
        return Err("resumed run trained stages again".to_string());
    }
    if !second.model.approx_eq(&first.model, 1e-9) {
        return Err("resumed model differs from the original run".to_string());
    }
    Ok(())
}

//! One training stage as a state machine:
//! `Seeding -> Iterating -> Converged | Failed`.
//!
//! Kind-specific behaviour (how the stage seeds its model, which transforms it
//! refines mid-stage) lives in one [`StageStrategy`] per stage kind. The
//! align / accumulate / re-estimate / grow loop is shared.

mod lda;
mod monophone;
mod sat;
mod triphone;

use std::sync::Arc;
use std::time::Instant;

use crate::config::StageConfig;
use crate::error::{StageFailure, TrainingError};
use crate::pipeline::traits::AcousticModelEngine;
use crate::report::{AlignmentSummary, IterationReport, StageReport};
use crate::training::alignment_runner::AlignmentRunner;
use crate::training::gaussian_schedule::GaussianSchedule;
use crate::training::worker_pool::{run_ordered, CancellationToken};
use crate::training::StageData;
use crate::types::{AlignmentSet, Model, SufficientStats, TransformChain, UnalignedReason};

use lda::LdaStage;
use monophone::MonophoneStage;
use sat::SatStage;
use triphone::TriphoneStage;

/// What the previous stage hands over.
#[derive(Debug, Clone, Default)]
pub struct StageInput {
    pub model: Option<Arc<Model>>,
    pub alignments: Option<Arc<AlignmentSet>>,
    pub transforms: TransformChain,
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub model: Arc<Model>,
    /// Alignments of the stage subset against the final model.
    pub alignments: AlignmentSet,
    pub transforms: TransformChain,
    pub report: StageReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Seeding,
    Iterating { iteration: u32 },
    Converged,
    Failed,
}

/// Error from [`TrainingStage::run`], carrying the latest intermediate model
/// for inspection. That model is never promoted to a checkpoint.
#[derive(Debug)]
pub struct StageAbort {
    pub error: TrainingError,
    pub partial_model: Option<Arc<Model>>,
}

/// Everything a stage needs from the pipeline for one run.
pub struct StageContext<'a> {
    pub index: usize,
    pub name: &'a str,
    pub config: &'a StageConfig,
    pub data: StageData<'a>,
    pub engine: &'a dyn AcousticModelEngine,
    pub runner: &'a AlignmentRunner<'a>,
    pub workers: usize,
    pub cancel: &'a CancellationToken,
}

impl StageContext<'_> {
    fn failure(
        &self,
        iteration: Option<u32>,
        unaligned_count: usize,
        reason: impl Into<String>,
    ) -> TrainingError {
        StageFailure {
            stage_index: self.index,
            stage_name: self.name.to_string(),
            iteration,
            unaligned_count,
            reason: reason.into(),
        }
        .into()
    }

    fn cancelled(&self, iteration: Option<u32>) -> TrainingError {
        TrainingError::Cancelled {
            stage: self.name.to_string(),
            iteration,
        }
    }

    /// Model of the preceding stage, required by every kind except monophone.
    fn seed_model<'i>(&self, input: &'i StageInput) -> Result<&'i Arc<Model>, TrainingError> {
        input.model.as_ref().ok_or_else(|| {
            self.failure(
                None,
                0,
                format!("{} stage requires the model of a preceding stage", self.config.kind()),
            )
        })
    }

    /// Aligns the stage subset with the incoming model before reseeding.
    fn seed_alignment(
        &self,
        model: &Model,
        transforms: &TransformChain,
    ) -> Result<AlignmentSet, TrainingError> {
        self.runner.align(model, transforms, self.data, 0)
    }
}

pub(crate) struct Seeded {
    pub model: Model,
    pub transforms: TransformChain,
    /// Alignment made with the incoming model while seeding, if any.
    pub alignment: Option<AlignmentSet>,
}

/// Mid-stage transform update. `model` replaces the current model when the
/// update changes the feature space.
pub(crate) struct Refinement {
    pub model: Option<Model>,
    pub transforms: TransformChain,
}

pub(crate) trait StageStrategy: Send + Sync {
    fn seed(&self, ctx: &StageContext<'_>, input: &StageInput) -> Result<Seeded, TrainingError>;

    fn refine(
        &self,
        _ctx: &StageContext<'_>,
        _iteration: u32,
        _model: &Model,
        _alignments: &AlignmentSet,
        _transforms: &TransformChain,
    ) -> Result<Option<Refinement>, TrainingError> {
        Ok(None)
    }

    fn finalize(
        &self,
        _ctx: &StageContext<'_>,
        _model: &Model,
        _alignments: &AlignmentSet,
        transforms: TransformChain,
    ) -> Result<TransformChain, TrainingError> {
        Ok(transforms)
    }
}

fn strategy_for(config: &StageConfig) -> Box<dyn StageStrategy> {
    match config {
        StageConfig::Monophone(p) => Box::new(MonophoneStage::new(p.clone())),
        StageConfig::Triphone(p) => Box::new(TriphoneStage::new(p.clone())),
        StageConfig::Lda(p) => Box::new(LdaStage::new(p.clone())),
        StageConfig::Sat(p) => Box::new(SatStage::new(p.clone())),
    }
}

fn summarize(set: &AlignmentSet) -> AlignmentSummary {
    AlignmentSummary {
        aligned: set.aligned_count(),
        retried: set.retried,
        unaligned: set.unaligned.len(),
    }
}

pub struct TrainingStage<'a> {
    ctx: StageContext<'a>,
    strategy: Box<dyn StageStrategy>,
    schedule: GaussianSchedule,
    state: StageState,
}

impl<'a> TrainingStage<'a> {
    pub fn new(ctx: StageContext<'a>) -> Self {
        let common = ctx.config.common();
        let schedule =
            GaussianSchedule::new(common.num_iterations, common.max_gaussians, common.power());
        Self {
            strategy: strategy_for(ctx.config),
            ctx,
            schedule,
            state: StageState::Seeding,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn run(mut self, input: &StageInput) -> Result<StageOutput, StageAbort> {
        let started = Instant::now();
        let common = self.ctx.config.common();
        let subset = self.ctx.data.subset;
        tracing::info!(
            stage = self.ctx.name,
            subset = subset.len(),
            full_corpus = subset.is_full_corpus,
            num_iterations = common.num_iterations,
            max_gaussians = common.max_gaussians,
            "stage started"
        );

        let seeded = match self.strategy.seed(&self.ctx, input) {
            Ok(seeded) => seeded,
            Err(err) => return Err(self.abort(err, None, None)),
        };
        tracing::info!(
            stage = self.ctx.name,
            num_gaussians = seeded.model.num_gaussians,
            num_leaves = seeded.model.num_leaves,
            "stage seeded"
        );

        let mut report = StageReport {
            index: self.ctx.index,
            name: self.ctx.name.to_string(),
            kind: self.ctx.config.kind(),
            subset_size: subset.len(),
            full_corpus: subset.is_full_corpus,
            resumed: false,
            seed_alignment: seeded.alignment.as_ref().map(summarize),
            iterations: Vec::with_capacity(common.num_iterations as usize),
            final_num_gaussians: 0,
            final_alignment: AlignmentSummary::default(),
            elapsed_ms: 0,
        };
        let mut model = Arc::new(seeded.model);
        let mut transforms = seeded.transforms;
        let mut alignments: Option<AlignmentSet> = None;

        for iteration in 1..=common.num_iterations {
            self.state = StageState::Iterating { iteration };
            if self.ctx.cancel.is_cancelled() {
                let err = self.ctx.cancelled(Some(iteration));
                return Err(self.abort(err, Some(iteration), Some(model)));
            }
            match self.iterate(iteration, &model, &mut transforms, alignments.take()) {
                Ok((next, set, iteration_report)) => {
                    // Publish: workers of the next round only ever see `next`.
                    model = next;
                    alignments = Some(set);
                    report.iterations.push(iteration_report);
                }
                Err(err) => return Err(self.abort(err, Some(iteration), Some(model))),
            }
        }

        let last = alignments.unwrap_or_default();
        let last_iteration = Some(common.num_iterations);
        let transforms = match self.strategy.finalize(&self.ctx, &model, &last, transforms) {
            Ok(t) => t,
            Err(err) => return Err(self.abort(err, last_iteration, Some(model))),
        };
        let final_set = match self.ctx.runner.align(
            &model,
            &transforms,
            self.ctx.data,
            common.num_iterations,
        ) {
            Ok(set) => set,
            Err(err) => return Err(self.abort(err, last_iteration, Some(model))),
        };

        self.state = StageState::Converged;
        report.final_num_gaussians = model.num_gaussians;
        report.final_alignment = summarize(&final_set);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            stage = self.ctx.name,
            num_gaussians = model.num_gaussians,
            aligned = final_set.aligned_count(),
            unaligned = final_set.unaligned.len(),
            elapsed_ms = report.elapsed_ms,
            "stage converged"
        );

        Ok(StageOutput {
            model,
            alignments: final_set,
            transforms,
            report,
        })
    }

    /// One round against the published `model`. Returns the next model, the
    /// alignments used for its statistics and the round report.
    fn iterate(
        &self,
        iteration: u32,
        model: &Arc<Model>,
        transforms: &mut TransformChain,
        previous: Option<AlignmentSet>,
    ) -> Result<(Arc<Model>, AlignmentSet, IterationReport), TrainingError> {
        let common = self.ctx.config.common();
        let (mut alignments, realigned) = match previous {
            Some(prev) if !common.realigns_on(iteration) => (prev, false),
            _ => (
                self.ctx
                    .runner
                    .align(model, transforms, self.ctx.data, iteration)?,
                true,
            ),
        };

        let mut current = Arc::clone(model);
        let mut transforms_refined = false;
        if let Some(refinement) =
            self.strategy
                .refine(&self.ctx, iteration, &current, &alignments, transforms)?
        {
            if let Some(refined_model) = refinement.model {
                current = Arc::new(refined_model);
            }
            *transforms = refinement.transforms;
            transforms_refined = true;
        }

        let stats = self.accumulate(&current, transforms, &mut alignments, iteration)?;
        if stats.utterances == 0 {
            return Err(self.ctx.failure(
                Some(iteration),
                alignments.unaligned.len(),
                "no utterance produced statistics",
            ));
        }
        if !stats.log_likelihood.is_finite() {
            return Err(self.ctx.failure(
                Some(iteration),
                alignments.unaligned.len(),
                "numeric divergence in accumulated statistics",
            ));
        }

        let target = self.schedule.target(iteration, current.num_gaussians);
        let mut next = self.ctx.engine.reestimate(&current, &stats, target)?;
        if next.log_likelihood.is_some_and(|ll| !ll.is_finite()) {
            return Err(self.ctx.failure(
                Some(iteration),
                alignments.unaligned.len(),
                "numeric divergence in re-estimated model",
            ));
        }
        if let Some(boost) = common.boost_silence() {
            next = self.ctx.engine.boost_silence(&next, boost)?;
        }

        let log_likelihood_per_frame = stats.log_likelihood_per_frame();
        tracing::info!(
            stage = self.ctx.name,
            iteration,
            realigned,
            aligned = alignments.aligned_count(),
            unaligned = alignments.unaligned.len(),
            target_gaussians = target,
            num_gaussians = next.num_gaussians,
            log_likelihood = log_likelihood_per_frame.unwrap_or(f64::NAN),
            "iteration complete"
        );

        let iteration_report = IterationReport {
            iteration,
            realigned,
            alignment: summarize(&alignments),
            transforms_refined,
            target_gaussians: target,
            num_gaussians: next.num_gaussians,
            log_likelihood_per_frame,
        };
        Ok((Arc::new(next), alignments, iteration_report))
    }

    /// Sums per-utterance statistics in alignment-key order so the result is
    /// independent of worker scheduling. Utterances whose accumulation fails
    /// are moved to the unaligned list.
    fn accumulate(
        &self,
        model: &Model,
        transforms: &TransformChain,
        alignments: &mut AlignmentSet,
        iteration: u32,
    ) -> Result<SufficientStats, TrainingError> {
        let data = self.ctx.data;
        let jobs: Vec<_> = alignments
            .alignments
            .iter()
            .filter_map(|(id, alignment)| {
                Some((data.corpus.get(id)?, data.features.get(id)?, alignment))
            })
            .collect();

        let results = run_ordered(&jobs, self.ctx.workers, self.ctx.cancel, |(utt, feats, ali)| {
            self.ctx
                .engine
                .accumulate(model, transforms, utt, feats, ali)
        })
        .ok_or_else(|| self.ctx.cancelled(Some(iteration)))?;

        let mut total = SufficientStats::default();
        let mut accumulated = 0;
        let mut failed = Vec::new();
        for ((utt, _, _), result) in jobs.iter().zip(results) {
            match result {
                Ok(stats) => {
                    total.merge(&stats);
                    accumulated += 1;
                }
                Err(err) => failed.push((utt.id.clone(), err.to_string())),
            }
        }
        total.utterances = accumulated;

        for (id, message) in failed {
            tracing::warn!(
                stage = self.ctx.name,
                utterance = %id,
                error = %message,
                "accumulation failed"
            );
            alignments.exclude(&id, UnalignedReason::Accumulation(message));
        }
        Ok(total)
    }

    fn abort(
        &mut self,
        error: TrainingError,
        iteration: Option<u32>,
        partial_model: Option<Arc<Model>>,
    ) -> StageAbort {
        self.state = StageState::Failed;
        let error = match error {
            TrainingError::Alignment(failure) => self.ctx.failure(
                iteration,
                failure.unaligned.len(),
                format!(
                    "every utterance failed alignment at retry beam {}",
                    failure.retry_beam
                ),
            ),
            TrainingError::Engine { .. } => self.ctx.failure(iteration, 0, error.to_string()),
            TrainingError::Stage(mut failure) => {
                failure.iteration = failure.iteration.or(iteration);
                failure.into()
            }
            other => other,
        };
        tracing::error!(stage = self.ctx.name, error = %error, "stage failed");
        StageAbort {
            error,
            partial_model,
        }
    }
}

use std::fmt::Write;

use gmm_trainer_rs::pipeline::checkpoint::CheckpointManifest;
use gmm_trainer_rs::TrainingPlan;

pub fn render_json(plan: &TrainingPlan) -> Result<String, String> {
    serde_json::to_string_pretty(plan)
        .map_err(|err| format!("Failed to serialize plan JSON: {err}"))
}

pub fn render_text(plan: &TrainingPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "corpus: {} utterance(s), {} worker(s)",
        plan.corpus_size, plan.workers
    );
    for stage in &plan.stages {
        let subset = if stage.full_corpus {
            "full corpus".to_string()
        } else {
            format!("{} utterance(s)", stage.subset_size)
        };
        let _ = writeln!(
            out,
            "{}: {subset} from {} speaker(s), {} iteration(s), max {} gaussians",
            stage.name, stage.speakers, stage.num_iterations, stage.max_gaussians
        );
        if let Some(leaves) = stage.num_leaves {
            let _ = writeln!(out, "  leaves: {leaves}");
        }
        let _ = writeln!(out, "  gaussians: {}", join(&stage.gaussian_targets));
        let _ = writeln!(out, "  realign on: {}", join(&stage.realignment_iterations));
        if !stage.transform_iterations.is_empty() {
            let _ = writeln!(
                out,
                "  transform updates on: {}",
                join(&stage.transform_iterations)
            );
        }
    }
    out.trim_end().to_string()
}

pub fn render_manifest(manifest: &CheckpointManifest) -> String {
    if manifest.stages.is_empty() {
        return "no completed stages".to_string();
    }
    let mut out = String::new();
    for entry in &manifest.stages {
        let _ = writeln!(
            out,
            "{}  {}  gaussians={}  aligned={}  unaligned={}",
            entry.name, entry.completed_at, entry.num_gaussians, entry.aligned, entry.unaligned
        );
    }
    out.trim_end().to_string()
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("config parse error while {context}: {source}")]
    ConfigParse {
        context: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid training configuration: {message}")]
    Config { message: String },
    #[error("{context}: {message}")]
    Engine {
        context: &'static str,
        message: String,
    },
    #[error(transparent)]
    Alignment(#[from] AlignmentFailure),
    #[error(transparent)]
    Stage(#[from] StageFailure),
    #[error("training cancelled during stage {stage}{}", fmt_iteration(.iteration))]
    Cancelled {
        stage: String,
        iteration: Option<u32>,
    },
}

impl TrainingError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn yaml(context: &'static str, source: serde_yaml::Error) -> Self {
        Self::ConfigParse { context, source }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wraps a collaborator failure. Engines implemented outside this crate
    /// use this to report their own errors.
    pub fn engine(context: &'static str, err: impl fmt::Display) -> Self {
        Self::Engine {
            context,
            message: err.to_string(),
        }
    }

    /// True for both unparsable and semantically invalid configurations.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::ConfigParse { .. })
    }
}

/// Every utterance of an alignment batch failed, even at the retry beam.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} utterance(s) could not be aligned at retry beam {retry_beam}", .unaligned.len())]
pub struct AlignmentFailure {
    pub retry_beam: f64,
    pub unaligned: Vec<String>,
}

/// A stage could not produce a usable model. Earlier checkpoints stay valid.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "stage {stage_index} ({stage_name}) failed{}: {reason} ({unaligned_count} unaligned utterance(s))",
    fmt_iteration(.iteration)
)]
pub struct StageFailure {
    pub stage_index: usize,
    pub stage_name: String,
    pub iteration: Option<u32>,
    pub unaligned_count: usize,
    pub reason: String,
}

fn fmt_iteration(iteration: &Option<u32>) -> String {
    match iteration {
        Some(it) => format!(" at iteration {it}"),
        None => String::new(),
    }
}

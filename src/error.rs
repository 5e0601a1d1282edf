use std::fmt;

use thiserror::Error;

/// Pipeline stages, used to tag fatal errors and degraded-path log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decomposition,
    Search,
    ReferenceExpansion,
    Answer,
    NeedsRetry,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decomposition => "decomposition",
            Stage::Search => "search",
            Stage::ReferenceExpansion => "reference-expansion",
            Stage::Answer => "answer",
            Stage::NeedsRetry => "needs-retry",
        };
        f.write_str(name)
    }
}

/// Fatal pipeline failure.
///
/// Partial failures (one collection, one reference fetch, one judge call)
/// degrade to empty contributions and never surface here; only total failure
/// of a required stage does.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {message}")]
pub struct PipelineError {
    pub stage: Stage,
    pub message: String,
}

impl PipelineError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

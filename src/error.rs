//! Hard scheduling errors.
//!
//! Recoverable pipelining outcomes are not errors; they are reported as a
//! `SkipReason` on the loop report together with a warning diagnostic.

use std::path::PathBuf;

use thiserror::Error;

use crate::diagnostic::Diagnostic;

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The modulo scheduler exhausted its II search.
    #[error("scheduling failed for loop '{loop_name}': no feasible schedule with II <= {max_ii}")]
    SchedulingFailure { loop_name: String, max_ii: u32 },

    /// Dangling references, cycles among ordinary data edges, or ops that
    /// cannot appear where they do.
    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    /// A replayed schedule artifact no longer matches the current graph.
    #[error("malformed schedule file '{}': {reason}", path.display())]
    MalformedScheduleFile { path: PathBuf, reason: String },

    /// A loop whose trip count cannot be determined: no tiling constraint
    /// for its axis and no explicit count.
    #[error("loop '{loop_name}' over axis '{axis}' has no trip count")]
    UnknownLoop { loop_name: String, axis: String },

    #[error("invalid hardware configuration: {0}")]
    Config(String),

    #[error("cannot access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ScheduleError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScheduleError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ScheduleError::MalformedScheduleFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(self.to_string());
        match self {
            ScheduleError::SchedulingFailure { loop_name, .. } => diag
                .with_subject(loop_name.clone())
                .with_help(
                    "raise --max-ii or use the prefetch scheduler"
                        .to_string(),
                ),
            ScheduleError::UnknownLoop { loop_name, axis } => diag
                .with_subject(loop_name.clone())
                .with_help(format!("add a tiling constraint for '{}'", axis)),
            ScheduleError::MalformedScheduleFile { .. } => diag.with_help(
                "the loop body changed since the schedule was dumped; dump it again".to_string(),
            ),
            _ => diag,
        }
    }
}

use crate::engine::EngineError;
use crate::executor::SessionStats;
use crate::governor::GovernorError;
use crate::oracle::BugReport;
use thiserror::Error;

/// Problems with the session setup, reported before any iteration runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("run budget {requested} exceeds the maximum of {max}")]
    RunBudget { requested: u64, max: u64 },
    #[error("query {query:?} could not be prepared: {source}")]
    MalformedQuery {
        query: String,
        #[source]
        source: EngineError,
    },
    #[error("query {query:?} must take exactly one text parameter, found {found}")]
    ParameterArity { query: String, found: usize },
}

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to apply resource limits: {0}")]
    Governor(#[from] GovernorError),
    #[error("engine error outside of an iteration: {0}")]
    Engine(#[from] EngineError),
    /// The session stopped because an iteration escalated.
    #[error("session escalated after {} executions: {report}", stats.n_execs)]
    Escalated {
        report: Box<BugReport>,
        stats: Box<SessionStats>,
    },
    #[error("fatal error requested: {0}")]
    Forced(Box<BugReport>),
}

impl FuzzError {
    /// Whether the invoking layer should treat this error as a crash signal.
    pub fn is_crash_signal(&self) -> bool {
        matches!(self, FuzzError::Escalated { .. } | FuzzError::Forced(_))
    }
}

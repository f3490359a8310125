pub mod classifier;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod governor;
pub mod histogram;
pub mod input;
pub mod logging;
pub mod oracle;
pub mod reporter;
pub mod sqlite;
pub mod statement;
pub mod sweep;

#[cfg(test)]
mod testing;

pub use classifier::{Category, REPEAT_LIMIT, RegexSubcode, RepeatTracker, classify};
pub use config::QueryFuzzConfig;
pub use driver::{FuzzDriver, InFuzzerGuard, force_fatal, in_fuzzer};
pub use engine::{CancelToken, Engine, EngineError, SqlState};
pub use error::{ConfigError, FuzzError};
pub use executor::{
    FuzzSession, IterationExecutor, IterationOutcome, MAX_RUN_BUDGET, SessionStats,
};
pub use governor::{Limiter, ResourceLimits, RlimitLimiter, apply_limits};
pub use histogram::{ErrcodeHistogram, HistogramError};
pub use input::{InputSource, RandomBytesSource, SeedReplaySource, VecSource};
pub use oracle::{BugReport, EscalationPolicy, EscalationReason, Oracle, PolicyOracle};
pub use reporter::{MemoryProbe, ProcStatmProbe, ProgressReporter};
pub use sqlite::SqliteEngine;
pub use statement::PreparedStatement;
pub use sweep::{FunctionSignature, FunctionSweep, SweepOutcome, SweepResult, SweepTarget, build_targets};

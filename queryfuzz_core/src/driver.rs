//! Entry points used by the embedding fuzzer program.
//!
//! A [`FuzzDriver`] checks the session setup, applies resource limits, then
//! feeds inputs from an [`InputSource`] through an [`IterationExecutor`] until
//! the run budget is spent, the source runs dry, or an iteration escalates.

use crate::engine::Engine;
use crate::error::{ConfigError, FuzzError};
use crate::executor::{
    FuzzSession, IterationExecutor, IterationOutcome, MAX_RUN_BUDGET, SessionStats,
};
use crate::governor::{Limiter, ResourceLimits, apply_limits};
use crate::input::InputSource;
use crate::oracle::{BugReport, EscalationPolicy, EscalationReason, PolicyOracle};
use crate::reporter::{MemoryProbe, ProgressReporter};
use crate::statement::PreparedStatement;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{error, info};

static IN_FUZZER: AtomicUsize = AtomicUsize::new(0);

/// Whether a fuzzing session is running anywhere in this process.
///
/// An abnormal exit while this is set must be reported as a crash.
pub fn in_fuzzer() -> bool {
    IN_FUZZER.load(Ordering::SeqCst) > 0
}

/// Marks the process as in-fuzzer until dropped.
#[derive(Debug)]
pub struct InFuzzerGuard {
    _private: (),
}

impl InFuzzerGuard {
    pub fn enter() -> Self {
        IN_FUZZER.fetch_add(1, Ordering::SeqCst);
        Self { _private: () }
    }
}

impl Drop for InFuzzerGuard {
    fn drop(&mut self) {
        IN_FUZZER.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FuzzDriver<'a> {
    engine: &'a mut dyn Engine,
    limiter: &'a mut dyn Limiter,
    limits: ResourceLimits,
    policy: EscalationPolicy,
    sink: Option<Box<dyn Write + 'a>>,
    probe: Option<Box<dyn MemoryProbe + 'a>>,
}

impl<'a> FuzzDriver<'a> {
    pub fn new(engine: &'a mut dyn Engine, limiter: &'a mut dyn Limiter) -> Self {
        Self {
            engine,
            limiter,
            limits: ResourceLimits::default(),
            policy: EscalationPolicy::default(),
            sink: None,
            probe: None,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Progress reports go here instead of stderr.
    pub fn with_report_sink(mut self, sink: Box<dyn Write + 'a>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe + 'a>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Applies the resource limits and a short global statement timeout,
    /// independent of any session.
    pub fn configure_test_environment(&mut self) -> Result<(), FuzzError> {
        apply_limits(&self.limits, self.limiter)?;
        let timeout = self.limits.global_statement_timeout();
        self.engine.set_statement_timeout(Some(timeout));
        info!("global statement timeout set to {timeout:?}");
        Ok(())
    }

    /// Runs one fuzzing session over `query_text`.
    ///
    /// Setup problems (budget, malformed query, wrong parameter count, limits
    /// that cannot be applied) are returned before any iteration runs. A clean
    /// finish returns the final statistics; an escalation stops the session
    /// and comes back as [`FuzzError::Escalated`].
    pub fn start_fuzz(
        self,
        run_budget: u64,
        query_text: &str,
        source: &mut dyn InputSource,
    ) -> Result<SessionStats, FuzzError> {
        if run_budget > MAX_RUN_BUDGET {
            return Err(ConfigError::RunBudget {
                requested: run_budget,
                max: MAX_RUN_BUDGET,
            }
            .into());
        }
        let statement = PreparedStatement::prepare(self.engine, query_text)?;
        apply_limits(&self.limits, self.limiter)?;

        info!(
            run_budget,
            policy = ?self.policy,
            source = source.name(),
            "starting fuzz session over {:?}",
            statement.text()
        );

        let mut session = FuzzSession::new(run_budget, statement, self.limits, self.policy);
        let _guard = InFuzzerGuard::enter();
        session.set_in_fuzzer(true);

        let mut reporter = match self.sink {
            Some(sink) => ProgressReporter::new(sink),
            None => ProgressReporter::stderr(),
        };
        if let Some(probe) = self.probe {
            reporter = reporter.with_memory_probe(probe);
        }
        let oracle = Box::new(PolicyOracle::new(self.policy));
        let mut executor = IterationExecutor::new(self.engine, session, oracle, reporter);

        let start_time = Instant::now();
        for _ in 0..run_budget {
            let Some(input) = source.next_input() else {
                info!("input source {} exhausted", source.name());
                break;
            };
            if let IterationOutcome::Fatal(report) = executor.run(input.as_deref()) {
                let stats = executor.session().stats();
                error!(
                    n_execs = stats.n_execs,
                    "session stopped after {:.2?}: {report}",
                    start_time.elapsed()
                );
                return Err(FuzzError::Escalated {
                    report,
                    stats: Box::new(stats),
                });
            }
        }

        let mut session = executor.into_session();
        session.set_in_fuzzer(false);
        let stats = session.stats();
        info!(
            n_execs = stats.n_execs,
            n_success = stats.n_success,
            n_fail = stats.n_fail,
            n_null = stats.n_null,
            n_flagged = stats.n_flagged,
            "fuzz session finished in {:.2?}",
            start_time.elapsed()
        );
        Ok(stats)
    }
}

/// Returns a fatal error carrying `message`, whatever the session state.
pub fn force_fatal(message: impl Into<String>) -> FuzzError {
    let message = message.into();
    error!("fatal error requested: {message}");
    FuzzError::Forced(Box::new(BugReport::new(
        None,
        None,
        EscalationReason::Forced(message),
    )))
}

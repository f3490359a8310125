use crate::classifier::{RepeatTracker, classify};
use crate::engine::{Engine, EngineError, ExecStatus, ParamValue, SqlState};
use crate::governor::ResourceLimits;
use crate::histogram::ErrcodeHistogram;
use crate::oracle::{
    BugReport, ErrorRecord, EscalationPolicy, EscalationReason, FailureContext, Oracle, Verdict,
};
use crate::reporter::ProgressReporter;
use crate::statement::PreparedStatement;
use tracing::{debug, error, warn};

/// Largest run budget a session accepts.
pub const MAX_RUN_BUDGET: u64 = 400_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub n_execs: u64,
    pub n_success: u64,
    pub n_fail: u64,
    pub n_null: u64,
    /// Bug signals recorded without escalating (permissive policy only).
    pub n_flagged: u64,
}

/// State of one fuzzing run. Owned and mutated only by an [`IterationExecutor`].
#[derive(Debug)]
pub struct FuzzSession {
    run_budget: u64,
    statement: PreparedStatement,
    limits: ResourceLimits,
    policy: EscalationPolicy,
    counters: Counters,
    repeats: RepeatTracker,
    histogram: ErrcodeHistogram,
    in_fuzzer: bool,
}

impl FuzzSession {
    pub fn new(
        run_budget: u64,
        statement: PreparedStatement,
        limits: ResourceLimits,
        policy: EscalationPolicy,
    ) -> Self {
        Self {
            run_budget,
            statement,
            limits,
            policy,
            counters: Counters::default(),
            repeats: RepeatTracker::new(),
            histogram: ErrcodeHistogram::new(),
            in_fuzzer: false,
        }
    }

    pub fn run_budget(&self) -> u64 {
        self.run_budget
    }

    pub fn statement(&self) -> &PreparedStatement {
        &self.statement
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn policy(&self) -> EscalationPolicy {
        self.policy
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn histogram(&self) -> &ErrcodeHistogram {
        &self.histogram
    }

    pub fn last_error_code(&self) -> Option<SqlState> {
        self.repeats.last_code()
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeats.count()
    }

    pub fn in_fuzzer(&self) -> bool {
        self.in_fuzzer
    }

    pub fn set_in_fuzzer(&mut self, in_fuzzer: bool) {
        self.in_fuzzer = in_fuzzer;
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            n_execs: self.counters.n_execs,
            n_success: self.counters.n_success,
            n_fail: self.counters.n_fail,
            n_null: self.counters.n_null,
            n_flagged: self.counters.n_flagged,
            histogram: self.histogram.clone(),
            last_error_code: self.repeats.last_code(),
            repeat_count: self.repeats.count(),
        }
    }
}

/// Snapshot of a session's counters, for callers outside the executor.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub n_execs: u64,
    pub n_success: u64,
    pub n_fail: u64,
    pub n_null: u64,
    pub n_flagged: u64,
    pub histogram: ErrcodeHistogram,
    pub last_error_code: Option<SqlState>,
    pub repeat_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationState {
    Idle,
    Running,
    Committed,
    RolledBack,
    /// Terminal: the session stopped and accepts no more iterations.
    Escalated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Success,
    BenignFailure,
    Fatal(Box<BugReport>),
}

impl IterationOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IterationOutcome::Fatal(_))
    }
}

/// Runs one isolated attempt per input against the session's prepared
/// statement.
///
/// Every attempt runs inside a savepoint that is released on success and
/// rolled back on any failure, so no iteration observes another's effects.
pub struct IterationExecutor<'a> {
    engine: &'a mut dyn Engine,
    oracle: Box<dyn Oracle + 'a>,
    reporter: ProgressReporter<'a>,
    session: FuzzSession,
    state: IterationState,
    escalation: Option<Box<BugReport>>,
}

impl<'a> IterationExecutor<'a> {
    pub fn new(
        engine: &'a mut dyn Engine,
        session: FuzzSession,
        oracle: Box<dyn Oracle + 'a>,
        reporter: ProgressReporter<'a>,
    ) -> Self {
        Self {
            engine,
            oracle,
            reporter,
            session,
            state: IterationState::Idle,
            escalation: None,
        }
    }

    pub fn session(&self) -> &FuzzSession {
        &self.session
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    pub fn escalation(&self) -> Option<&BugReport> {
        self.escalation.as_deref()
    }

    pub fn into_session(self) -> FuzzSession {
        self.session
    }

    /// Runs one iteration. `None` is the absent-input sentinel and never
    /// reaches the engine; an empty slice is a real (empty) input.
    pub fn run(&mut self, input: Option<&[u8]>) -> IterationOutcome {
        if let Some(report) = &self.escalation {
            return IterationOutcome::Fatal(report.clone());
        }

        self.session.counters.n_execs += 1;
        let outcome = match input {
            None => {
                self.session.counters.n_null += 1;
                IterationOutcome::Success
            }
            Some(bytes) => self.run_isolated(bytes),
        };

        match &outcome {
            IterationOutcome::Fatal(report) => {
                self.state = IterationState::Escalated;
                self.escalation = Some(report.clone());
            }
            _ => self.state = IterationState::Idle,
        }

        if self.session.counters.n_execs.is_power_of_two() {
            self.reporter.report(&self.session);
        }
        outcome
    }

    fn run_isolated(&mut self, input: &[u8]) -> IterationOutcome {
        self.state = IterationState::Running;
        if let Err(e) = self.engine.begin_savepoint() {
            return self.harness_failure(input, "could not begin savepoint", &e);
        }

        let result = self.execute(input);
        match result {
            Ok(_) => {
                if let Err(e) = self.engine.release_savepoint() {
                    if let Err(rb) = self.engine.rollback_savepoint() {
                        warn!("rollback after failed release also failed: {rb}");
                    }
                    return self.harness_failure(input, "could not release savepoint", &e);
                }
                self.state = IterationState::Committed;
                self.session.counters.n_success += 1;
                self.session.repeats.reset();
                IterationOutcome::Success
            }
            Err(err) => self.handle_failure(input, err),
        }
    }

    fn execute(&mut self, input: &[u8]) -> Result<ExecStatus, EngineError> {
        // A pending cancel must be seen before the deadline is armed.
        self.engine.interrupt_checkpoint()?;
        self.engine.arm_deadline(self.session.limits.statement_deadline());
        let result = self.engine.execute(
            self.session.statement.plan(),
            &[ParamValue::Text(input)],
            true,
            0,
        );
        self.engine.disarm_deadline();
        result
    }

    fn handle_failure(&mut self, input: &[u8], err: EngineError) -> IterationOutcome {
        let rollback = self.engine.rollback_savepoint();
        self.state = IterationState::RolledBack;

        let record = ErrorRecord {
            code: err.code,
            category: classify(err.code, &err.message),
            message: err.message,
        };

        if let Err(e) = self.session.histogram.record(record.code) {
            error!("{e}");
            return self.escalate(input, record, EscalationReason::HarnessFailure(e.to_string()));
        }
        let repeat_count = self.session.repeats.note(record.code);

        if let Err(e) = rollback {
            return self.harness_failure(input, "could not roll back savepoint", &e);
        }

        let verdict = self.oracle.examine(&FailureContext {
            error: &record,
            repeat_count,
        });
        match verdict {
            Verdict::Benign => {
                debug!(code = %record.code, message = %record.message, "benign failure");
                self.session.counters.n_fail += 1;
                IterationOutcome::BenignFailure
            }
            Verdict::Flag(category) => {
                warn!(
                    code = %record.code,
                    ?category,
                    "recording error-{} ({}) and continuing",
                    record.code,
                    record.message
                );
                self.session.counters.n_fail += 1;
                self.session.counters.n_flagged += 1;
                IterationOutcome::BenignFailure
            }
            Verdict::Escalate(reason) => {
                if reason == EscalationReason::OperatorCancel {
                    self.session.in_fuzzer = false;
                }
                self.escalate(input, record, reason)
            }
        }
    }

    fn escalate(
        &mut self,
        input: &[u8],
        record: ErrorRecord,
        reason: EscalationReason,
    ) -> IterationOutcome {
        error!(
            "escalating error-{} ({}): {reason}",
            record.code, record.message
        );
        IterationOutcome::Fatal(Box::new(BugReport::new(Some(input), Some(record), reason)))
    }

    fn harness_failure(&mut self, input: &[u8], what: &str, err: &EngineError) -> IterationOutcome {
        error!("{what}: {err}");
        IterationOutcome::Fatal(Box::new(BugReport::new(
            Some(input),
            None,
            EscalationReason::HarnessFailure(format!("{what}: {err}")),
        )))
    }
}

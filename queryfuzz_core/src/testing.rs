//! Scripted in-memory engine used by the unit tests.

use crate::engine::{
    CancelToken, Engine, EngineError, ExecStatus, ParamType, ParamValue, PlanHandle, SqlState,
};
use std::collections::VecDeque;
use std::time::Duration;

struct FailureRule {
    prefix: Vec<u8>,
    error: EngineError,
}

/// Fake engine with observable side effects.
///
/// Every execution "writes" its input into the open savepoint before the
/// outcome is decided, so tests can check that failed iterations leave nothing
/// behind in `committed`.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    queued: VecDeque<Result<ExecStatus, EngineError>>,
    rules: Vec<FailureRule>,
    plans: Vec<String>,
    pending: Vec<Vec<u8>>,
    savepoint_open: bool,
    pub committed: Vec<Vec<u8>>,
    pub cancel: CancelToken,
    pub prepare_calls: usize,
    pub execute_calls: usize,
    pub begin_calls: usize,
    pub release_calls: usize,
    pub rollback_calls: usize,
    pub deadline_armed: bool,
    pub arm_calls: usize,
    pub statement_timeout: Option<Duration>,
    pub fail_begin_savepoint: bool,
    pub fail_release_savepoint: bool,
    pub fail_rollback_savepoint: bool,
    pub last_read_only: Option<bool>,
    /// Whether the process-wide in-fuzzer mark was set during the last execution.
    pub saw_in_fuzzer: Option<bool>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inputs starting with `prefix` fail with the given error. Rules are
    /// checked in insertion order.
    pub fn fail_when_input_starts_with(&mut self, prefix: &[u8], code: SqlState, message: &str) {
        self.rules.push(FailureRule {
            prefix: prefix.to_vec(),
            error: EngineError::new(code, message),
        });
    }

    /// The next execution returns `result` regardless of input.
    pub fn queue(&mut self, result: Result<ExecStatus, EngineError>) {
        self.queued.push_back(result);
    }

    pub fn savepoint_open(&self) -> bool {
        self.savepoint_open
    }
}

fn parameter_numbers(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.split('$').skip(1).filter_map(|rest| {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    })
}

impl Engine for ScriptedEngine {
    fn prepare(&mut self, text: &str, _types: &[ParamType]) -> Result<PlanHandle, EngineError> {
        self.prepare_calls += 1;
        if !text.trim_start().to_ascii_lowercase().starts_with("select") {
            return Err(EngineError::new(
                SqlState::SYNTAX_ERROR,
                format!("syntax error at or near \"{}\"", text.split_whitespace().next().unwrap_or("")),
            ));
        }
        self.plans.push(text.to_string());
        Ok(PlanHandle(self.plans.len() - 1))
    }

    fn parameter_count(&self, plan: PlanHandle) -> Result<usize, EngineError> {
        let text = self
            .plans
            .get(plan.0)
            .ok_or_else(|| EngineError::new(SqlState::INTERNAL_ERROR, "unknown plan"))?;
        Ok(parameter_numbers(text).max().unwrap_or(0))
    }

    fn execute(
        &mut self,
        _plan: PlanHandle,
        values: &[ParamValue<'_>],
        read_only: bool,
        _max_rows: u64,
    ) -> Result<ExecStatus, EngineError> {
        self.execute_calls += 1;
        self.last_read_only = Some(read_only);
        self.saw_in_fuzzer = Some(crate::driver::in_fuzzer());
        if !self.savepoint_open {
            return Err(EngineError::new(SqlState::INTERNAL_ERROR, "execute outside savepoint"));
        }
        let ParamValue::Text(input) = values
            .first()
            .copied()
            .ok_or_else(|| EngineError::new(SqlState::INTERNAL_ERROR, "missing parameter"))?;
        self.pending.push(input.to_vec());

        if self.cancel.is_cancelled() {
            return Err(EngineError::new(
                SqlState::QUERY_CANCELED,
                "canceling statement due to user request",
            ));
        }
        if let Some(result) = self.queued.pop_front() {
            return result;
        }
        if let Some(rule) = self.rules.iter().find(|r| input.starts_with(&r.prefix)) {
            return Err(rule.error.clone());
        }
        Ok(ExecStatus { rows: 1 })
    }

    fn begin_savepoint(&mut self) -> Result<(), EngineError> {
        self.begin_calls += 1;
        if self.fail_begin_savepoint {
            return Err(EngineError::new(
                SqlState::new("25000").unwrap(),
                "cannot start subtransaction",
            ));
        }
        self.savepoint_open = true;
        Ok(())
    }

    fn release_savepoint(&mut self) -> Result<(), EngineError> {
        self.release_calls += 1;
        if self.fail_release_savepoint {
            return Err(EngineError::new(
                SqlState::new("3B001").unwrap(),
                "savepoint does not exist",
            ));
        }
        self.savepoint_open = false;
        self.committed.append(&mut self.pending);
        Ok(())
    }

    fn rollback_savepoint(&mut self) -> Result<(), EngineError> {
        self.rollback_calls += 1;
        if self.fail_rollback_savepoint {
            return Err(EngineError::new(
                SqlState::new("3B001").unwrap(),
                "savepoint does not exist",
            ));
        }
        self.savepoint_open = false;
        self.pending.clear();
        Ok(())
    }

    fn interrupt_checkpoint(&mut self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::new(
                SqlState::QUERY_CANCELED,
                "canceling statement due to user request",
            ));
        }
        Ok(())
    }

    fn arm_deadline(&mut self, _after: Duration) {
        self.arm_calls += 1;
        self.deadline_armed = true;
    }

    fn disarm_deadline(&mut self) {
        self.deadline_armed = false;
    }

    fn set_statement_timeout(&mut self, timeout: Option<Duration>) {
        self.statement_timeout = timeout;
    }
}

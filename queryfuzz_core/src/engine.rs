use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// A five-character SQLSTATE error code.
///
/// The numeric form packs each character into six bits, first character in
/// the lowest bits, so the two-character class occupies the low twelve bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SqlState([u8; 5]);

impl SqlState {
    pub const SUCCESSFUL_COMPLETION: SqlState = SqlState(*b"00000");
    pub const QUERY_CANCELED: SqlState = SqlState(*b"57014");
    pub const ADMIN_SHUTDOWN: SqlState = SqlState(*b"57P01");
    pub const OUT_OF_MEMORY: SqlState = SqlState(*b"53200");
    pub const PROGRAM_LIMIT_EXCEEDED: SqlState = SqlState(*b"54000");
    pub const STATEMENT_TOO_COMPLEX: SqlState = SqlState(*b"54001");
    pub const INTERNAL_ERROR: SqlState = SqlState(*b"XX000");
    pub const DATA_CORRUPTED: SqlState = SqlState(*b"XX001");
    pub const INVALID_REGULAR_EXPRESSION: SqlState = SqlState(*b"2201B");
    pub const DATA_EXCEPTION: SqlState = SqlState(*b"22000");
    pub const INVALID_TEXT_REPRESENTATION: SqlState = SqlState(*b"22P02");
    pub const INVALID_JSON_TEXT: SqlState = SqlState(*b"22032");
    pub const NUMERIC_VALUE_OUT_OF_RANGE: SqlState = SqlState(*b"22003");
    pub const INTEGRITY_CONSTRAINT_VIOLATION: SqlState = SqlState(*b"23000");
    pub const READ_ONLY_SQL_TRANSACTION: SqlState = SqlState(*b"25006");
    pub const SYNTAX_ERROR: SqlState = SqlState(*b"42601");
    pub const UNDEFINED_FUNCTION: SqlState = SqlState(*b"42883");
    pub const UNDEFINED_TABLE: SqlState = SqlState(*b"42P01");
    pub const UNDEFINED_COLUMN: SqlState = SqlState(*b"42703");
    pub const DATATYPE_MISMATCH: SqlState = SqlState(*b"42804");
    pub const LOCK_NOT_AVAILABLE: SqlState = SqlState(*b"55P03");

    /// Builds a code from five characters in `0-9A-Z`. Returns `None` for
    /// anything else.
    pub fn new(text: &str) -> Option<SqlState> {
        let bytes: [u8; 5] = text.as_bytes().try_into().ok()?;
        if bytes
            .iter()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
        {
            Some(SqlState(bytes))
        } else {
            None
        }
    }

    pub fn from_code(code: u32) -> SqlState {
        let mut bytes = [0u8; 5];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (((code >> (6 * i)) & 0x3F) as u8) + b'0';
        }
        SqlState(bytes)
    }

    pub fn code(&self) -> u32 {
        self.0
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, b)| acc | ((u32::from(b - b'0') & 0x3F) << (6 * i)))
    }

    /// The two-character class, e.g. `"54"` for program limit errors.
    pub fn class(&self) -> [u8; 2] {
        [self.0[0], self.0[1]]
    }

    pub fn as_str(&self) -> &str {
        // Constructors only admit ASCII.
        std::str::from_utf8(&self.0).unwrap_or("?????")
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqlState({})", self.as_str())
    }
}

/// An error raised by the engine under test.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: SqlState,
    pub message: String,
}

impl EngineError {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue<'a> {
    /// Raw bytes bound as text; no encoding validation is applied.
    Text(&'a [u8]),
}

/// Opaque handle to a statement compiled by an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecStatus {
    pub rows: u64,
}

/// Operator-level cancellation flag shared between whoever requests the stop
/// (a signal handler, a test) and the engine's interrupt checks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// The transactional query engine being fuzzed.
///
/// Implementations are driven from a single thread, one call at a time. A
/// long-running `execute` is expected to poll for the armed deadline and for
/// operator cancellation, failing with [`SqlState::QUERY_CANCELED`] when
/// either fires.
pub trait Engine {
    /// Compiles `text` into a reusable plan.
    ///
    /// # Arguments
    /// * `text`: The statement, with `$n` parameter placeholders.
    /// * `types`: Declared parameter types, in placeholder order.
    ///
    /// # Returns
    /// A `PlanHandle` valid for the lifetime of the engine, or the engine's
    /// rejection (syntax errors, unknown functions) as an `EngineError`.
    fn prepare(&mut self, text: &str, types: &[ParamType]) -> Result<PlanHandle, EngineError>;

    /// Number of parameters the compiled statement actually references.
    fn parameter_count(&self, plan: PlanHandle) -> Result<usize, EngineError>;

    /// Runs a prepared statement to completion.
    ///
    /// # Arguments
    /// * `plan`: A handle returned by [`Engine::prepare`] on this engine.
    /// * `values`: One value per parameter.
    /// * `read_only`: When set, a statement that would write fails with
    ///   [`SqlState::READ_ONLY_SQL_TRANSACTION`] instead of running.
    /// * `max_rows`: Row limit; `0` means no limit.
    ///
    /// # Returns
    /// The number of rows produced, or the engine error that stopped the
    /// statement. An interrupt surfaces as [`SqlState::QUERY_CANCELED`].
    fn execute(
        &mut self,
        plan: PlanHandle,
        values: &[ParamValue<'_>],
        read_only: bool,
        max_rows: u64,
    ) -> Result<ExecStatus, EngineError>;

    /// Opens the per-iteration savepoint.
    fn begin_savepoint(&mut self) -> Result<(), EngineError>;
    /// Keeps the iteration's effects and closes the savepoint.
    fn release_savepoint(&mut self) -> Result<(), EngineError>;
    /// Discards the iteration's effects and closes the savepoint. Must work
    /// even while an interrupt is pending.
    fn rollback_savepoint(&mut self) -> Result<(), EngineError>;

    /// Fails if an interrupt (cancel or expired deadline) is pending.
    fn interrupt_checkpoint(&mut self) -> Result<(), EngineError>;

    /// Arms a deadline `after` from now for the next statement.
    fn arm_deadline(&mut self, after: Duration);
    fn disarm_deadline(&mut self);

    /// Deadline applied to every statement when no per-call deadline is armed.
    fn set_statement_timeout(&mut self, timeout: Option<Duration>);
}

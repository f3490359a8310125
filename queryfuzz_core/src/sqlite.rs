//! [`Engine`] implementation over an embedded SQLite database.
//!
//! Savepoints map onto `SAVEPOINT` / `RELEASE` / `ROLLBACK TO`. Deadlines and
//! operator cancellation are enforced cooperatively through SQLite's progress
//! handler, which the library invokes every few virtual machine instructions.
//! SQLite result codes are translated into SQLSTATEs so the classifier can
//! treat every backend alike.

use crate::engine::{
    CancelToken, Engine, EngineError, ExecStatus, ParamType, ParamValue, PlanHandle, SqlState,
};
use crate::sweep::FunctionSignature;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const SAVEPOINT: &str = "queryfuzz_iteration";
/// VM instructions between progress handler calls.
const PROGRESS_INTERVAL: i32 = 1_000;
const DISARMED: u64 = 0;

/// State shared with the progress handler closure.
struct InterruptState {
    epoch: Instant,
    /// Nanoseconds since `epoch` at which the running statement expires, or
    /// [`DISARMED`].
    deadline: AtomicU64,
    cancel: Arc<AtomicBool>,
    timed_out: AtomicBool,
}

impl InterruptState {
    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX - 1)
    }

    fn arm(&self, after: Duration) {
        let after = u64::try_from(after.as_nanos()).unwrap_or(u64::MAX / 2);
        self.timed_out.store(false, Ordering::SeqCst);
        self.deadline
            .store(self.now().saturating_add(after).max(1), Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.deadline.store(DISARMED, Ordering::SeqCst);
        self.timed_out.store(false, Ordering::SeqCst);
    }

    /// Returns true when the running statement must be interrupted.
    fn should_interrupt(&self) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            return true;
        }
        let deadline = self.deadline.load(Ordering::SeqCst);
        if deadline != DISARMED && self.now() >= deadline {
            self.timed_out.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

pub struct SqliteEngine {
    conn: Connection,
    plans: Vec<String>,
    interrupt: Arc<InterruptState>,
    cancel: CancelToken,
    statement_timeout: Option<Duration>,
    deadline_armed: bool,
}

impl SqliteEngine {
    pub fn open_in_memory() -> Result<Self, EngineError> {
        Self::from_connection(Connection::open_in_memory().map_err(translate)?)
    }

    pub fn open(path: &Path) -> Result<Self, EngineError> {
        Self::from_connection(Connection::open(path).map_err(translate)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, EngineError> {
        let cancel = CancelToken::new();
        let interrupt = install_interrupt(&conn, &cancel);
        Ok(Self {
            conn,
            plans: Vec::new(),
            interrupt,
            cancel,
            statement_timeout: None,
            deadline_armed: false,
        })
    }

    /// Token that interrupts the running statement as an operator cancel.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Replaces the engine's cancel token, so one token can stop a series of
    /// engines opened one after another.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.interrupt = install_interrupt(&self.conn, &cancel);
        self.cancel = cancel;
        self
    }

    /// Deterministic scalar functions with a fixed argument count, one entry
    /// per `(name, arity)` overload, sorted by name.
    pub fn scalar_functions(&self) -> Result<Vec<FunctionSignature>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT name, narg FROM pragma_function_list \
                 WHERE type = 's' AND narg >= 0 AND (flags & 0x800) != 0 \
                 ORDER BY name, narg",
            )
            .map_err(translate)?;
        let rows = stmt
            .query_map([], |row| {
                let arity: i64 = row.get(1)?;
                Ok(FunctionSignature {
                    name: row.get(0)?,
                    arity: usize::try_from(arity).unwrap_or_default(),
                })
            })
            .map_err(translate)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(translate)
    }

    /// Runs setup SQL (schema, fixtures) outside of any fuzz iteration.
    pub fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError> {
        self.conn.execute_batch(sql).map_err(translate)
    }

    /// Runs a query and returns its first column as text, for checking state.
    pub fn query_strings(&mut self, sql: &str) -> Result<Vec<String>, EngineError> {
        let mut stmt = self.conn.prepare(sql).map_err(translate)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(translate)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(translate)
    }

    fn plan_text(&self, plan: PlanHandle) -> Result<&str, EngineError> {
        self.plans
            .get(plan.0)
            .map(String::as_str)
            .ok_or_else(|| EngineError::new(SqlState::INTERNAL_ERROR, format!("unknown plan {plan:?}")))
    }

    fn interrupted(&self) -> EngineError {
        let message = if self.cancel.is_cancelled() {
            "canceling statement due to user request"
        } else if self.interrupt.timed_out.load(Ordering::SeqCst) {
            "canceling statement due to statement timeout"
        } else {
            "canceling statement due to interrupt"
        };
        EngineError::new(SqlState::QUERY_CANCELED, message)
    }

    fn run_statement(
        &self,
        plan: PlanHandle,
        values: &[ParamValue<'_>],
        read_only: bool,
        max_rows: u64,
    ) -> Result<ExecStatus, EngineError> {
        let mut stmt = self
            .conn
            .prepare_cached(self.plan_text(plan)?)
            .map_err(translate)?;
        if read_only && !stmt.readonly() {
            return Err(EngineError::new(
                SqlState::READ_ONLY_SQL_TRANSACTION,
                "cannot execute a writing statement in a read-only fuzz iteration",
            ));
        }
        for (i, value) in values.iter().enumerate() {
            let ParamValue::Text(bytes) = *value;
            stmt.raw_bind_parameter(i + 1, ToSqlOutput::Borrowed(ValueRef::Text(bytes)))
                .map_err(translate)?;
        }

        let mut rows = stmt.raw_query();
        let mut count = 0u64;
        while let Some(_row) = rows.next().map_err(|e| self.map_error(e))? {
            count += 1;
            if max_rows != 0 && count >= max_rows {
                break;
            }
        }
        Ok(ExecStatus { rows: count })
    }

    fn map_error(&self, err: rusqlite::Error) -> EngineError {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted => {
                self.interrupted()
            }
            _ => translate(err),
        }
    }
}

impl Engine for SqliteEngine {
    fn prepare(&mut self, text: &str, types: &[ParamType]) -> Result<PlanHandle, EngineError> {
        // Only text parameters exist; SQLite binds them without declared types.
        debug_assert!(types.iter().all(|t| *t == ParamType::Text));
        self.conn.prepare_cached(text).map_err(translate)?;
        self.plans.push(text.to_string());
        Ok(PlanHandle(self.plans.len() - 1))
    }

    fn parameter_count(&self, plan: PlanHandle) -> Result<usize, EngineError> {
        let stmt = self
            .conn
            .prepare_cached(self.plan_text(plan)?)
            .map_err(translate)?;
        Ok(stmt.parameter_count())
    }

    fn execute(
        &mut self,
        plan: PlanHandle,
        values: &[ParamValue<'_>],
        read_only: bool,
        max_rows: u64,
    ) -> Result<ExecStatus, EngineError> {
        let fallback = if self.deadline_armed {
            None
        } else {
            self.statement_timeout
        };
        if let Some(timeout) = fallback {
            self.interrupt.arm(timeout);
        }
        let result = self.run_statement(plan, values, read_only, max_rows);
        if fallback.is_some() {
            self.interrupt.disarm();
        }
        result
    }

    fn begin_savepoint(&mut self) -> Result<(), EngineError> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))
            .map_err(translate)
    }

    fn release_savepoint(&mut self) -> Result<(), EngineError> {
        self.conn
            .execute_batch(&format!("RELEASE {SAVEPOINT}"))
            .map_err(translate)
    }

    fn rollback_savepoint(&mut self) -> Result<(), EngineError> {
        // The interrupt state must not abort the rollback itself.
        self.interrupt.disarm();
        self.conn
            .execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"))
            .map_err(translate)
    }

    fn interrupt_checkpoint(&mut self) -> Result<(), EngineError> {
        if self.interrupt.should_interrupt() {
            return Err(self.interrupted());
        }
        Ok(())
    }

    fn arm_deadline(&mut self, after: Duration) {
        self.interrupt.arm(after);
        self.deadline_armed = true;
    }

    fn disarm_deadline(&mut self) {
        self.interrupt.disarm();
        self.deadline_armed = false;
    }

    fn set_statement_timeout(&mut self, timeout: Option<Duration>) {
        debug!(?timeout, "statement timeout");
        self.statement_timeout = timeout;
    }
}

fn install_interrupt(conn: &Connection, cancel: &CancelToken) -> Arc<InterruptState> {
    let interrupt = Arc::new(InterruptState {
        epoch: Instant::now(),
        deadline: AtomicU64::new(DISARMED),
        cancel: cancel.flag(),
        timed_out: AtomicBool::new(false),
    });
    let handler_state = Arc::clone(&interrupt);
    conn.progress_handler(
        PROGRESS_INTERVAL,
        Some(move || handler_state.should_interrupt()),
    );
    interrupt
}

/// Maps a SQLite failure onto the closest SQLSTATE.
fn translate(err: rusqlite::Error) -> EngineError {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            let message = msg.unwrap_or_else(|| e.to_string());
            EngineError::new(sqlstate_for(e.code, &message), message)
        }
        // Prepare-time errors carry the byte offset of the offending token.
        rusqlite::Error::SqlInputError { error, msg, .. } => {
            EngineError::new(sqlstate_for(error.code, &msg), msg)
        }
        rusqlite::Error::InvalidParameterCount(given, expected) => EngineError::new(
            SqlState::new("08P01").unwrap_or(SqlState::INTERNAL_ERROR),
            format!("bind message supplies {given} parameters, but statement requires {expected}"),
        ),
        other => EngineError::new(SqlState::INTERNAL_ERROR, other.to_string()),
    }
}

fn sqlstate_for(code: ErrorCode, message: &str) -> SqlState {
    match code {
        ErrorCode::OperationInterrupted => SqlState::QUERY_CANCELED,
        ErrorCode::OutOfMemory => SqlState::OUT_OF_MEMORY,
        ErrorCode::TooBig => SqlState::PROGRAM_LIMIT_EXCEEDED,
        ErrorCode::InternalMalfunction => SqlState::INTERNAL_ERROR,
        ErrorCode::DatabaseCorrupt => SqlState::DATA_CORRUPTED,
        ErrorCode::ConstraintViolation => SqlState::INTEGRITY_CONSTRAINT_VIOLATION,
        ErrorCode::TypeMismatch => SqlState::DATATYPE_MISMATCH,
        ErrorCode::ReadOnly => SqlState::READ_ONLY_SQL_TRANSACTION,
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => SqlState::LOCK_NOT_AVAILABLE,
        ErrorCode::ParameterOutOfRange => SqlState::NUMERIC_VALUE_OUT_OF_RANGE,
        ErrorCode::ApiMisuse => SqlState::INTERNAL_ERROR,
        _ => sqlstate_for_message(message),
    }
}

/// Generic `SQLITE_ERROR`s only differ by message.
fn sqlstate_for_message(message: &str) -> SqlState {
    let lower = message.to_ascii_lowercase();
    if lower.contains("syntax error") || lower.starts_with("near ") || lower.contains("incomplete input") {
        SqlState::SYNTAX_ERROR
    } else if lower.contains("no such function") || lower.contains("wrong number of arguments") {
        SqlState::UNDEFINED_FUNCTION
    } else if lower.contains("no such table") {
        SqlState::UNDEFINED_TABLE
    } else if lower.contains("no such column") {
        SqlState::UNDEFINED_COLUMN
    } else if lower.contains("expression tree is too large") || lower.contains("too many levels") {
        SqlState::STATEMENT_TOO_COMPLEX
    } else if lower.contains("too big") || lower.contains("too complex") {
        SqlState::PROGRAM_LIMIT_EXCEEDED
    } else if lower.contains("malformed json") {
        SqlState::INVALID_JSON_TEXT
    } else if lower.contains("regular expression") || lower.contains("regexp") {
        SqlState::INVALID_REGULAR_EXPRESSION
    } else if lower.contains("out of memory") {
        SqlState::OUT_OF_MEMORY
    } else if lower.contains("integer overflow") || lower.contains("out of range") {
        SqlState::NUMERIC_VALUE_OUT_OF_RANGE
    } else {
        SqlState::DATA_EXCEPTION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Category, classify};

    fn engine_with_table() -> SqliteEngine {
        let mut engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .execute_batch("CREATE TABLE kv(k TEXT PRIMARY KEY, v TEXT); INSERT INTO kv VALUES ('seed', 'x');")
            .unwrap();
        engine
    }

    #[test]
    fn counts_parameters() {
        let mut engine = engine_with_table();
        let one = engine.prepare("SELECT length(?1)", &[ParamType::Text]).unwrap();
        assert_eq!(engine.parameter_count(one).unwrap(), 1);
        let two = engine.prepare("SELECT ?1 || ?2", &[ParamType::Text]).unwrap();
        assert_eq!(engine.parameter_count(two).unwrap(), 2);
    }

    #[test]
    fn prepare_reports_syntax_errors() {
        let mut engine = engine_with_table();
        let err = engine.prepare("SELEC 1", &[ParamType::Text]).unwrap_err();
        assert_eq!(err.code, SqlState::SYNTAX_ERROR);
    }

    #[test]
    fn sql_input_errors_keep_their_sqlstate() {
        let conn = Connection::open_in_memory().unwrap();
        let err = translate(conn.prepare("SELEC 1").unwrap_err());
        assert_eq!(err.code, SqlState::SYNTAX_ERROR);
        assert!(err.message.contains("syntax error"), "{}", err.message);

        let err = translate(conn.prepare("SELECT no_such_fn(1)").unwrap_err());
        assert_eq!(err.code, SqlState::UNDEFINED_FUNCTION);
        assert_ne!(classify(err.code, &err.message), Category::InternalError);
    }

    #[test]
    fn executes_with_raw_bytes() {
        let mut engine = engine_with_table();
        let plan = engine.prepare("SELECT length(CAST(?1 AS BLOB))", &[ParamType::Text]).unwrap();
        let status = engine
            .execute(plan, &[ParamValue::Text(b"\xff\xfe\x00z")], true, 0)
            .unwrap();
        assert_eq!(status.rows, 1);
    }

    #[test]
    fn malformed_json_is_a_data_error() {
        let mut engine = engine_with_table();
        let plan = engine.prepare("SELECT json(?1)", &[ParamType::Text]).unwrap();
        let err = engine
            .execute(plan, &[ParamValue::Text(b"{not json")], true, 0)
            .unwrap_err();
        assert_eq!(err.code, SqlState::INVALID_JSON_TEXT);
        assert_eq!(classify(err.code, &err.message), Category::Benign);
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut engine = engine_with_table();
        let plan = engine
            .prepare("INSERT INTO kv VALUES (?1, 'y')", &[ParamType::Text])
            .unwrap();
        let err = engine
            .execute(plan, &[ParamValue::Text(b"k")], true, 0)
            .unwrap_err();
        assert_eq!(err.code, SqlState::READ_ONLY_SQL_TRANSACTION);
    }

    #[test]
    fn rollback_discards_savepoint_changes() {
        let mut engine = engine_with_table();
        let plan = engine
            .prepare("INSERT INTO kv VALUES (?1, 'y')", &[ParamType::Text])
            .unwrap();

        engine.begin_savepoint().unwrap();
        engine.execute(plan, &[ParamValue::Text(b"gone")], false, 0).unwrap();
        engine.rollback_savepoint().unwrap();

        engine.begin_savepoint().unwrap();
        engine.execute(plan, &[ParamValue::Text(b"kept")], false, 0).unwrap();
        engine.release_savepoint().unwrap();

        let keys = engine.query_strings("SELECT k FROM kv ORDER BY k").unwrap();
        assert_eq!(keys, vec!["kept".to_string(), "seed".to_string()]);
    }

    #[test]
    fn deadline_interrupts_long_queries() {
        let mut engine = engine_with_table();
        let plan = engine
            .prepare(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                 SELECT count(*) FROM c WHERE x > length(?1)",
                &[ParamType::Text],
            )
            .unwrap();
        engine.arm_deadline(Duration::from_millis(20));
        let err = engine
            .execute(plan, &[ParamValue::Text(b"a")], true, 0)
            .unwrap_err();
        engine.disarm_deadline();
        assert_eq!(err.code, SqlState::QUERY_CANCELED);
        assert_eq!(classify(err.code, &err.message), Category::Benign);
    }

    #[test]
    fn interrupt_message_follows_the_trigger() {
        let mut engine = engine_with_table();
        engine.arm_deadline(Duration::ZERO);
        let err = engine.interrupt_checkpoint().unwrap_err();
        assert!(err.message.contains("statement timeout"));
        assert_eq!(classify(err.code, &err.message), Category::Benign);

        engine.disarm_deadline();
        assert!(engine.interrupt_checkpoint().is_ok());
        // An interrupt that neither the deadline nor the operator asked for.
        let err = engine.interrupted();
        assert_eq!(err.message, "canceling statement due to interrupt");
        assert_eq!(classify(err.code, &err.message), Category::UserCancel);
    }

    #[test]
    fn shared_cancel_token_reaches_replaced_handler() {
        let token = CancelToken::new();
        let mut engine = engine_with_table().with_cancel_token(token.clone());
        assert!(engine.interrupt_checkpoint().is_ok());
        token.cancel();
        let err = engine.interrupt_checkpoint().unwrap_err();
        assert_eq!(classify(err.code, &err.message), Category::UserCancel);
    }

    #[test]
    fn lists_deterministic_scalar_functions() {
        let engine = engine_with_table();
        let functions = engine.scalar_functions().unwrap();
        let has = |name: &str, arity: usize| {
            functions.iter().any(|f| f.name == name && f.arity == arity)
        };
        assert!(has("length", 1));
        assert!(has("substr", 2));
        assert!(has("substr", 3));
        assert!(!functions.iter().any(|f| f.name == "random"));
        let mut deduped = functions.clone();
        deduped.dedup();
        assert_eq!(deduped, functions);
    }

    #[test]
    fn cancel_token_surfaces_as_user_cancel() {
        let mut engine = engine_with_table();
        engine.cancel_token().cancel();
        let err = engine.interrupt_checkpoint().unwrap_err();
        assert_eq!(classify(err.code, &err.message), Category::UserCancel);
    }

    #[test]
    fn message_mapping() {
        assert_eq!(sqlstate_for_message("near \"(\": syntax error"), SqlState::SYNTAX_ERROR);
        assert_eq!(sqlstate_for_message("no such function: foo"), SqlState::UNDEFINED_FUNCTION);
        assert_eq!(
            sqlstate_for_message("Expression tree is too large (maximum depth 1000)"),
            SqlState::STATEMENT_TOO_COMPLEX
        );
        assert_eq!(sqlstate_for_message("LIKE or GLOB pattern too complex"), SqlState::PROGRAM_LIMIT_EXCEEDED);
        assert_eq!(sqlstate_for_message("something else"), SqlState::DATA_EXCEPTION);
    }
}

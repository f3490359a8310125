use crate::classifier::{Category, REPEAT_LIMIT};
use crate::engine::SqlState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How escalation-worthy engine errors are treated.
///
/// Operator cancellation and runaway repetition always escalate; the policy
/// only decides the fate of the bug-signal categories.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationPolicy {
    /// Stop the session on the first bug signal.
    #[default]
    Strict,
    /// Record bug signals and keep fuzzing.
    Permissive,
}

/// One engine error, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: SqlState,
    pub category: Category,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationReason {
    /// The operator asked the session to stop.
    OperatorCancel,
    /// The same error code came back too many times in a row.
    RepeatedErrorCode { count: u32 },
    /// The engine reported an error that indicates a bug.
    BugSignal(Category),
    /// The harness itself can no longer guarantee isolation or bookkeeping.
    HarnessFailure(String),
    /// Requested explicitly by the embedding program.
    Forced(String),
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::OperatorCancel => f.write_str("operator cancel"),
            EscalationReason::RepeatedErrorCode { count } => {
                write!(f, "same error code {count} times in a row")
            }
            EscalationReason::BugSignal(category) => write!(f, "bug signal {category:?}"),
            EscalationReason::HarnessFailure(why) => write!(f, "harness failure: {why}"),
            EscalationReason::Forced(message) => write!(f, "forced: {message}"),
        }
    }
}

/// A finding handed back to the driver when a session escalates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    /// The input that triggered the escalation; `None` when no input was involved.
    pub input: Option<Vec<u8>>,
    /// MD5 hex digest of the input, suitable as an artifact name.
    pub input_hash: Option<String>,
    pub error: Option<ErrorRecord>,
    pub reason: EscalationReason,
    pub description: String,
}

impl BugReport {
    pub fn new(
        input: Option<&[u8]>,
        error: Option<ErrorRecord>,
        reason: EscalationReason,
    ) -> Self {
        let description = match &error {
            Some(record) => format!("{reason}: error-{} ({})", record.code, record.message),
            None => reason.to_string(),
        };
        Self {
            input: input.map(<[u8]>::to_vec),
            input_hash: input.map(|bytes| format!("{:x}", md5::compute(bytes))),
            error,
            reason,
            description,
        }
    }
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)?;
        if let Some(hash) = &self.input_hash {
            write!(f, " [input {hash}]")?;
        }
        Ok(())
    }
}

/// What the executor knows about a failed iteration when asking for a verdict.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub error: &'a ErrorRecord,
    pub repeat_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Expected rejection of a malformed input.
    Benign,
    /// A bug signal that the policy says to record rather than stop on.
    Flag(Category),
    Escalate(EscalationReason),
}

/// Decides whether a failed iteration stops the session.
///
/// An oracle only sees iterations that failed inside the engine; successes
/// and harness failures never reach it.
pub trait Oracle {
    /// Examines one engine error and the state of the repeat tracker.
    ///
    /// # Arguments
    /// * `failure`: The classified error of the current iteration and how many
    ///   consecutive iterations, this one included, failed with the same code.
    ///
    /// # Returns
    /// A `Verdict`: `Benign` to count the failure and continue, `Flag` to
    /// record a bug signal and continue, or `Escalate` to stop the session.
    fn examine(&self, failure: &FailureContext<'_>) -> Verdict;
}

/// The standard decision table: cancel first, then repetition, then the
/// bug-signal categories subject to the escalation policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyOracle {
    pub policy: EscalationPolicy,
}

impl PolicyOracle {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self { policy }
    }
}

impl Oracle for PolicyOracle {
    fn examine(&self, failure: &FailureContext<'_>) -> Verdict {
        let category = failure.error.category;
        if category == Category::UserCancel {
            return Verdict::Escalate(EscalationReason::OperatorCancel);
        }
        if failure.repeat_count > REPEAT_LIMIT {
            return Verdict::Escalate(EscalationReason::RepeatedErrorCode {
                count: failure.repeat_count,
            });
        }
        if category.is_bug_signal() {
            return match self.policy {
                EscalationPolicy::Strict => Verdict::Escalate(EscalationReason::BugSignal(category)),
                EscalationPolicy::Permissive => Verdict::Flag(category),
            };
        }
        Verdict::Benign
    }
}

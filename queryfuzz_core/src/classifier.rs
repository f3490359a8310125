use crate::engine::SqlState;

/// Consecutive identical error codes tolerated before the repetition itself is
/// treated as a harness malfunction.
pub const REPEAT_LIMIT: u32 = 10;

/// Sub-codes reported by the engine's regular expression library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegexSubcode {
    /// Ran out of space (`REG_ESPACE`).
    SpaceExhausted,
    /// Internal assertion failed (`REG_ASSERT`).
    AssertionFailed,
    /// Invalid argument to a regex function (`REG_INVARG`).
    InvalidArgument,
    /// Mixed multibyte and singlebyte character widths (`REG_MIXED`).
    MixedWidths,
    /// Color map overflow (`REG_ECOLORS`).
    TooManyColors,
    /// Any other sub-code, including pattern syntax errors.
    Other(u32),
    Unknown,
}

impl RegexSubcode {
    pub fn from_number(n: u32) -> Self {
        match n {
            12 => RegexSubcode::SpaceExhausted,
            15 => RegexSubcode::AssertionFailed,
            16 => RegexSubcode::InvalidArgument,
            17 => RegexSubcode::MixedWidths,
            20 => RegexSubcode::TooManyColors,
            other => RegexSubcode::Other(other),
        }
    }

    /// Extracts the sub-code from the end of an error message.
    ///
    /// Accepts either a trailing number (`... (12)`, `... [regerr 12]`) or one
    /// of the library's fixed messages following the last `": "`.
    pub fn parse(message: &str) -> Self {
        let trimmed = message.trim_end();
        if let Some(inner) = trimmed
            .strip_suffix(')')
            .and_then(|s| s.rsplit_once('(').map(|(_, inner)| inner))
            .or_else(|| {
                trimmed
                    .strip_suffix(']')
                    .and_then(|s| s.rsplit_once('[').map(|(_, inner)| inner))
            })
        {
            if let Some(n) = inner
                .split_whitespace()
                .last()
                .and_then(|tok| tok.parse::<u32>().ok())
            {
                return Self::from_number(n);
            }
        }

        let tail = trimmed
            .rsplit_once(": ")
            .map_or(trimmed, |(_, tail)| tail)
            .to_ascii_lowercase();
        if tail.starts_with("out of memory") {
            RegexSubcode::SpaceExhausted
        } else if tail.contains("can't happen") {
            RegexSubcode::AssertionFailed
        } else if tail.starts_with("invalid argument to regex function") {
            RegexSubcode::InvalidArgument
        } else if tail.starts_with("character widths of regex and string differ") {
            RegexSubcode::MixedWidths
        } else if tail.starts_with("too many colors") {
            RegexSubcode::TooManyColors
        } else {
            RegexSubcode::Unknown
        }
    }

    pub fn is_escalation_worthy(&self) -> bool {
        matches!(
            self,
            RegexSubcode::SpaceExhausted
                | RegexSubcode::AssertionFailed
                | RegexSubcode::InvalidArgument
                | RegexSubcode::MixedWidths
                | RegexSubcode::TooManyColors
        )
    }
}

/// Coarse grouping of engine errors used to decide continue vs. escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    UserCancel,
    ResourceExhaustion,
    ProgramLimitExceeded,
    InternalError,
    RegexEngineFailure(RegexSubcode),
    Benign,
}

impl Category {
    /// True for the categories that indicate a bug in the engine rather than
    /// a rejected input. Operator cancellation is handled separately.
    pub fn is_bug_signal(&self) -> bool {
        match self {
            Category::ResourceExhaustion
            | Category::ProgramLimitExceeded
            | Category::InternalError => true,
            Category::RegexEngineFailure(sub) => sub.is_escalation_worthy(),
            Category::UserCancel | Category::Benign => false,
        }
    }
}

pub fn classify(code: SqlState, message: &str) -> Category {
    if code == SqlState::INVALID_REGULAR_EXPRESSION {
        return Category::RegexEngineFailure(RegexSubcode::parse(message));
    }
    match &code.class() {
        b"57" => {
            // A statement timeout surfaces as a cancel too, but it only means
            // the input was slow.
            if code == SqlState::QUERY_CANCELED && message.contains("statement timeout") {
                Category::Benign
            } else {
                Category::UserCancel
            }
        }
        b"53" => Category::ResourceExhaustion,
        b"54" => Category::ProgramLimitExceeded,
        b"XX" => Category::InternalError,
        _ => Category::Benign,
    }
}

/// Tracks runs of identical consecutive error codes.
#[derive(Debug, Default, Clone)]
pub struct RepeatTracker {
    last: Option<SqlState>,
    count: u32,
}

impl RepeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `code` and returns the length of the current run of identical
    /// codes, counting this one.
    pub fn note(&mut self, code: SqlState) -> u32 {
        if self.last != Some(code) {
            self.last = Some(code);
            self.count = 0;
        }
        self.count += 1;
        self.count
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.count = 0;
    }

    pub fn last_code(&self) -> Option<SqlState> {
        self.last
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn exceeds_limit(&self) -> bool {
        self.count > REPEAT_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(s: &str) -> SqlState {
        SqlState::new(s).unwrap()
    }

    #[test]
    fn classes_map_to_categories() {
        assert_eq!(classify(state("53200"), "out of memory"), Category::ResourceExhaustion);
        assert_eq!(classify(state("54001"), "stack depth limit exceeded"), Category::ProgramLimitExceeded);
        assert_eq!(classify(state("XX000"), "unexpected state"), Category::InternalError);
        assert_eq!(classify(state("22P02"), "invalid input syntax"), Category::Benign);
        assert_eq!(classify(state("42601"), "syntax error"), Category::Benign);
    }

    #[test]
    fn cancel_depends_on_message() {
        assert_eq!(
            classify(SqlState::QUERY_CANCELED, "canceling statement due to user request"),
            Category::UserCancel
        );
        assert_eq!(
            classify(SqlState::QUERY_CANCELED, "canceling statement due to statement timeout"),
            Category::Benign
        );
        assert_eq!(classify(SqlState::ADMIN_SHUTDOWN, "terminating connection"), Category::UserCancel);
    }

    #[test]
    fn regex_subcodes_from_trailing_number() {
        let cat = classify(
            SqlState::INVALID_REGULAR_EXPRESSION,
            "invalid regular expression: failure (regerr 12)",
        );
        assert_eq!(cat, Category::RegexEngineFailure(RegexSubcode::SpaceExhausted));
        assert!(cat.is_bug_signal());

        let cat = classify(SqlState::INVALID_REGULAR_EXPRESSION, "bad pattern [7]");
        assert_eq!(cat, Category::RegexEngineFailure(RegexSubcode::Other(7)));
        assert!(!cat.is_bug_signal());
    }

    #[test]
    fn regex_subcodes_from_message_text() {
        let cases = [
            ("invalid regular expression: out of memory", RegexSubcode::SpaceExhausted),
            (
                "invalid regular expression: \"can't happen\" -- you found a bug",
                RegexSubcode::AssertionFailed,
            ),
            (
                "invalid regular expression: invalid argument to regex function",
                RegexSubcode::InvalidArgument,
            ),
            (
                "invalid regular expression: character widths of regex and string differ",
                RegexSubcode::MixedWidths,
            ),
            ("invalid regular expression: too many colors", RegexSubcode::TooManyColors),
            ("invalid regular expression: parentheses () not balanced", RegexSubcode::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(RegexSubcode::parse(message), expected, "message: {message}");
        }
    }

    #[test]
    fn repeat_tracker_counts_runs() {
        let mut tracker = RepeatTracker::new();
        let a = state("22P02");
        let b = state("42601");
        assert_eq!(tracker.note(a), 1);
        assert_eq!(tracker.note(a), 2);
        assert_eq!(tracker.note(b), 1);
        assert_eq!(tracker.last_code(), Some(b));
        tracker.reset();
        assert_eq!(tracker.note(b), 1);
    }

    #[test]
    fn eleventh_identical_code_exceeds_limit() {
        let mut tracker = RepeatTracker::new();
        let code = state("22P02");
        for _ in 0..REPEAT_LIMIT {
            tracker.note(code);
            assert!(!tracker.exceeds_limit());
        }
        tracker.note(code);
        assert!(tracker.exceeds_limit());
    }

    proptest! {
        #[test]
        fn classify_never_panics(code in "[0-9A-Z]{5}", message in ".*") {
            let _ = classify(SqlState::new(&code).unwrap(), &message);
        }

        #[test]
        fn unrelated_classes_are_benign(code in "(0[0-9]|1[0-9]|2[3-9]|4[0-9])[0-9A-Z]{3}") {
            prop_assert_eq!(classify(SqlState::new(&code).unwrap(), "x"), Category::Benign);
        }

        #[test]
        fn run_length_matches_repetitions(n in 1u32..50) {
            let mut tracker = RepeatTracker::new();
            tracker.note(SqlState::SYNTAX_ERROR);
            let code = SqlState::DATA_EXCEPTION;
            let mut last = 0;
            for _ in 0..n {
                last = tracker.note(code);
            }
            prop_assert_eq!(last, n);
            prop_assert_eq!(tracker.exceeds_limit(), n > REPEAT_LIMIT);
        }
    }
}

use crate::engine::SqlState;
use std::fmt;
use thiserror::Error;

pub const HISTOGRAM_CAPACITY: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistogramError {
    /// More distinct codes than the histogram can hold. This is a harness bug,
    /// not an engine finding.
    #[error("error code histogram full ({capacity} distinct codes), cannot record {code}")]
    CapacityExceeded { code: SqlState, capacity: usize },
}

/// Occurrence counts per error code, kept in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct ErrcodeHistogram {
    entries: Vec<(SqlState, u64)>,
}

impl ErrcodeHistogram {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(HISTOGRAM_CAPACITY),
        }
    }

    /// Bumps the count for `code` and returns the new count.
    pub fn record(&mut self, code: SqlState) -> Result<u64, HistogramError> {
        if let Some((_, count)) = self.entries.iter_mut().find(|(c, _)| *c == code) {
            *count += 1;
            return Ok(*count);
        }
        if self.entries.len() >= HISTOGRAM_CAPACITY {
            return Err(HistogramError::CapacityExceeded {
                code,
                capacity: HISTOGRAM_CAPACITY,
            });
        }
        self.entries.push((code, 1));
        Ok(1)
    }

    pub fn count(&self, code: SqlState) -> u64 {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map_or(0, |(_, n)| *n)
    }

    pub fn distinct(&self) -> usize {
        self.entries.len()
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SqlState, u64)> + '_ {
        self.entries.iter().copied()
    }
}

/// Renders as `code:count code:count ...`.
impl fmt::Display for ErrcodeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (code, count)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{code}:{count}")?;
        }
        Ok(())
    }
}

use crate::executor::FuzzSession;
use std::io::Write;
use tracing::{info, warn};

/// Source of process memory samples for growth reporting.
pub trait MemoryProbe {
    /// Current resident memory in bytes, or `None` if it cannot be measured.
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Reads resident pages from `/proc/self/statm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatmProbe;

impl MemoryProbe for ProcStatmProbe {
    fn resident_bytes(&mut self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * page_size())
    }
}

#[cfg(unix)]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    4096
}

#[derive(Debug, Clone, Copy)]
struct MemorySample {
    n_execs: u64,
    bytes: u64,
}

/// Writes session progress lines to an append-only text sink.
///
/// Each report is two lines:
///
/// ```text
/// n=8 success=5 fail=3 null=0
/// 22P02:2 42601:1
/// ```
///
/// followed by `mem_growth=<bytes> bytes_per_call=<bytes>` when a memory probe
/// is attached and resident memory grew since the previous report. Reporting
/// never fails the caller: sink errors are logged and dropped.
pub struct ProgressReporter<'a> {
    sink: Box<dyn Write + 'a>,
    probe: Option<Box<dyn MemoryProbe + 'a>>,
    last_sample: Option<MemorySample>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: Box<dyn Write + 'a>) -> Self {
        Self {
            sink,
            probe: None,
            last_sample: None,
        }
    }

    pub fn stderr() -> ProgressReporter<'static> {
        ProgressReporter::new(Box::new(std::io::stderr()))
    }

    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe + 'a>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn report(&mut self, session: &FuzzSession) {
        let counters = session.counters();
        info!(
            n_execs = counters.n_execs,
            n_success = counters.n_success,
            n_fail = counters.n_fail,
            n_null = counters.n_null,
            n_flagged = counters.n_flagged,
            errcodes = %session.histogram(),
            "fuzz progress"
        );

        let mut text = format!(
            "n={} success={} fail={} null={}\n{}\n",
            counters.n_execs,
            counters.n_success,
            counters.n_fail,
            counters.n_null,
            session.histogram()
        );
        if let Some(growth) = self.sample_growth(counters.n_execs) {
            text.push_str(&growth);
            text.push('\n');
        }

        if let Err(e) = self
            .sink
            .write_all(text.as_bytes())
            .and_then(|()| self.sink.flush())
        {
            warn!("failed to write progress report: {e}");
        }
    }

    fn sample_growth(&mut self, n_execs: u64) -> Option<String> {
        let bytes = self.probe.as_mut()?.resident_bytes()?;
        let current = MemorySample { n_execs, bytes };
        let previous = self.last_sample.replace(current)?;
        if current.bytes <= previous.bytes {
            return None;
        }
        let growth = current.bytes - previous.bytes;
        let calls = current.n_execs.saturating_sub(previous.n_execs).max(1);
        Some(format!(
            "mem_growth={growth} bytes_per_call={}",
            growth / calls
        ))
    }
}

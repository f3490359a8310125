use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const RLIM_INFINITY: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("getrlimit({resource}) failed: {source}")]
    Get {
        resource: Resource,
        #[source]
        source: std::io::Error,
    },
    #[error("setrlimit({resource}) failed: {source}")]
    Set {
        resource: Resource,
        #[source]
        source: std::io::Error,
    },
    #[error("resource limits are not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    CoreFileSize,
    DataSegment,
    CpuTime,
    AddressSpace,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::CoreFileSize => "core file size",
            Resource::DataSegment => "data seg size",
            Resource::CpuTime => "cpu time",
            Resource::AddressSpace => "max memory size",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub soft: u64,
    pub hard: u64,
}

struct LimitValue(u64);

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == RLIM_INFINITY {
            f.write_str("unlimited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Process-wide resource limit access. Swapped for a fake in tests.
pub trait Limiter {
    fn get(&self, resource: Resource) -> Result<Rlimit, GovernorError>;
    fn set(&mut self, resource: Resource, limit: Rlimit) -> Result<(), GovernorError>;
}

/// Desired execution ceilings for a fuzzing session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default)]
    pub core_dump_bytes: u64,
    #[serde(default = "default_data_bytes")]
    pub data_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_seconds: Option<u64>,
    #[serde(default)]
    pub address_space_bytes: Option<u64>,
    #[serde(default = "default_statement_deadline_ms")]
    pub statement_deadline_ms: u64,
    #[serde(default = "default_global_statement_timeout_ms")]
    pub global_statement_timeout_ms: u64,
}

fn default_data_bytes() -> Option<u64> {
    Some(200_000_000)
}

fn default_statement_deadline_ms() -> u64 {
    100
}

fn default_global_statement_timeout_ms() -> u64 {
    200
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            core_dump_bytes: 0,
            data_bytes: default_data_bytes(),
            cpu_seconds: None,
            address_space_bytes: None,
            statement_deadline_ms: default_statement_deadline_ms(),
            global_statement_timeout_ms: default_global_statement_timeout_ms(),
        }
    }
}

impl ResourceLimits {
    pub fn statement_deadline(&self) -> Duration {
        Duration::from_millis(self.statement_deadline_ms)
    }

    pub fn global_statement_timeout(&self) -> Duration {
        Duration::from_millis(self.global_statement_timeout_ms)
    }

    fn requests(&self) -> Vec<(Resource, u64)> {
        let mut requests = vec![(Resource::CoreFileSize, self.core_dump_bytes)];
        if let Some(bytes) = self.data_bytes {
            requests.push((Resource::DataSegment, bytes));
        }
        if let Some(secs) = self.cpu_seconds {
            requests.push((Resource::CpuTime, secs));
        }
        if let Some(bytes) = self.address_space_bytes {
            requests.push((Resource::AddressSpace, bytes));
        }
        requests
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedLimit {
    pub resource: Resource,
    pub previous: Rlimit,
    pub applied: Rlimit,
}

/// Applies `limits` through `limiter`.
///
/// The hard limit is never raised: both soft and hard are clamped to the
/// current hard limit. Any failure aborts the whole operation, since a session
/// must not run unbounded. Re-applying the same limits is harmless.
pub fn apply_limits(
    limits: &ResourceLimits,
    limiter: &mut dyn Limiter,
) -> Result<Vec<AppliedLimit>, GovernorError> {
    let mut applied = Vec::new();
    for (resource, desired) in limits.requests() {
        let previous = limiter.get(resource)?;
        let hard = desired.min(previous.hard);
        let new = Rlimit { soft: hard, hard };
        info!(
            "Setting {} to {} / {} (was {} / {})",
            resource,
            LimitValue(new.soft),
            LimitValue(new.hard),
            LimitValue(previous.soft),
            LimitValue(previous.hard)
        );
        limiter.set(resource, new)?;
        applied.push(AppliedLimit {
            resource,
            previous,
            applied: new,
        });
    }
    Ok(applied)
}

/// [`Limiter`] backed by `getrlimit(2)` / `setrlimit(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RlimitLimiter;

#[cfg(unix)]
macro_rules! with_raw_resource {
    ($resource:expr, $raw:ident => $body:expr) => {
        match $resource {
            Resource::CoreFileSize => {
                let $raw = libc::RLIMIT_CORE;
                $body
            }
            Resource::DataSegment => {
                let $raw = libc::RLIMIT_DATA;
                $body
            }
            Resource::CpuTime => {
                let $raw = libc::RLIMIT_CPU;
                $body
            }
            Resource::AddressSpace => {
                let $raw = libc::RLIMIT_AS;
                $body
            }
        }
    };
}

#[cfg(unix)]
impl Limiter for RlimitLimiter {
    fn get(&self, resource: Resource) -> Result<Rlimit, GovernorError> {
        let mut raw = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `raw` is a valid, writable rlimit for the duration of the call.
        let rc = with_raw_resource!(resource, r => unsafe { libc::getrlimit(r, &mut raw) });
        if rc != 0 {
            return Err(GovernorError::Get {
                resource,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Rlimit {
            soft: raw.rlim_cur as u64,
            hard: raw.rlim_max as u64,
        })
    }

    fn set(&mut self, resource: Resource, limit: Rlimit) -> Result<(), GovernorError> {
        let raw = libc::rlimit {
            rlim_cur: limit.soft as libc::rlim_t,
            rlim_max: limit.hard as libc::rlim_t,
        };
        // SAFETY: `raw` is a valid rlimit for the duration of the call.
        let rc = with_raw_resource!(resource, r => unsafe { libc::setrlimit(r, &raw) });
        if rc != 0 {
            return Err(GovernorError::Set {
                resource,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl Limiter for RlimitLimiter {
    fn get(&self, _resource: Resource) -> Result<Rlimit, GovernorError> {
        Err(GovernorError::Unsupported)
    }

    fn set(&mut self, _resource: Resource, _limit: Rlimit) -> Result<(), GovernorError> {
        Err(GovernorError::Unsupported)
    }
}

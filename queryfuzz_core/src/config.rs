use crate::executor::MAX_RUN_BUDGET;
use crate::governor::ResourceLimits;
use crate::oracle::EscalationPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default = "default_runs")]
    pub runs: u64,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default)]
    pub policy: EscalationPolicy,
}

pub fn default_runs() -> u64 {
    100_000
}

pub fn default_query() -> String {
    "select length($1)".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            runs: default_runs(),
            query: default_query(),
            policy: EscalationPolicy::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Database file; in-memory when unset.
    pub database: Option<PathBuf>,
    /// SQL run once before the session, outside any iteration.
    pub setup_sql: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    #[default]
    Random,
    Seeds,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SourceSettings {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_only_ascii")]
    pub only_ascii: bool,
    #[serde(default)]
    pub seed: u64,
    pub seed_dir: Option<PathBuf>,
}

pub fn default_max_len() -> usize {
    32
}

fn default_only_ascii() -> bool {
    true
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            max_len: default_max_len(),
            only_ascii: default_only_ascii(),
            seed: 0,
            seed_dir: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReportSettings {
    /// Append-only progress file; stderr when unset.
    pub sink: Option<PathBuf>,
    #[serde(default)]
    pub sample_memory: bool,
}

/// The `sweep` command: one session per built-in function argument.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SweepSettings {
    #[serde(default = "default_runs")]
    pub runs_per_query: u64,
    /// Functions never swept, usually because a single call can run for
    /// much longer than the statement deadline.
    #[serde(default = "default_sweep_skip")]
    pub skip: Vec<String>,
    /// SQL literals tried in the argument positions that are not fuzzed.
    #[serde(default = "default_dummy_args")]
    pub dummy_args: Vec<String>,
}

pub fn default_sweep_skip() -> Vec<String> {
    ["like", "glob", "zeroblob"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_dummy_args() -> Vec<String> {
    vec!["''".to_string(), "0".to_string()]
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            runs_per_query: default_runs(),
            skip: default_sweep_skip(),
            dummy_args: default_dummy_args(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct QueryFuzzConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub sweep: SweepSettings,
}

impl QueryFuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: QueryFuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        if config.session.runs > MAX_RUN_BUDGET {
            anyhow::bail!(
                "config file {:?}: runs = {} exceeds the maximum of {}",
                path,
                config.session.runs,
                MAX_RUN_BUDGET
            );
        }
        if config.sweep.runs_per_query > MAX_RUN_BUDGET {
            anyhow::bail!(
                "config file {:?}: sweep runs-per-query = {} exceeds the maximum of {}",
                path,
                config.sweep.runs_per_query,
                MAX_RUN_BUDGET
            );
        }
        if config.sweep.dummy_args.is_empty() {
            anyhow::bail!("config file {:?}: sweep dummy-args must not be empty", path);
        }
        if config.source.kind == SourceKind::Seeds && config.source.seed_dir.is_none() {
            anyhow::bail!("config file {:?}: source kind 'seeds' needs a seed-dir", path);
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, anyhow::Error> {
        Ok(toml::to_string_pretty(self)?)
    }
}

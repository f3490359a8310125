use queryfuzz_core::config::{QueryFuzzConfig, SourceKind};
use queryfuzz_core::driver::{FuzzDriver, force_fatal, in_fuzzer};
use queryfuzz_core::engine::CancelToken;
use queryfuzz_core::error::FuzzError;
use queryfuzz_core::governor::RlimitLimiter;
use queryfuzz_core::input::{InputSource, RandomBytesSource, SeedReplaySource};
use queryfuzz_core::logging::init_logging;
use queryfuzz_core::oracle::{BugReport, EscalationPolicy, EscalationReason};
use queryfuzz_core::reporter::ProcStatmProbe;
use queryfuzz_core::sqlite::SqliteEngine;
use queryfuzz_core::sweep::{FunctionSweep, SweepOutcome, SweepTarget, build_targets};

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a fuzzing session against the configured query.
    Fuzz {
        #[clap(short, long)]
        query: Option<String>,
        #[clap(short, long)]
        iterations: Option<u64>,
        #[clap(long, value_enum)]
        policy: Option<PolicyArg>,
        #[clap(long)]
        seed_dir: Option<PathBuf>,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(long)]
        max_len: Option<usize>,
        #[clap(long)]
        database: Option<PathBuf>,
    },
    /// Fuzz every argument position of the engine's built-in scalar functions,
    /// one session per query on a fresh engine.
    Sweep {
        #[clap(long)]
        runs_per_query: Option<u64>,
        /// Sweep only these functions.
        #[clap(long = "only")]
        only: Vec<String>,
        /// Skip these functions in addition to the configured skip list.
        #[clap(long = "skip")]
        skip: Vec<String>,
        #[clap(long, value_enum)]
        policy: Option<PolicyArg>,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(long)]
        max_len: Option<usize>,
    },
    /// Apply resource limits and the global statement timeout, then exit.
    CheckEnv,
    /// Report a fatal error unconditionally.
    ForceFatal { message: String },
    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PolicyArg {
    Strict,
    Permissive,
}

impl From<PolicyArg> for EscalationPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Strict => EscalationPolicy::Strict,
            PolicyArg::Permissive => EscalationPolicy::Permissive,
        }
    }
}

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_sigint(_signal: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
}

/// Routes Ctrl-C into the engine's cancel token, so the running statement is
/// interrupted and the session ends as an operator cancel.
fn install_cancel_handler(token: CancelToken) {
    if CANCEL.set(token).is_err() {
        return;
    }
    #[cfg(unix)]
    {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        // SAFETY: the handler only performs an atomic store.
        let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            warn!("could not install SIGINT handler");
        }
    }
}

/// A panic while a session is running must look like a crash to whoever
/// supervises this process.
fn install_abort_on_panic() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        if in_fuzzer() {
            eprintln!("panic inside a fuzzing session, aborting");
            std::process::abort();
        }
    }));
}

fn load_config(config_file: Option<PathBuf>) -> Result<QueryFuzzConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            QueryFuzzConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("queryfuzz.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                QueryFuzzConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and 'queryfuzz.toml' not found, using built-in defaults");
                Ok(QueryFuzzConfig::default())
            }
        }
    }
}

fn open_engine(
    config: &QueryFuzzConfig,
    cancel: &CancelToken,
) -> Result<SqliteEngine, queryfuzz_core::EngineError> {
    let engine = match &config.engine.database {
        Some(path) => SqliteEngine::open(path)?,
        None => SqliteEngine::open_in_memory()?,
    };
    let mut engine = engine.with_cancel_token(cancel.clone());
    if let Some(sql) = &config.engine.setup_sql {
        engine.execute_batch(sql)?;
    }
    Ok(engine)
}

fn input_source(config: &QueryFuzzConfig) -> Result<Box<dyn InputSource>, anyhow::Error> {
    let source = &config.source;
    match (source.kind, &source.seed_dir) {
        (SourceKind::Seeds, Some(dir)) => {
            let seeds = SeedReplaySource::from_dir(dir)
                .map_err(|e| anyhow::anyhow!("Failed to read seed directory {:?}: {}", dir, e))?;
            info!("Replaying {} seeds from {dir:?}", seeds.len());
            Ok(Box::new(seeds))
        }
        (SourceKind::Seeds, None) => anyhow::bail!("source kind 'seeds' needs a seed directory"),
        (SourceKind::Random, _) => Ok(Box::new(RandomBytesSource::new(
            source.seed,
            source.max_len,
            source.only_ascii,
        ))),
    }
}

/// First line printed for an escalated session. Only bug signals are
/// announced as bugs.
fn escalation_headline(reason: &EscalationReason, n_execs: u64) -> String {
    match reason {
        EscalationReason::BugSignal(_) => format!("!!! BUG FOUND (Execution {n_execs}) !!!"),
        EscalationReason::OperatorCancel => {
            format!("Session cancelled by operator (Execution {n_execs})")
        }
        EscalationReason::RepeatedErrorCode { count } => format!(
            "Session stopped (Execution {n_execs}): same error code {count} times in a row, \
             check the query and harness"
        ),
        EscalationReason::HarnessFailure(why) => {
            format!("Harness failure (Execution {n_execs}): {why}")
        }
        EscalationReason::Forced(message) => {
            format!("Fatal error requested (Execution {n_execs}): {message}")
        }
    }
}

fn print_escalation(report: &BugReport, n_execs: u64) {
    println!("\n{}", escalation_headline(&report.reason, n_execs));
    if let Some(input) = &report.input {
        println!("  Input: {:?}", String::from_utf8_lossy(input));
    }
    println!("  Description: {}", report.description);
    if let Some(hash) = &report.input_hash {
        println!("  Hash: {hash}");
    }
}

fn run_fuzz(config: QueryFuzzConfig) -> Result<(), anyhow::Error> {
    let cancel = CancelToken::new();
    install_cancel_handler(cancel.clone());
    let mut engine = open_engine(&config, &cancel)?;
    let mut limiter = RlimitLimiter;
    let mut source = input_source(&config)?;

    let mut driver = FuzzDriver::new(&mut engine, &mut limiter)
        .with_limits(config.limits.clone())
        .with_policy(config.session.policy);
    if let Some(path) = &config.report.sink {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open report sink {:?}: {}", path, e))?;
        driver = driver.with_report_sink(Box::new(file));
    }
    if config.report.sample_memory {
        driver = driver.with_memory_probe(Box::new(ProcStatmProbe));
    }

    match driver.start_fuzz(config.session.runs, &config.session.query, source.as_mut()) {
        Ok(stats) => {
            println!(
                "Total Executions: {}, Successes: {}, Failures: {}, Null inputs: {}, Flagged: {}",
                stats.n_execs, stats.n_success, stats.n_fail, stats.n_null, stats.n_flagged
            );
            Ok(())
        }
        Err(FuzzError::Escalated { report, stats }) => {
            print_escalation(&report, stats.n_execs);
            println!("  Error codes: {}", stats.histogram);
            Err(FuzzError::Escalated { report, stats }.into())
        }
        Err(e) => Err(e.into()),
    }
}

type SourceFactory = Box<dyn FnMut(&SweepTarget) -> Box<dyn InputSource>>;

/// Every sweep target replays the same inputs.
fn sweep_sources(config: &QueryFuzzConfig) -> Result<SourceFactory, anyhow::Error> {
    let source = config.source.clone();
    match (source.kind, &source.seed_dir) {
        (SourceKind::Seeds, Some(dir)) => {
            let seeds = SeedReplaySource::from_dir(dir)
                .map_err(|e| anyhow::anyhow!("Failed to read seed directory {:?}: {}", dir, e))?;
            info!("Replaying {} seeds per sweep target from {dir:?}", seeds.len());
            Ok(Box::new(move |_: &SweepTarget| -> Box<dyn InputSource> {
                Box::new(seeds.clone())
            }))
        }
        (SourceKind::Seeds, None) => anyhow::bail!("source kind 'seeds' needs a seed directory"),
        (SourceKind::Random, _) => Ok(Box::new(move |_: &SweepTarget| -> Box<dyn InputSource> {
            Box::new(RandomBytesSource::new(
                source.seed,
                source.max_len,
                source.only_ascii,
            ))
        })),
    }
}

fn sweep_sink(path: Option<&PathBuf>) -> Box<dyn Write> {
    let Some(path) = path else {
        return Box::new(std::io::stderr());
    };
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Box::new(file),
        Err(e) => {
            warn!("Failed to open report sink {path:?}: {e}, reporting to stderr");
            Box::new(std::io::stderr())
        }
    }
}

fn run_sweep(config: QueryFuzzConfig, only: &[String]) -> Result<(), anyhow::Error> {
    let cancel = CancelToken::new();
    install_cancel_handler(cancel.clone());

    let functions: Vec<_> = open_engine(&config, &cancel)?
        .scalar_functions()?
        .into_iter()
        .filter(|f| only.is_empty() || only.iter().any(|o| o.eq_ignore_ascii_case(&f.name)))
        .collect();
    let targets = build_targets(&functions, &config.sweep);
    info!(
        "Sweeping {} queries over {} functions, {} runs each",
        targets.len(),
        functions.len(),
        config.sweep.runs_per_query
    );

    if let Some(path) = &config.report.sink {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open report sink {:?}: {}", path, e))?;
    }
    let sources = sweep_sources(&config)?;
    let sink_path = config.report.sink.clone();
    let mut limiter = RlimitLimiter;
    let results = FunctionSweep::new(&mut limiter, config.sweep.runs_per_query)
        .with_limits(config.limits.clone())
        .with_policy(config.session.policy)
        .run(
            &targets,
            || open_engine(&config, &cancel),
            sources,
            |_| sweep_sink(sink_path.as_ref()),
        )?;

    let mut escalated = 0;
    let mut cancelled = false;
    for result in &results {
        match &result.outcome {
            SweepOutcome::Finished(stats) => println!(
                "{}: n={} success={} fail={} flagged={}",
                result.target.query, stats.n_execs, stats.n_success, stats.n_fail, stats.n_flagged
            ),
            SweepOutcome::Escalated { report, stats } => {
                println!("{}:", result.target.query);
                print_escalation(report, stats.n_execs);
                if let Some(error) = &report.error {
                    println!("  Error: {} {}", error.code, error.message);
                }
                match report.reason {
                    EscalationReason::OperatorCancel => cancelled = true,
                    _ => escalated += 1,
                }
            }
            SweepOutcome::Rejected(why) => println!("{}: rejected: {why}", result.target.query),
        }
    }
    println!(
        "Swept {} of {} queries, {} escalated",
        results.len(),
        targets.len(),
        escalated
    );
    if cancelled {
        anyhow::bail!("sweep cancelled by operator");
    }
    if escalated > 0 {
        anyhow::bail!("{escalated} of {} sweep queries escalated", results.len());
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    install_abort_on_panic();

    let mut config = load_config(cli.config_file)?;

    match cli.command {
        Command::Fuzz {
            query,
            iterations,
            policy,
            seed_dir,
            seed,
            max_len,
            database,
        } => {
            if let Some(query) = query {
                config.session.query = query;
            }
            if let Some(iterations) = iterations {
                config.session.runs = iterations;
            }
            if let Some(policy) = policy {
                config.session.policy = policy.into();
            }
            if let Some(dir) = seed_dir {
                config.source.kind = SourceKind::Seeds;
                config.source.seed_dir = Some(dir);
            }
            if let Some(seed) = seed {
                config.source.seed = seed;
            }
            if let Some(max_len) = max_len {
                config.source.max_len = max_len;
            }
            if let Some(database) = database {
                config.engine.database = Some(database);
            }
            info!("Effective configuration: {config:?}");
            let result = run_fuzz(config);
            if let Err(e) = &result {
                error!("{e:#}");
            }
            result
        }
        Command::Sweep {
            runs_per_query,
            only,
            skip,
            policy,
            seed,
            max_len,
        } => {
            if let Some(runs) = runs_per_query {
                config.sweep.runs_per_query = runs;
            }
            config.sweep.skip.extend(skip);
            if let Some(policy) = policy {
                config.session.policy = policy.into();
            }
            if let Some(seed) = seed {
                config.source.seed = seed;
            }
            if let Some(max_len) = max_len {
                config.source.max_len = max_len;
            }
            let result = run_sweep(config, &only);
            if let Err(e) = &result {
                error!("{e:#}");
            }
            result
        }
        Command::CheckEnv => {
            let mut engine = open_engine(&config, &CancelToken::new())?;
            let mut limiter = RlimitLimiter;
            FuzzDriver::new(&mut engine, &mut limiter)
                .with_limits(config.limits.clone())
                .configure_test_environment()?;
            println!("Test environment configured.");
            Ok(())
        }
        Command::ForceFatal { message } => Err(force_fatal(message).into()),
        Command::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

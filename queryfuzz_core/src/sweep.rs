//! Function sweep: one fuzzing session per argument position of every
//! built-in scalar function.
//!
//! Each target query passes the fuzz input in one argument position and a
//! fixed literal in every other. Every target gets a fresh engine so a
//! session never inherits state from the previous one, and an escalating
//! target is recorded before the sweep moves on.

use crate::config::SweepSettings;
use crate::driver::FuzzDriver;
use crate::engine::{Engine, EngineError};
use crate::error::FuzzError;
use crate::executor::SessionStats;
use crate::governor::{Limiter, ResourceLimits};
use crate::input::InputSource;
use crate::oracle::{BugReport, EscalationPolicy, EscalationReason};
use std::io::Write;
use tracing::{info, warn};

/// A function overload as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    pub arity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTarget {
    pub function: String,
    /// Zero-based argument position that receives the fuzz input.
    pub position: usize,
    pub query: String,
}

#[derive(Debug)]
pub enum SweepOutcome {
    Finished(SessionStats),
    Escalated {
        report: Box<BugReport>,
        stats: Box<SessionStats>,
    },
    /// The engine refused the target query, so no iteration ran.
    Rejected(String),
}

#[derive(Debug)]
pub struct SweepResult {
    pub target: SweepTarget,
    pub outcome: SweepOutcome,
}

impl SweepResult {
    pub fn is_escalation(&self) -> bool {
        matches!(self.outcome, SweepOutcome::Escalated { .. })
    }
}

/// Builds one query per argument position and filler combination.
///
/// Nullary functions and names on the skip list (case-insensitive) produce
/// no targets.
pub fn build_targets(functions: &[FunctionSignature], settings: &SweepSettings) -> Vec<SweepTarget> {
    let mut targets = Vec::new();
    for function in functions {
        if function.arity == 0
            || settings
                .skip
                .iter()
                .any(|skip| skip.eq_ignore_ascii_case(&function.name))
        {
            continue;
        }
        let name = quote_identifier(&function.name);
        for position in 0..function.arity {
            for mut args in filler_combinations(function.arity - 1, &settings.dummy_args) {
                args.insert(position, "$1");
                targets.push(SweepTarget {
                    function: function.name.clone(),
                    position,
                    query: format!("select {name}({})", args.join(", ")),
                });
            }
        }
    }
    targets
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn filler_combinations(slots: usize, dummies: &[String]) -> Vec<Vec<&str>> {
    let mut combinations: Vec<Vec<&str>> = vec![Vec::new()];
    for _ in 0..slots {
        combinations = combinations
            .into_iter()
            .flat_map(|prefix| {
                dummies.iter().map(move |dummy| {
                    let mut next = prefix.clone();
                    next.push(dummy.as_str());
                    next
                })
            })
            .collect();
    }
    combinations
}

/// Runs a [`FuzzDriver`] session for each target in turn.
pub struct FunctionSweep<'a> {
    limiter: &'a mut dyn Limiter,
    limits: ResourceLimits,
    policy: EscalationPolicy,
    runs_per_query: u64,
}

impl<'a> FunctionSweep<'a> {
    pub fn new(limiter: &'a mut dyn Limiter, runs_per_query: u64) -> Self {
        Self {
            limiter,
            limits: ResourceLimits::default(),
            policy: EscalationPolicy::default(),
            runs_per_query,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sweeps `targets` in order.
    ///
    /// # Arguments
    /// * `open_engine`: Opens a fresh engine for each target.
    /// * `source_for`: The input source for a target's session.
    /// * `sink_for`: Where a target's progress reports go.
    ///
    /// # Returns
    /// One `SweepResult` per target that was attempted. An operator cancel
    /// ends the sweep after recording the cancelled target. Failing to open
    /// an engine or to apply resource limits aborts the sweep with an error.
    pub fn run<E, O, S, W>(
        &mut self,
        targets: &[SweepTarget],
        mut open_engine: O,
        mut source_for: S,
        mut sink_for: W,
    ) -> Result<Vec<SweepResult>, FuzzError>
    where
        E: Engine,
        O: FnMut() -> Result<E, EngineError>,
        S: FnMut(&SweepTarget) -> Box<dyn InputSource>,
        W: FnMut(&SweepTarget) -> Box<dyn Write>,
    {
        let mut results = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            info!("sweep target {}/{}: {}", i + 1, targets.len(), target.query);
            let mut engine = open_engine()?;
            let mut source = source_for(target);
            let result = FuzzDriver::new(&mut engine, &mut *self.limiter)
                .with_limits(self.limits.clone())
                .with_policy(self.policy)
                .with_report_sink(sink_for(target))
                .start_fuzz(self.runs_per_query, &target.query, source.as_mut());

            let mut cancelled = false;
            let outcome = match result {
                Ok(stats) => SweepOutcome::Finished(stats),
                Err(FuzzError::Escalated { report, stats }) => {
                    cancelled = report.reason == EscalationReason::OperatorCancel;
                    SweepOutcome::Escalated { report, stats }
                }
                Err(FuzzError::Config(e)) => {
                    warn!("skipping {}: {e}", target.query);
                    SweepOutcome::Rejected(e.to_string())
                }
                Err(e) => return Err(e),
            };
            results.push(SweepResult {
                target: target.clone(),
                outcome,
            });
            if cancelled {
                warn!("sweep cancelled after {} of {} targets", i + 1, targets.len());
                break;
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Category;
    use crate::engine::SqlState;
    use crate::governor::tests::FakeLimiter;
    use crate::input::{RandomBytesSource, VecSource};
    use crate::sqlite::SqliteEngine;
    use crate::testing::ScriptedEngine;

    fn function(name: &str, arity: usize) -> FunctionSignature {
        FunctionSignature {
            name: name.to_string(),
            arity,
        }
    }

    fn settings(dummies: &[&str]) -> SweepSettings {
        SweepSettings {
            dummy_args: dummies.iter().map(|d| d.to_string()).collect(),
            ..SweepSettings::default()
        }
    }

    fn target(function: &str, query: &str) -> SweepTarget {
        SweepTarget {
            function: function.to_string(),
            position: 0,
            query: query.to_string(),
        }
    }

    fn inputs(items: &[&[u8]]) -> Box<dyn InputSource> {
        Box::new(VecSource::new(items.iter().map(|i| Some(i.to_vec()))))
    }

    #[test]
    fn every_position_gets_the_fuzz_input() {
        let targets = build_targets(&[function("substr", 3)], &settings(&["0"]));
        let queries: Vec<_> = targets.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(
            queries,
            vec![
                "select \"substr\"($1, 0, 0)",
                "select \"substr\"(0, $1, 0)",
                "select \"substr\"(0, 0, $1)",
            ]
        );
        assert_eq!(
            targets.iter().map(|t| t.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn fillers_cover_every_combination() {
        let targets = build_targets(&[function("instr", 2)], &settings(&["''", "0"]));
        let queries: Vec<_> = targets.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(
            queries,
            vec![
                "select \"instr\"($1, '')",
                "select \"instr\"($1, 0)",
                "select \"instr\"('', $1)",
                "select \"instr\"(0, $1)",
            ]
        );
    }

    #[test]
    fn skip_list_and_nullary_functions_are_left_out() {
        let functions = [function("abs", 1), function("LIKE", 2), function("pi", 0)];
        let targets = build_targets(&functions, &SweepSettings::default());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].function, "abs");
    }

    #[test]
    fn function_names_are_quoted() {
        let targets = build_targets(&[function("we\"ird", 1)], &settings(&["0"]));
        assert_eq!(targets[0].query, "select \"we\"\"ird\"($1)");
    }

    #[test]
    fn sweep_continues_past_rejections_and_escalations() {
        let targets = [
            target("upper", "select \"upper\"($1)"),
            target("broken", "selec $1"),
            target("lower", "select \"lower\"($1)"),
            target("abs", "select \"abs\"($1)"),
        ];
        let mut limiter = FakeLimiter::default();
        let mut opened = 0;
        let results = FunctionSweep::new(&mut limiter, 10)
            .run(
                &targets,
                || {
                    opened += 1;
                    let mut engine = ScriptedEngine::new();
                    engine.fail_when_input_starts_with(b"boom", SqlState::INTERNAL_ERROR, "cache lookup failed");
                    Ok(engine)
                },
                |t| {
                    if t.function == "lower" {
                        inputs(&[b"ok", b"boom", b"never"])
                    } else {
                        inputs(&[b"a", b"b"])
                    }
                },
                |_| Box::new(std::io::sink()),
            )
            .unwrap();

        assert_eq!(opened, 4);
        assert_eq!(results.len(), 4);
        assert!(matches!(&results[0].outcome, SweepOutcome::Finished(stats) if stats.n_success == 2));
        assert!(matches!(&results[1].outcome, SweepOutcome::Rejected(why) if why.contains("selec")));
        let SweepOutcome::Escalated { report, stats } = &results[2].outcome else {
            panic!("expected escalation, got {:?}", results[2].outcome);
        };
        assert_eq!(report.reason, EscalationReason::BugSignal(Category::InternalError));
        assert_eq!(stats.n_execs, 2);
        assert!(results[2].is_escalation());
        assert!(matches!(&results[3].outcome, SweepOutcome::Finished(_)));
    }

    #[test]
    fn operator_cancel_ends_the_sweep() {
        let targets = [
            target("upper", "select \"upper\"($1)"),
            target("lower", "select \"lower\"($1)"),
        ];
        let mut limiter = FakeLimiter::default();
        let results = FunctionSweep::new(&mut limiter, 10)
            .run(
                &targets,
                || {
                    let engine = ScriptedEngine::new();
                    engine.cancel.cancel();
                    Ok(engine)
                },
                |_| inputs(&[b"a"]),
                |_| Box::new(std::io::sink()),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        let SweepOutcome::Escalated { report, .. } = &results[0].outcome else {
            panic!("expected escalation, got {:?}", results[0].outcome);
        };
        assert_eq!(report.reason, EscalationReason::OperatorCancel);
    }

    #[test]
    fn engine_open_failure_aborts_the_sweep() {
        let targets = [target("upper", "select \"upper\"($1)")];
        let mut limiter = FakeLimiter::default();
        let result = FunctionSweep::new(&mut limiter, 10).run(
            &targets,
            || -> Result<ScriptedEngine, EngineError> {
                Err(EngineError::new(SqlState::INTERNAL_ERROR, "unable to open database"))
            },
            |_| inputs(&[b"a"]),
            |_| Box::new(std::io::sink()),
        );
        assert!(matches!(result, Err(FuzzError::Engine(_))));
    }

    #[test]
    fn sqlite_sweep_over_string_functions() {
        let functions: Vec<_> = SqliteEngine::open_in_memory()
            .unwrap()
            .scalar_functions()
            .unwrap()
            .into_iter()
            .filter(|f| ["length", "upper", "substr"].contains(&f.name.as_str()))
            .collect();
        let targets = build_targets(&functions, &settings(&["1"]));
        assert_eq!(targets.len(), 7);

        let mut limiter = FakeLimiter::default();
        let results = FunctionSweep::new(&mut limiter, 50)
            .run(
                &targets,
                SqliteEngine::open_in_memory,
                |_| Box::new(RandomBytesSource::new(3, 16, true)),
                |_| Box::new(std::io::sink()),
            )
            .unwrap();
        assert_eq!(results.len(), 7);
        for result in &results {
            let SweepOutcome::Finished(stats) = &result.outcome else {
                panic!("{} did not finish: {:?}", result.target.query, result.outcome);
            };
            assert_eq!(stats.n_execs, 50);
        }
    }
}

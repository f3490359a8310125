use crate::engine::{Engine, ParamType, PlanHandle};
use crate::error::ConfigError;
use tracing::debug;

/// The single compiled query a session fuzzes, plus its parameter shape.
///
/// Built once per session and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    text: String,
    plan: PlanHandle,
    param_type: ParamType,
}

impl PreparedStatement {
    pub const ARITY: usize = 1;

    /// Compiles `query_text` with one text parameter.
    ///
    /// Fails if the engine rejects the text or if the compiled statement does
    /// not reference exactly one parameter.
    pub fn prepare(engine: &mut dyn Engine, query_text: &str) -> Result<Self, ConfigError> {
        let param_type = ParamType::Text;
        let plan = engine
            .prepare(query_text, &[param_type])
            .map_err(|source| ConfigError::MalformedQuery {
                query: query_text.to_string(),
                source,
            })?;
        let arity = engine
            .parameter_count(plan)
            .map_err(|source| ConfigError::MalformedQuery {
                query: query_text.to_string(),
                source,
            })?;
        if arity != Self::ARITY {
            return Err(ConfigError::ParameterArity {
                query: query_text.to_string(),
                found: arity,
            });
        }
        debug!(query = query_text, ?plan, "prepared fuzz statement");
        Ok(Self {
            text: query_text.to_string(),
            plan,
            param_type,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn plan(&self) -> PlanHandle {
        self.plan
    }

    pub fn arity(&self) -> usize {
        Self::ARITY
    }

    pub fn param_type(&self) -> ParamType {
        self.param_type
    }
}

//! Policy evaluation engine seam
//!
//! The cache only needs two things from an engine: turn a named module plus a
//! query into a prepared handle, and evaluate that handle against a JSON
//! input. [`RegorusEngine`] provides both on top of the regorus Rego
//! interpreter.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Variable bindings produced by one result set
pub type Bindings = serde_json::Map<String, Value>;

/// Compiles policy modules into prepared queries
#[cfg_attr(test, mockall::automock)]
pub trait PolicyEngine: Send + Sync {
    /// Compile `source` (registered as `module`) and prepare `query` against it
    fn prepare(&self, query: &str, module: &str, source: &str) -> Result<Arc<dyn PreparedQuery>>;
}

/// A compiled query ready for evaluation
#[cfg_attr(test, mockall::automock)]
pub trait PreparedQuery: Send + Sync {
    /// Evaluate against `input`, returning zero or more result sets
    fn eval(&self, input: &Value) -> Result<Vec<Bindings>>;
}

/// Rego engine backed by regorus
///
/// Output of Rego `print()` calls is always captured. With print statements
/// enabled it is logged at debug level, otherwise it is discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegorusEngine {
    print_statements: bool,
}

impl RegorusEngine {
    /// Engine logging policy `print()` output when `print_statements` is set
    pub fn new(print_statements: bool) -> Self {
        Self { print_statements }
    }

    fn compile(&self, query: &str, module: &str, source: &str) -> Result<RegorusQuery> {
        let mut engine = regorus::Engine::new();
        engine.set_gather_prints(true);
        engine
            .add_policy(module.to_string(), source.to_string())
            .map_err(|e| Error::PolicyCompile {
                name: module.to_string(),
                reason: e.to_string(),
            })?;

        Ok(RegorusQuery {
            engine,
            module: module.to_string(),
            query: query.to_string(),
            print_statements: self.print_statements,
        })
    }
}

impl PolicyEngine for RegorusEngine {
    fn prepare(&self, query: &str, module: &str, source: &str) -> Result<Arc<dyn PreparedQuery>> {
        Ok(Arc::new(self.compile(query, module, source)?))
    }
}

struct RegorusQuery {
    engine: regorus::Engine,
    module: String,
    query: String,
    print_statements: bool,
}

impl RegorusQuery {
    /// Result sets plus the `print()` output of this evaluation
    fn eval_with_prints(&self, input: &Value) -> Result<(Vec<Bindings>, Vec<String>)> {
        // Evaluation mutates engine state, so each call works on its own copy.
        let mut engine = self.engine.clone();

        let input = regorus::Value::from_json_str(&input.to_string())
            .map_err(|e| Error::PolicyEval(format!("invalid input: {e}")))?;
        engine.set_input(input);

        let results = engine
            .eval_query(self.query.clone(), false)
            .map_err(|e| Error::PolicyEval(e.to_string()))?;
        let prints = engine
            .take_prints()
            .map_err(|e| Error::PolicyEval(format!("failed to collect prints: {e}")))?;

        let sets = results
            .result
            .iter()
            .map(|result| -> Result<Bindings> {
                match serde_json::to_value(&result.bindings)? {
                    Value::Object(bindings) => Ok(bindings),
                    _ => Ok(Bindings::new()),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let prints = if self.print_statements { prints } else { Vec::new() };
        Ok((sets, prints))
    }
}

impl PreparedQuery for RegorusQuery {
    fn eval(&self, input: &Value) -> Result<Vec<Bindings>> {
        let (sets, prints) = self.eval_with_prints(input)?;
        for line in prints {
            debug!(policy = %self.module, "{line}");
        }
        Ok(sets)
    }
}

//! Decision predicates: ordered rule evaluation over an instance's state.
//!
//! A predicate is a JEXL expression that may contain `{{path}}` references.
//! Each reference is replaced by `refs[i]` in the expression text and the
//! resolved value is bound at that index in the evaluation scope.

use serde_json::{Map, Value};
use talentflow_types::workflow::DecisionRule;

use super::expression::{ExpressionError, WorkflowEvaluator};
use super::resolver::{VariableResolver, placeholders};

/// A decision predicate that could not be evaluated.
#[derive(Debug, thiserror::Error)]
#[error("predicate #{index} `{predicate}` failed: {source}")]
pub struct ConditionError {
    pub index: usize,
    pub predicate: String,
    #[source]
    pub source: ExpressionError,
}

/// Evaluates decision rules against an instance's variables and context.
///
/// Holds no evaluator between calls, so it can live inside `Send` futures.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one predicate.
    pub fn evaluate(
        &self,
        predicate: &str,
        variables: &Map<String, Value>,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        evaluate_with(&WorkflowEvaluator::new(), predicate, variables, context)
    }

    /// Return the target of the first rule whose predicate holds, else `default`.
    ///
    /// `Ok(None)` means nothing matched and there is no default.
    pub fn choose<'r>(
        &self,
        rules: &'r [DecisionRule],
        default: Option<&'r str>,
        variables: &Map<String, Value>,
        context: &Value,
    ) -> Result<Option<&'r str>, ConditionError> {
        let evaluator = WorkflowEvaluator::new();
        for (index, rule) in rules.iter().enumerate() {
            let matched = evaluate_with(&evaluator, &rule.when, variables, context).map_err(
                |source| ConditionError {
                    index,
                    predicate: rule.when.clone(),
                    source,
                },
            )?;
            if matched {
                return Ok(Some(rule.next.as_str()));
            }
        }
        Ok(default)
    }
}

fn evaluate_with(
    evaluator: &WorkflowEvaluator,
    predicate: &str,
    variables: &Map<String, Value>,
    context: &Value,
) -> Result<bool, ExpressionError> {
    let resolver = VariableResolver::new(variables, context);
    let (expression, refs) = bind_references(predicate, &resolver);

    let mut scope = variables.clone();
    scope.insert("variables".to_string(), Value::Object(variables.clone()));
    scope.insert("context".to_string(), context.clone());
    scope.insert("refs".to_string(), Value::Array(refs));

    evaluator.evaluate_bool(&expression, &Value::Object(scope))
}

/// Replace each `{{path}}` with `refs[i]` and collect the bound values.
/// Unknown references bind to `null`.
fn bind_references(predicate: &str, resolver: &VariableResolver<'_>) -> (String, Vec<Value>) {
    let mut expression = String::with_capacity(predicate.len());
    let mut refs = Vec::new();
    let mut cursor = 0;
    for ph in placeholders(predicate) {
        expression.push_str(&predicate[cursor..ph.start]);
        expression.push_str(&format!("refs[{}]", refs.len()));
        refs.push(resolver.lookup(ph.path).cloned().unwrap_or(Value::Null));
        cursor = ph.end;
    }
    expression.push_str(&predicate[cursor..]);
    (expression, refs)
}

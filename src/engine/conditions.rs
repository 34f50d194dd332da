// Condition evaluator - guard checks against live entity and caller data

//! # Condition Evaluator
//!
//! Evaluates transition guards against an [`EvaluationContext`], the union of:
//! - the owning entity's persisted fields
//! - the instance's variables
//! - caller-supplied metadata
//!
//! Lookup precedence is metadata, then variables, then entity fields.
//!
//! ## Comparison rules
//!
//! - `eq` / `ne` compare string-normalized values. Numbers are rendered in a
//!   canonical form first, so `1`, `1.0` and `"1"` are all equal. The
//!   cross-type leniency is intentional.
//! - `gt` / `gte` / `lt` / `lte` need JSON numbers on both sides. Strings,
//!   booleans and nulls fail closed instead of raising an error.
//! - A field missing from every layer fails the condition.
//! - Script conditions and unknown kinds pass with a warning; there is no
//!   expression language.
//!
//! Evaluation is pure and never fails; the result is a [`ConditionOutcome`].

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{Condition, ConditionKind, Operator, Variables};

/// Data a condition is evaluated against
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationContext<'a> {
    pub entity: Option<&'a Map<String, Value>>,
    pub variables: Option<&'a Variables>,
    pub metadata: Option<&'a Variables>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(
        entity: Option<&'a Map<String, Value>>,
        variables: Option<&'a Variables>,
        metadata: Option<&'a Variables>,
    ) -> Self {
        Self {
            entity,
            variables,
            metadata,
        }
    }

    /// Resolve a field, caller metadata first
    pub fn lookup(&self, field: &str) -> Option<&'a Value> {
        self.metadata
            .and_then(|m| m.get(field))
            .or_else(|| self.variables.and_then(|v| v.get(field)))
            .or_else(|| self.entity.and_then(|e| e.get(field)))
    }
}

/// Result of evaluating one condition or a list of them
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub passed: bool,
    /// Failure reason; `None` when passed
    pub reason: Option<String>,
}

impl ConditionOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail<S: Into<String>>(reason: S) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Stateless guard evaluator shared by both runtimes
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a single condition
    pub fn evaluate(&self, condition: &Condition, context: &EvaluationContext<'_>) -> ConditionOutcome {
        match &condition.kind {
            ConditionKind::Field {
                field,
                operator,
                value,
            } => {
                let actual = match context.lookup(field) {
                    Some(actual) => actual,
                    None => {
                        debug!(field = %field, "Condition field missing from context");
                        return ConditionOutcome::fail(condition.failure_message());
                    }
                };
                if compare(actual, *operator, value) {
                    ConditionOutcome::pass()
                } else {
                    ConditionOutcome::fail(condition.failure_message())
                }
            }
            ConditionKind::Script { script } => {
                warn!(script = %script, "Script conditions are not evaluated; treating as passed");
                ConditionOutcome::pass()
            }
            ConditionKind::Unknown => {
                warn!(description = %condition.description, "Unknown condition kind; treating as passed");
                ConditionOutcome::pass()
            }
        }
    }

    /// AND all conditions in order; the first failure supplies the reason
    pub fn evaluate_all(&self, conditions: &[Condition], context: &EvaluationContext<'_>) -> ConditionOutcome {
        for condition in conditions {
            let outcome = self.evaluate(condition, context);
            if !outcome.passed {
                return outcome;
            }
        }
        ConditionOutcome::pass()
    }
}

fn compare(actual: &Value, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Eq => normalize(actual) == normalize(expected),
        Operator::Ne => normalize(actual) != normalize(expected),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) else {
                return false;
            };
            match operator {
                Operator::Gt => a > b,
                Operator::Gte => a >= b,
                Operator::Lt => a < b,
                _ => a <= b,
            }
        }
        Operator::Unknown => {
            warn!("Unknown condition operator; failing closed");
            false
        }
    }
}

/// String form used by `eq` / `ne`
fn normalize(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            Some(f) => format!("{}", f),
            None => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn progress_guard() -> Condition {
        Condition::field("progress", Operator::Gte, json!(1.0), "进度不足")
    }

    fn meta(key: &str, value: Value) -> Variables {
        let mut m = Variables::new();
        m.insert(key.to_string(), value);
        m
    }

    #[test]
    fn test_progress_threshold() {
        let evaluator = ConditionEvaluator::new();
        let condition = progress_guard();

        for (value, expected) in [
            (json!(1.0), true),
            (json!(1.5), true),
            (json!(1), true),
            (json!(0.99), false),
            (json!("complete"), false),
            (json!(true), false),
        ] {
            let m = meta("progress", value.clone());
            let ctx = EvaluationContext::new(None, None, Some(&m));
            let outcome = evaluator.evaluate(&condition, &ctx);
            assert_eq!(outcome.passed, expected, "progress = {}", value);
        }
    }

    #[test]
    fn test_failure_reason_is_description() {
        let evaluator = ConditionEvaluator::new();
        let m = meta("progress", json!(0.8));
        let ctx = EvaluationContext::new(None, None, Some(&m));
        let outcome = evaluator.evaluate(&progress_guard(), &ctx);
        assert_eq!(outcome.reason.as_deref(), Some("进度不足"));
    }

    #[test]
    fn test_missing_field_fails() {
        let evaluator = ConditionEvaluator::new();
        let ctx = EvaluationContext::default();
        assert!(!evaluator.evaluate(&progress_guard(), &ctx).passed);
    }

    #[test]
    fn test_string_normalized_equality() {
        let evaluator = ConditionEvaluator::new();
        let condition = Condition::field("qty", Operator::Eq, json!(1), "");
        for value in [json!(1), json!(1.0), json!("1")] {
            let m = meta("qty", value);
            let ctx = EvaluationContext::new(None, None, Some(&m));
            assert!(evaluator.evaluate(&condition, &ctx).passed);
        }

        let ne = Condition::field("channel", Operator::Ne, json!("web"), "");
        let m = meta("channel", json!("store"));
        let ctx = EvaluationContext::new(None, None, Some(&m));
        assert!(evaluator.evaluate(&ne, &ctx).passed);
    }

    #[test]
    fn test_metadata_overrides_variables_and_entity() {
        let mut entity = Map::new();
        entity.insert("amount".to_string(), json!(50));
        let variables = meta("amount", json!(80));
        let metadata = meta("amount", json!(200));

        let condition = Condition::field("amount", Operator::Gt, json!(100), "金额不足");
        let evaluator = ConditionEvaluator::new();

        let ctx = EvaluationContext::new(Some(&entity), Some(&variables), Some(&metadata));
        assert!(evaluator.evaluate(&condition, &ctx).passed);

        let ctx = EvaluationContext::new(Some(&entity), Some(&variables), None);
        assert!(!evaluator.evaluate(&condition, &ctx).passed);
        assert_eq!(ctx.lookup("amount"), Some(&json!(80)));
    }

    #[test]
    fn test_first_failure_wins_and_unknown_kinds_pass() {
        let evaluator = ConditionEvaluator::new();
        let conditions: Vec<Condition> = serde_json::from_value(json!([
            {"type": "script", "script": "order.ok()"},
            {"type": "field", "field": "a", "operator": "eq", "value": 1, "description": "a 不对"},
            {"type": "field", "field": "b", "operator": "eq", "value": 1, "description": "b 不对"},
            {"type": "something_new"}
        ]))
        .unwrap();

        let mut m = meta("a", json!(2));
        m.insert("b".to_string(), json!(2));
        let ctx = EvaluationContext::new(None, None, Some(&m));
        let outcome = evaluator.evaluate_all(&conditions, &ctx);
        assert_eq!(outcome, ConditionOutcome::fail("a 不对"));

        m.insert("a".to_string(), json!(1));
        m.insert("b".to_string(), json!("1"));
        let ctx = EvaluationContext::new(None, None, Some(&m));
        assert!(evaluator.evaluate_all(&conditions, &ctx).passed);
    }

    #[test]
    fn test_unknown_operator_fails_closed() {
        let condition: Condition = serde_json::from_value(json!({
            "type": "field", "field": "x", "operator": "between", "value": [1, 2]
        }))
        .unwrap();
        let m = meta("x", json!(1));
        let ctx = EvaluationContext::new(None, None, Some(&m));
        assert!(!ConditionEvaluator::new().evaluate(&condition, &ctx).passed);
    }
}

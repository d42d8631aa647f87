//! JEXL evaluation for transition rules and branch activation conditions.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered transforms and coerces
//! results to booleans using JavaScript-like truthiness, since conditions
//! are authored against JSON documents where "the field is present and
//! non-empty" is the common test.
//!
//! Context data is always passed as a context object, never interpolated
//! into the expression string.

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A condition failed to evaluate. Syntax errors mean the expression
/// itself is broken and can never match; callers fail the step. Evaluation
/// errors depend on the context document, so callers treat them as "rule
/// does not apply", recording the error in the transition trace.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("invalid condition expression: {0}")]
    Syntax(String),

    #[error("condition evaluation failed: {0}")]
    Evaluation(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms registered.
///
/// Used for:
/// - Transition rule conditions (e.g. `steps.check.output.score > 0.5`)
/// - Branch template activation (e.g. `currentItem.kind == 'image'`)
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Boolean transform
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            // Length transform (strings, arrays, objects)
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and coerce the result to a boolean.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ConditionError> {
        Ok(truthy(&self.evaluate_value(expression, context)?))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<Value, ConditionError> {
        if !context.is_object() {
            return Err(ConditionError::Evaluation(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| match &e {
                jexl_eval::error::EvaluationError::ParseError(_) => {
                    ConditionError::Syntax(e.to_string())
                }
                _ => ConditionError::Evaluation(e.to_string()),
            })
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// JavaScript-like truthiness.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new()
    }

    #[test]
    fn test_dot_notation_comparison() {
        let ctx = json!({"steps": {"check": {"output": {"score": 0.8}}}});
        let eval = evaluator();
        assert!(eval
            .evaluate_bool("steps.check.output.score > 0.5", &ctx)
            .unwrap());
        assert!(!eval
            .evaluate_bool("steps.check.output.score > 0.9", &ctx)
            .unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        let ctx = json!({"trigger": {"type": "order", "region": "eu"}});
        let eval = evaluator();
        assert!(eval
            .evaluate_bool(
                "trigger.type == 'order' && trigger.region == 'eu'",
                &ctx,
            )
            .unwrap());
        assert!(eval
            .evaluate_bool(
                "trigger.region == 'us' || trigger.region == 'eu'",
                &ctx,
            )
            .unwrap());
    }

    #[test]
    fn test_branch_activation_shape() {
        let ctx = json!({
            "currentItem": {"kind": "image", "bytes": 2048},
            "itemIndex": 3.0,
        });
        let eval = evaluator();
        assert!(eval
            .evaluate_bool("currentItem.kind == 'image'", &ctx)
            .unwrap());
        assert!(eval.evaluate_bool("itemIndex > 1", &ctx).unwrap());
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({"msg": "  Critical ERROR  ", "tags": ["a", "b"]});
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_value("msg|trim|lower", &ctx).unwrap(),
            json!("critical error")
        );
        assert!(eval
            .evaluate_bool("msg|contains('ERROR')", &ctx)
            .unwrap());
        assert!(eval.evaluate_bool("tags|length == 2", &ctx).unwrap());
        assert!(eval.evaluate_bool("(tags)|not", &ctx).is_ok());
    }

    #[test]
    fn test_missing_property_is_falsy() {
        let ctx = json!({"steps": {}});
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_value("steps.nonexistent", &ctx).unwrap(),
            json!(null)
        );
        assert!(!eval.evaluate_bool("steps.nonexistent", &ctx).unwrap());
    }

    #[test]
    fn test_truthiness_coercion() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("val", &json!({"val": "x"})).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({"val": ""})).unwrap());
        assert!(eval.evaluate_bool("val", &json!({"val": 42.0})).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({"val": 0.0})).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({"val": null})).unwrap());
    }

    #[test]
    fn test_malformed_expression_is_syntax_error() {
        let eval = evaluator();
        let err = eval
            .evaluate_bool("steps..output ===", &json!({"steps": {}}))
            .unwrap_err();
        assert!(matches!(err, ConditionError::Syntax(_)));
    }

    #[test]
    fn test_unknown_transform_is_evaluation_error() {
        let eval = evaluator();
        let err = eval
            .evaluate_bool("msg|nonexistent", &json!({"msg": "hi"}))
            .unwrap_err();
        assert!(matches!(err, ConditionError::Evaluation(_)));
    }

    #[test]
    fn test_non_object_context_is_error() {
        let eval = evaluator();
        let err = eval.evaluate_bool("true", &json!("scalar")).unwrap_err();
        assert!(matches!(err, ConditionError::Evaluation(_)));
    }
}

//! Expression evaluation capability
//!
//! The engine never interprets expressions itself; it only requires the
//! capability "evaluate this expression against this context". Production
//! deployments plug in a real expression language through the [`Evaluator`]
//! trait. [`SimpleEvaluator`] ships for tests and examples: dot-path lookups,
//! equality comparisons, `not`, and JSON literals.
//!
//! Expressions are delimited with `<% ... %>`. A string that is exactly one
//! delimited expression evaluates to the expression's value; a string with
//! embedded expressions evaluates to a string with each occurrence rendered.

use serde_json::Value;
use thiserror::Error;

/// Errors from expression evaluation
#[derive(Debug, Error)]
pub enum ExprError {
    /// The expression could not be parsed
    #[error("invalid expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    /// The expression failed against the given context
    #[error("failed to evaluate '{expr}': {reason}")]
    Evaluation { expr: String, reason: String },
}

impl ExprError {
    pub fn evaluation(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Evaluation {
            expr: expr.into(),
            reason: reason.into(),
        }
    }
}

/// Expression evaluation capability required by the engine
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluate a single expression (without delimiters) against a context
    fn evaluate(&self, expr: &str, context: &Value) -> Result<Value, ExprError>;

    /// Recursively evaluate all embedded expressions in a JSON structure
    ///
    /// Objects and arrays are walked; strings holding exactly one delimited
    /// expression are replaced by its value, strings with embedded
    /// expressions are rendered, everything else passes through unchanged.
    fn evaluate_recursively(&self, structure: &Value, context: &Value) -> Result<Value, ExprError> {
        match structure {
            Value::String(s) => self.evaluate_string(s, context),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.evaluate_recursively(item, context)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.evaluate_recursively(v, context)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a string that may contain delimited expressions
    fn evaluate_string(&self, s: &str, context: &Value) -> Result<Value, ExprError> {
        if let Some(expr) = single_expression(s) {
            return self.evaluate(expr, context);
        }

        if !s.contains("<%") {
            return Ok(Value::String(s.to_string()));
        }

        let mut rendered = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("<%") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("%>").ok_or_else(|| ExprError::Syntax {
                expr: s.to_string(),
                reason: "unterminated expression delimiter".to_string(),
            })?;
            let value = self.evaluate(after[..end].trim(), context)?;
            match value {
                Value::String(v) => rendered.push_str(&v),
                other => rendered.push_str(&other.to_string()),
            }
            rest = &after[end + 2..];
        }
        rendered.push_str(rest);
        Ok(Value::String(rendered))
    }
}

/// Returns the inner expression if the string is exactly one `<% ... %>` block
fn single_expression(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("<%")?.strip_suffix("%>")?;
    if inner.contains("<%") || inner.contains("%>") {
        return None;
    }
    Some(inner.trim())
}

/// JSON truthiness as the engine sees it for guard conditions
///
/// `null`, `false`, `0`, `""` and empty collections are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Deep-merge `src` into `dst`
///
/// Objects merge key-by-key with `src` winning on conflicts; every other
/// value type is replaced wholesale. This is the data-flow merge used for
/// task in-contexts and the workflow final context.
pub fn merge_contexts(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() => {
                        merge_contexts(existing, v)
                    }
                    _ => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, s) => *d = s.clone(),
    }
}

/// Minimal evaluator for tests and examples
///
/// Supports JSON literals (`null`, `true`, `42`, `'text'`), dot-paths with
/// index access (`task.result[0].id`), `not <expr>`, and `<a> == <b>` /
/// `<a> != <b>` comparisons. Anything else is a syntax error.
#[derive(Debug, Default, Clone)]
pub struct SimpleEvaluator;

impl SimpleEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn eval_operand(&self, operand: &str, context: &Value) -> Result<Value, ExprError> {
        let operand = operand.trim();

        if operand.is_empty() {
            return Err(ExprError::Syntax {
                expr: operand.to_string(),
                reason: "empty operand".to_string(),
            });
        }

        // Quoted string literal
        if (operand.starts_with('\'') && operand.ends_with('\'') && operand.len() >= 2)
            || (operand.starts_with('"') && operand.ends_with('"') && operand.len() >= 2)
        {
            return Ok(Value::String(operand[1..operand.len() - 1].to_string()));
        }

        // JSON literal (null, booleans, numbers)
        if let Ok(v) = serde_json::from_str::<Value>(operand) {
            if !v.is_string() {
                return Ok(v);
            }
        }

        // Dot-path lookup
        let mut current = context;
        for segment in operand.split('.') {
            let (name, indexes) = split_indexes(segment)?;
            if !name.is_empty() {
                current = current.get(name).unwrap_or(&Value::Null);
            }
            for idx in indexes {
                current = current.get(idx).unwrap_or(&Value::Null);
            }
        }
        Ok(current.clone())
    }
}

fn split_indexes(segment: &str) -> Result<(&str, Vec<usize>), ExprError> {
    match segment.find('[') {
        None => Ok((segment, vec![])),
        Some(pos) => {
            let name = &segment[..pos];
            let mut indexes = vec![];
            for part in segment[pos..].split('[').filter(|p| !p.is_empty()) {
                let digits = part.strip_suffix(']').ok_or_else(|| ExprError::Syntax {
                    expr: segment.to_string(),
                    reason: "unterminated index".to_string(),
                })?;
                indexes.push(digits.parse::<usize>().map_err(|_| ExprError::Syntax {
                    expr: segment.to_string(),
                    reason: "index is not a number".to_string(),
                })?);
            }
            Ok((name, indexes))
        }
    }
}

impl Evaluator for SimpleEvaluator {
    fn evaluate(&self, expr: &str, context: &Value) -> Result<Value, ExprError> {
        let expr = expr.trim();

        if let Some(rest) = expr.strip_prefix("not ") {
            let value = self.evaluate(rest, context)?;
            return Ok(Value::Bool(!is_truthy(&value)));
        }

        if let Some((lhs, rhs)) = expr.split_once("==") {
            if !rhs.starts_with('=') {
                let l = self.eval_operand(lhs, context)?;
                let r = self.eval_operand(rhs, context)?;
                return Ok(Value::Bool(l == r));
            }
        }

        if let Some((lhs, rhs)) = expr.split_once("!=") {
            let l = self.eval_operand(lhs, context)?;
            let r = self.eval_operand(rhs, context)?;
            return Ok(Value::Bool(l != r));
        }

        self.eval_operand(expr, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_lookup() {
        let ev = SimpleEvaluator::new();
        let ctx = json!({"a": {"b": [1, 2, 3]}});

        assert_eq!(ev.evaluate("a.b[1]", &ctx).unwrap(), json!(2));
        assert_eq!(ev.evaluate("a.missing", &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_literals_and_comparisons() {
        let ev = SimpleEvaluator::new();
        let ctx = json!({"status": "ok", "count": 3});

        assert_eq!(ev.evaluate("true", &ctx).unwrap(), json!(true));
        assert_eq!(ev.evaluate("status == 'ok'", &ctx).unwrap(), json!(true));
        assert_eq!(ev.evaluate("count != 3", &ctx).unwrap(), json!(false));
        assert_eq!(ev.evaluate("not count", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn test_recursive_evaluation() {
        let ev = SimpleEvaluator::new();
        let ctx = json!({"name": "alpha", "n": 7});
        let structure = json!({
            "plain": "text",
            "value": "<% n %>",
            "rendered": "item-<% name %>",
            "nested": ["<% name %>", {"x": "<% n %>"}]
        });

        let result = ev.evaluate_recursively(&structure, &ctx).unwrap();
        assert_eq!(
            result,
            json!({
                "plain": "text",
                "value": 7,
                "rendered": "item-alpha",
                "nested": ["alpha", {"x": 7}]
            })
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!({"k": 1})));
    }

    #[test]
    fn test_merge_contexts() {
        let mut dst = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let src = json!({"b": 2, "nested": {"y": 3, "z": 4}});

        merge_contexts(&mut dst, &src);
        assert_eq!(
            dst,
            json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3, "z": 4}})
        );
    }
}

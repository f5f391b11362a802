//! Condition and template evaluation.
//!
//! `ConditionEvaluator` is the narrow interface the engine uses for `when`,
//! `until`, and `precondition` expressions and for `{{ expr }}` templates.
//! `JexlEvaluator` implements it on top of `jexl_eval::Evaluator` with a set
//! of string and numeric transforms.
//!
//! Values are always passed as the evaluation context, never interpolated
//! into expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("unterminated template expression in '{0}'")]
    UnterminatedTemplate(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Evaluates conditions and renders templates against a JSON environment.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate an expression to its raw JSON value.
    fn evaluate_value(&self, expression: &str, env: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate an expression and coerce the result with JavaScript-like truthiness.
    fn evaluate_bool(&self, expression: &str, env: &Value) -> Result<bool, ExpressionError> {
        let value = self.evaluate_value(expression, env)?;
        Ok(value_to_bool(&value))
    }

    /// Replace every `{{ expr }}` in `template` with the rendered value.
    fn render(&self, template: &str, env: &Value) -> Result<String, ExpressionError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(ExpressionError::UnterminatedTemplate(template.to_string()));
            };
            let value = self.evaluate_value(after[..end].trim(), env)?;
            out.push_str(&value_to_string(&value));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Render a template, keeping the JSON type when the whole template is a
    /// single `{{ expr }}`.
    fn render_value(&self, template: &str, env: &Value) -> Result<Value, ExpressionError> {
        let trimmed = template.trim();
        if let Some(inner) = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
        {
            if !inner.contains("{{") && !inner.contains("}}") {
                return self.evaluate_value(inner.trim(), env);
            }
        }
        Ok(Value::String(self.render(template, env)?))
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Convert a JSON value to display text for template output.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms registered.
///
/// Transforms: `lower`, `upper`, `trim`, `split`, `lines`, `not`, `contains`,
/// `startsWith`, `endsWith`, `length`, `number`, `json`.
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
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
            .with_transform("lines", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let lines: Vec<&str> = s
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                Ok(json!(lines))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let search = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match args.first() {
                    Some(Value::String(s)) => search.as_str().is_some_and(|needle| s.contains(needle)),
                    Some(Value::Array(items)) => items.contains(&search),
                    _ => false,
                };
                Ok(json!(found))
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
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            // Parse captured text such as "93%" or " 12 " into a number
            .with_transform("number", |args: &[Value]| {
                let parsed = match args.first() {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::String(s)) => s
                        .trim()
                        .trim_end_matches('%')
                        .parse::<f64>()
                        .ok(),
                    Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
                    _ => None,
                };
                Ok(parsed.map(|f| json!(f)).unwrap_or(Value::Null))
            })
            .with_transform("json", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("null");
                Ok(serde_json::from_str(s).unwrap_or(Value::Null))
            });

        Self { evaluator }
    }
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator for JexlEvaluator {
    fn evaluate_value(&self, expression: &str, env: &Value) -> Result<Value, ExpressionError> {
        if !env.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, env)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

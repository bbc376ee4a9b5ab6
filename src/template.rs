//! Single-pass template renderer
//!
//! Templates use `{{ … }}` delimiters around dotted paths into a JSON
//! evaluation context (`{{ workflow.input.city }}`, `{{ tasks.fetch.output }}`).
//! Tokenization and resolution happen in one pass; there is no grammar beyond
//! path access, and re-rendering the same template against the same context
//! is deterministic.
//!
//! Missing keys render to the `<no value>` sentinel rather than erroring,
//! matching how downstream transforms probe optional fields.

use std::collections::HashSet;
use std::ops::Range;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::util::jsonpath;

/// Rendered placeholder for paths that resolve to nothing
pub const NO_VALUE: &str = "<no value>";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum TemplateError {
    /// `{{` without a matching `}}`
    #[error("unterminated expression starting at byte {offset} in template")]
    Unterminated { offset: usize },

    /// The expression between the delimiters is empty or malformed
    #[error("invalid template expression: {expr:?}")]
    BadExpression { expr: String },
}

// ============================================================================
// TOKENIZATION
// ============================================================================

/// A parsed template fragment
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Literal text (byte range into the original string)
    Literal(Range<usize>),
    /// `{{ path }}` expression
    Expr(String),
}

/// Tokenize a template into literals and expressions (single pass)
fn tokenize(template: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let bytes = template.as_bytes();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if i > literal_start {
                tokens.push(Token::Literal(literal_start..i));
            }
            let expr_start = i + 2;
            let close = template[expr_start..]
                .find("}}")
                .ok_or(TemplateError::Unterminated { offset: i })?;
            let raw = &template[expr_start..expr_start + close];
            let expr = raw.trim();
            if expr.is_empty() {
                return Err(TemplateError::BadExpression {
                    expr: raw.to_string(),
                });
            }
            tokens.push(Token::Expr(expr.to_string()));
            i = expr_start + close + 2;
            literal_start = i;
        } else {
            i += 1;
        }
    }

    if literal_start < template.len() {
        tokens.push(Token::Literal(literal_start..template.len()));
    }

    Ok(tokens)
}

/// Whether a string contains any `{{ … }}` expression
pub fn is_templated(s: &str) -> bool {
    s.contains("{{")
}

// ============================================================================
// RENDERING
// ============================================================================

fn lookup(context: &Value, path: &str) -> Option<Value> {
    jsonpath::resolve(context, path).ok().flatten()
}

fn value_to_fragment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => NO_VALUE.to_string(),
        other => other.to_string(),
    }
}

/// Render a template to a string against the given context
///
/// Every expression is resolved as a dotted path; unresolved paths become
/// [`NO_VALUE`].
pub fn render_string(template: &str, context: &Value) -> Result<String, TemplateError> {
    let tokens = tokenize(template)?;

    let mut result = String::with_capacity(template.len());
    for token in &tokens {
        match token {
            Token::Literal(range) => result.push_str(&template[range.clone()]),
            Token::Expr(path) => match lookup(context, path) {
                Some(value) => result.push_str(&value_to_fragment(&value)),
                None => result.push_str(NO_VALUE),
            },
        }
    }

    Ok(result)
}

/// Render a template preserving JSON structure where possible
///
/// A template that is exactly one expression (`"{{ workflow.input.list }}"`)
/// yields the resolved `Value` itself, so arrays and maps survive the round
/// trip. Anything else renders to a string.
pub fn render_value(template: &str, context: &Value) -> Result<Value, TemplateError> {
    let tokens = tokenize(template)?;

    // Whole-template expression: hand back the structured value
    if let [Token::Expr(path)] = tokens.as_slice() {
        return Ok(lookup(context, path).unwrap_or(Value::Null));
    }

    render_string(template, context).map(Value::String)
}

/// Recursively render every string inside a JSON value
///
/// Maps and arrays are walked; scalars pass through untouched.
pub fn parse_map(value: &Value, context: &Value) -> Result<Value, TemplateError> {
    parse_map_inner(value, context, None)
}

/// Like [`parse_map`] but leaving `exclude_keys` (top-level) unrendered
///
/// The collection driver uses this to defer `outputs` rendering until after
/// the child has executed.
pub fn parse_map_with_filter(
    value: &Value,
    context: &Value,
    exclude_keys: &[&str],
) -> Result<Value, TemplateError> {
    let excluded: HashSet<&str> = exclude_keys.iter().copied().collect();
    parse_map_inner(value, context, Some(&excluded))
}

fn parse_map_inner(
    value: &Value,
    context: &Value,
    exclude_top: Option<&HashSet<&str>>,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => {
            if is_templated(s) {
                render_value(s, context)
            } else {
                Ok(value.clone())
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(parse_map_inner(item, context, None)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                let rendered = match exclude_top {
                    Some(excluded) if excluded.contains(key.as_str()) => item.clone(),
                    _ => parse_map_inner(item, context, None)?,
                };
                out.insert(key.clone(), rendered);
            }
            Ok(Value::Object(out))
        }
        scalar => Ok(scalar.clone()),
    }
}

// ============================================================================
// TRUTHINESS
// ============================================================================

/// Explicit truthiness over JSON values
///
/// `null`, `false`, `0`, `0.0`, `""`, `[]`, and `{}` are false;
/// everything else is true. No reflection, no coercion surprises.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i != 0
            } else if let Some(u) = n.as_u64() {
                u != 0
            } else {
                n.as_f64().is_some_and(|f| f != 0.0)
            }
        }
        Value::String(s) => !s.is_empty() && s != "false" && s != NO_VALUE,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "workflow": {
                "id": "wf-1",
                "input": {"city": "Paris", "list": ["a", "b", "c"]}
            },
            "tasks": {
                "fetch": {"output": {"temp": 21}}
            },
            "item": "b",
            "index": 1
        })
    }

    #[test]
    fn literal_passes_through() {
        assert_eq!(render_string("plain text", &ctx()).unwrap(), "plain text");
    }

    #[test]
    fn renders_dotted_path() {
        assert_eq!(
            render_string("Weather in {{ workflow.input.city }}", &ctx()).unwrap(),
            "Weather in Paris"
        );
    }

    #[test]
    fn missing_path_renders_sentinel() {
        assert_eq!(
            render_string("{{ workflow.input.country }}", &ctx()).unwrap(),
            NO_VALUE
        );
    }

    #[test]
    fn unterminated_expression_errors() {
        let err = render_string("oops {{ item", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated { .. }));
    }

    #[test]
    fn empty_expression_errors() {
        assert!(render_string("{{   }}", &ctx()).is_err());
    }

    #[test]
    fn whole_expression_preserves_structure() {
        let value = render_value("{{ workflow.input.list }}", &ctx()).unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
    }

    #[test]
    fn mixed_template_renders_string() {
        let value = render_value("city={{ workflow.input.city }}", &ctx()).unwrap();
        assert_eq!(value, json!("city=Paris"));
    }

    #[test]
    fn non_string_fragment_serializes() {
        assert_eq!(
            render_string("temp: {{ tasks.fetch.output.temp }}", &ctx()).unwrap(),
            "temp: 21"
        );
    }

    #[test]
    fn parse_map_renders_recursively() {
        let input = json!({
            "greeting": "Hello from {{ workflow.input.city }}",
            "nested": {"item": "{{ item }}"},
            "list": ["{{ index }}", "literal"],
            "count": 3
        });
        let out = parse_map(&input, &ctx()).unwrap();
        assert_eq!(out["greeting"], "Hello from Paris");
        assert_eq!(out["nested"]["item"], "b");
        assert_eq!(out["list"][0], 1);
        assert_eq!(out["list"][1], "literal");
        assert_eq!(out["count"], 3);
    }

    #[test]
    fn parse_map_with_filter_skips_excluded_keys() {
        let input = json!({
            "with": {"city": "{{ workflow.input.city }}"},
            "outputs": {"msg": "{{ tasks.fetch.output.temp }}"}
        });
        let out = parse_map_with_filter(&input, &ctx(), &["outputs"]).unwrap();
        assert_eq!(out["with"]["city"], "Paris");
        // excluded key keeps its raw template for post-execution rendering
        assert_eq!(out["outputs"]["msg"], "{{ tasks.fetch.output.temp }}");
    }

    #[test]
    fn truthiness_rules() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([0])));
    }

    #[test]
    fn no_value_string_is_falsy() {
        assert!(!is_truthy(&json!(NO_VALUE)));
        assert!(!is_truthy(&json!("false")));
    }

    #[test]
    fn rendering_is_deterministic() {
        let context = ctx();
        let a = render_string("{{ tasks.fetch.output.temp }}/{{ item }}", &context).unwrap();
        let b = render_string("{{ tasks.fetch.output.temp }}/{{ item }}", &context).unwrap();
        assert_eq!(a, b);
    }
}

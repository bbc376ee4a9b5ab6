//! Minimal path resolution over JSON values
//!
//! Supports:
//! - `a.b.c` (dot notation)
//! - `a[0].b` (array index)
//! - `items.0` (numeric dot segment as index)
//!
//! Does NOT support filters, wildcards, or slices. Paths here come from
//! template expressions and wait-task conditions, which only ever need
//! field and index access.

use serde_json::Value;
use thiserror::Error;

/// A parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object field access: `.field`
    Field(String),
    /// Array index access: `[0]`
    Index(usize),
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unsupported path syntax: {path}")]
    Unsupported { path: String },
}

/// Parse a path string into segments
///
/// Examples:
/// - `"signal.payload.approved"` → `[Field(signal), Field(payload), Field(approved)]`
/// - `"items[2].name"` → `[Field(items), Index(2), Field(name)]`
pub fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    let path = path.trim();
    if path.is_empty() {
        return Ok(vec![]);
    }

    let unsupported = || PathError::Unsupported {
        path: path.to_string(),
    };

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(unsupported());
        }

        match part.find('[') {
            Some(bracket) => {
                let field = &part[..bracket];
                if !field.is_empty() {
                    segments.push(Segment::Field(field.to_string()));
                }
                // Possibly chained indices: a[0][1]
                let mut rest = &part[bracket..];
                while let Some(stripped) = rest.strip_prefix('[') {
                    let close = stripped.find(']').ok_or_else(unsupported)?;
                    let index: usize = stripped[..close].parse().map_err(|_| unsupported())?;
                    segments.push(Segment::Index(index));
                    rest = &stripped[close + 1..];
                }
                if !rest.is_empty() {
                    return Err(unsupported());
                }
            }
            None => {
                if let Ok(index) = part.parse::<usize>() {
                    segments.push(Segment::Index(index));
                } else {
                    segments.push(Segment::Field(part.to_string()));
                }
            }
        }
    }

    Ok(segments)
}

/// Walk segments down a JSON value, returning a reference
pub fn walk<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match segment {
            Segment::Field(name) => current.get(name)?,
            Segment::Index(idx) => current.get(*idx)?,
        };
    }
    Some(current)
}

/// Parse and resolve in one step (clones once at the end)
pub fn resolve(value: &Value, path: &str) -> Result<Option<Value>, PathError> {
    let segments = parse(path)?;
    Ok(walk(value, &segments).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_dot_path() {
        let segments = parse("signal.payload.approved").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("signal".into()),
                Segment::Field("payload".into()),
                Segment::Field("approved".into()),
            ]
        );
    }

    #[test]
    fn parse_bracket_index() {
        let segments = parse("items[2].name").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("items".into()),
                Segment::Index(2),
                Segment::Field("name".into()),
            ]
        );
    }

    #[test]
    fn parse_chained_indices() {
        let segments = parse("grid[1][0]").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Field("grid".into()),
                Segment::Index(1),
                Segment::Index(0),
            ]
        );
    }

    #[test]
    fn parse_numeric_dot_segment() {
        let segments = parse("items.0").unwrap();
        assert_eq!(
            segments,
            vec![Segment::Field("items".into()), Segment::Index(0)]
        );
    }

    #[test]
    fn parse_rejects_double_dots() {
        assert!(parse("a..b").is_err());
    }

    #[test]
    fn resolve_nested() {
        let value = json!({"signal": {"payload": {"approved": true}}});
        assert_eq!(
            resolve(&value, "signal.payload.approved").unwrap(),
            Some(json!(true))
        );
    }

    #[test]
    fn resolve_array() {
        let value = json!({"users": [{"name": "Ada"}, {"name": "Grace"}]});
        assert_eq!(
            resolve(&value, "users[1].name").unwrap(),
            Some(json!("Grace"))
        );
    }

    #[test]
    fn resolve_missing_is_none() {
        let value = json!({"a": 1});
        assert_eq!(resolve(&value, "a.b.c").unwrap(), None);
        assert_eq!(resolve(&value, "missing").unwrap(), None);
    }

    #[test]
    fn empty_path_resolves_root() {
        let value = json!({"a": 1});
        assert_eq!(resolve(&value, "").unwrap(), Some(value.clone()));
    }
}

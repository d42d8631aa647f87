//! Path expression parsing.
//!
//! Paths address values inside a context document. Dot and bracket notation
//! are equivalent: `steps.fetch.output`, `steps["fetch"].output` and
//! `$.steps.fetch.output` all name the same location, and a bare `$` names
//! the whole document. Beyond plain keys and indexes there are wildcards
//! (`items[*]`, `items.*`), recursive descent (`..status`), filters
//! (`items[?(@.price > 10)]`, or bare `items[?(@.price)]` to test that the
//! field is present) and dynamic segments (`results[$.cfg.index]`)
//! whose bracketed sub-path is resolved against the root document first and
//! substituted as a literal key or index.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// Plain object key.
    Key(String),
    /// Array index.
    Index(usize),
    /// `[*]` / `.*`: every element of an array, every value of an object.
    Wildcard,
    /// `..key`: every value stored under `key`, at any depth.
    Descent(String),
    /// `[?(@.path op literal)]`: keep the array elements matching the
    /// predicate.
    Filter(FilterExpr),
    /// `[$.sub.path]`: the sub-path is resolved first, then substituted.
    Dynamic(String),
}

impl PathSegment {
    /// Segments that force one-shot evaluation of the whole path.
    pub fn is_complex(&self) -> bool {
        matches!(
            self,
            PathSegment::Wildcard | PathSegment::Descent(_) | PathSegment::Filter(_)
        )
    }
}

/// Predicate of a filter segment: `@.path op literal`, or a bare `@.path`
/// existence test. An empty path tests the candidate element itself.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    pub path: Vec<PathSegment>,
    pub test: FilterTest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterTest {
    /// Bare `@.path`: matches when the value is present and non-null.
    Exists,
    Compare { op: FilterOp, literal: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Parse a comparison operator token. Used by the filter parser and by the
/// template engine's `compare` helper.
pub(crate) fn parse_op(token: &str) -> Option<FilterOp> {
    match token {
        "==" => Some(FilterOp::Eq),
        "!=" => Some(FilterOp::Ne),
        ">=" => Some(FilterOp::Ge),
        "<=" => Some(FilterOp::Le),
        ">" => Some(FilterOp::Gt),
        "<" => Some(FilterOp::Lt),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("empty key at offset {0}")]
    EmptyKey(usize),

    #[error("unterminated bracket")]
    UnterminatedBracket,

    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("recursive descent requires a named key")]
    DescentMissingKey,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a path expression into segments.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, PathError> {
    let chars: Vec<char> = path.trim().chars().collect();
    if chars.is_empty() {
        return Err(PathError::Empty);
    }

    let mut i = 0usize;
    if chars[0] == '$' {
        i = 1;
    }

    let mut segments = Vec::new();
    while i < chars.len() {
        match chars[i] {
            '.' => {
                if i + 1 < chars.len() && chars[i + 1] == '.' {
                    i += 2;
                    let key = read_bare_key(&chars, &mut i);
                    if key.is_empty() || key == "*" {
                        return Err(PathError::DescentMissingKey);
                    }
                    segments.push(PathSegment::Descent(key));
                } else {
                    i += 1;
                    if i < chars.len() && chars[i] == '*' {
                        segments.push(PathSegment::Wildcard);
                        i += 1;
                    } else {
                        let at = i;
                        let key = read_bare_key(&chars, &mut i);
                        if key.is_empty() {
                            return Err(PathError::EmptyKey(at));
                        }
                        segments.push(PathSegment::Key(key));
                    }
                }
            }
            '[' => {
                i += 1;
                if i >= chars.len() {
                    return Err(PathError::UnterminatedBracket);
                }
                match chars[i] {
                    '\'' | '"' => {
                        let quote = chars[i];
                        i += 1;
                        let start = i;
                        while i < chars.len() && chars[i] != quote {
                            i += 1;
                        }
                        if i >= chars.len() {
                            return Err(PathError::UnterminatedQuote);
                        }
                        let key: String = chars[start..i].iter().collect();
                        i += 1;
                        if i >= chars.len() || chars[i] != ']' {
                            return Err(PathError::UnterminatedBracket);
                        }
                        i += 1;
                        segments.push(PathSegment::Key(key));
                    }
                    '?' => {
                        let body = scan_bracket_body(&chars, &mut i)?;
                        segments.push(PathSegment::Filter(parse_filter(&body)?));
                    }
                    '$' => {
                        let body = scan_bracket_body(&chars, &mut i)?;
                        segments.push(PathSegment::Dynamic(body.trim().to_string()));
                    }
                    _ => {
                        let body = scan_bracket_body(&chars, &mut i)?;
                        let token = body.trim();
                        if token == "*" {
                            segments.push(PathSegment::Wildcard);
                        } else if token.is_empty() {
                            return Err(PathError::EmptyKey(i));
                        } else if let Ok(index) = token.parse::<usize>() {
                            segments.push(PathSegment::Index(index));
                        } else {
                            // lenient: `a[b]` is an unquoted key lookup
                            segments.push(PathSegment::Key(token.to_string()));
                        }
                    }
                }
            }
            _ => {
                let at = i;
                let key = read_bare_key(&chars, &mut i);
                if key.is_empty() {
                    return Err(PathError::EmptyKey(at));
                }
                if key == "*" {
                    segments.push(PathSegment::Wildcard);
                } else {
                    segments.push(PathSegment::Key(key));
                }
            }
        }
    }

    Ok(segments)
}

fn read_bare_key(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && !matches!(chars[*i], '.' | '[') {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

/// Scan the body of a bracket expression, quote-aware and nesting-aware.
/// `i` must point at the first char after `[`; on success it points past
/// the matching `]`.
fn scan_bracket_body(chars: &[char], i: &mut usize) -> Result<String, PathError> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let start = *i;
    while *i < chars.len() {
        let c = chars[*i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else {
            match c {
                '\'' | '"' => quote = Some(c),
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        let body: String = chars[start..*i].iter().collect();
                        *i += 1;
                        return Ok(body);
                    }
                }
                _ => {}
            }
        }
        *i += 1;
    }
    Err(PathError::UnterminatedBracket)
}

// ---------------------------------------------------------------------------
// Filter parsing
// ---------------------------------------------------------------------------

fn parse_filter(body: &str) -> Result<FilterExpr, PathError> {
    let inner = body
        .trim()
        .strip_prefix('?')
        .map(str::trim)
        .and_then(|b| b.strip_prefix('('))
        .and_then(|b| b.trim_end().strip_suffix(')'))
        .ok_or_else(|| PathError::InvalidFilter(format!("expected ?(...), got [{body}]")))?
        .trim();

    let rest = inner
        .strip_prefix('@')
        .ok_or_else(|| PathError::InvalidFilter("predicate must start with @".to_string()))?;

    let (path_part, test) = match split_predicate(rest)? {
        Some((path_part, op, literal_part)) => (
            path_part,
            FilterTest::Compare {
                op,
                literal: parse_literal(literal_part)?,
            },
        ),
        None => (rest.trim(), FilterTest::Exists),
    };
    let path = if path_part.is_empty() {
        Vec::new()
    } else {
        let segments = parse_path(path_part)
            .map_err(|e| PathError::InvalidFilter(format!("bad predicate path: {e}")))?;
        if segments
            .iter()
            .any(|s| !matches!(s, PathSegment::Key(_) | PathSegment::Index(_)))
        {
            return Err(PathError::InvalidFilter(
                "predicate path must be plain keys and indexes".to_string(),
            ));
        }
        segments
    };

    Ok(FilterExpr { path, test })
}

/// Split `.path op literal` at the first comparison operator outside
/// quotes. `Ok(None)` means no operator at all: an existence predicate.
fn split_predicate(rest: &str) -> Result<Option<(&str, FilterOp, &str)>, PathError> {
    let bytes = rest.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'=' | b'!' | b'<' | b'>' => {
                let (op, width) = match (b, bytes.get(i + 1).copied()) {
                    (b'=', Some(b'=')) => (FilterOp::Eq, 2),
                    (b'!', Some(b'=')) => (FilterOp::Ne, 2),
                    (b'>', Some(b'=')) => (FilterOp::Ge, 2),
                    (b'<', Some(b'=')) => (FilterOp::Le, 2),
                    (b'>', _) => (FilterOp::Gt, 1),
                    (b'<', _) => (FilterOp::Lt, 1),
                    _ => {
                        return Err(PathError::InvalidFilter(format!(
                            "unknown operator near offset {i}"
                        )));
                    }
                };
                return Ok(Some((rest[..i].trim(), op, rest[i + width..].trim())));
            }
            _ => {}
        }
        i += 1;
    }
    Ok(None)
}

fn parse_literal(token: &str) -> Result<Value, PathError> {
    let t = token.trim();
    if let Some(stripped) = t
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Ok(Value::String(stripped.to_string()));
    }
    // double-quoted strings, numbers, booleans and null are plain JSON
    serde_json::from_str(t)
        .map_err(|_| PathError::InvalidFilter(format!("bad literal: {t}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_dotted_path() {
        let segments = parse_path("steps.fetch.output").unwrap();
        assert_eq!(
            segments,
            vec![
                PathSegment::Key("steps".to_string()),
                PathSegment::Key("fetch".to_string()),
                PathSegment::Key("output".to_string()),
            ]
        );
    }

    #[test]
    fn test_dollar_prefix_and_bare_root() {
        assert_eq!(
            parse_path("$.a.b").unwrap(),
            parse_path("a.b").unwrap()
        );
        assert!(parse_path("$").unwrap().is_empty());
    }

    #[test]
    fn test_bracket_notation_equivalence() {
        assert_eq!(
            parse_path(r#"steps["fetch"].output"#).unwrap(),
            parse_path("steps.fetch.output").unwrap()
        );
        assert_eq!(
            parse_path("items[0].name").unwrap(),
            vec![
                PathSegment::Key("items".to_string()),
                PathSegment::Index(0),
                PathSegment::Key("name".to_string()),
            ]
        );
    }

    #[test]
    fn test_quoted_key_with_dots() {
        let segments = parse_path(r#"a['weird.key'].b"#).unwrap();
        assert_eq!(
            segments,
            vec![
                PathSegment::Key("a".to_string()),
                PathSegment::Key("weird.key".to_string()),
                PathSegment::Key("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_wildcard_both_notations() {
        assert_eq!(
            parse_path("items[*].price").unwrap(),
            parse_path("items.*.price").unwrap()
        );
        assert!(parse_path("items[*]").unwrap()[1].is_complex());
    }

    #[test]
    fn test_recursive_descent() {
        let segments = parse_path("$..status").unwrap();
        assert_eq!(segments, vec![PathSegment::Descent("status".to_string())]);
        assert!(segments[0].is_complex());
        assert_eq!(parse_path(".."), Err(PathError::DescentMissingKey));
    }

    #[test]
    fn test_filter_operators() {
        for (expr, op) in [
            ("items[?(@.price == 10)]", FilterOp::Eq),
            ("items[?(@.price != 10)]", FilterOp::Ne),
            ("items[?(@.price > 10)]", FilterOp::Gt),
            ("items[?(@.price >= 10)]", FilterOp::Ge),
            ("items[?(@.price < 10)]", FilterOp::Lt),
            ("items[?(@.price <= 10)]", FilterOp::Le),
        ] {
            let segments = parse_path(expr).unwrap();
            match &segments[1] {
                PathSegment::Filter(filter) => {
                    assert_eq!(
                        filter.test,
                        FilterTest::Compare {
                            op,
                            literal: json!(10)
                        },
                        "for {expr}"
                    );
                    assert_eq!(filter.path, vec![PathSegment::Key("price".to_string())]);
                }
                other => panic!("expected filter, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_filter_string_literals() {
        let segments = parse_path("items[?(@.status == 'FAILED')]").unwrap();
        let PathSegment::Filter(filter) = &segments[1] else {
            panic!("expected filter");
        };
        assert!(matches!(&filter.test, FilterTest::Compare { literal, .. } if *literal == json!("FAILED")));

        let segments = parse_path(r#"items[?(@.status == "ok")]"#).unwrap();
        let PathSegment::Filter(filter) = &segments[1] else {
            panic!("expected filter");
        };
        assert!(matches!(&filter.test, FilterTest::Compare { literal, .. } if *literal == json!("ok")));
    }

    #[test]
    fn test_existence_filter() {
        let segments = parse_path("items[?(@.price)]").unwrap();
        let PathSegment::Filter(filter) = &segments[1] else {
            panic!("expected filter");
        };
        assert_eq!(filter.test, FilterTest::Exists);
        assert_eq!(filter.path, vec![PathSegment::Key("price".to_string())]);
    }

    #[test]
    fn test_filter_on_element_itself() {
        let segments = parse_path("nums[?(@ > 5)]").unwrap();
        let PathSegment::Filter(filter) = &segments[1] else {
            panic!("expected filter");
        };
        assert!(filter.path.is_empty());
    }

    #[test]
    fn test_dynamic_segment_with_nested_brackets() {
        let segments = parse_path(r#"results[$.cfg["key"]].value"#).unwrap();
        assert_eq!(
            segments,
            vec![
                PathSegment::Key("results".to_string()),
                PathSegment::Dynamic(r#"$.cfg["key"]"#.to_string()),
                PathSegment::Key("value".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_path(""), Err(PathError::Empty));
        assert_eq!(parse_path("   "), Err(PathError::Empty));
        assert_eq!(parse_path("a[1"), Err(PathError::UnterminatedBracket));
        assert_eq!(parse_path("a['x]"), Err(PathError::UnterminatedQuote));
        assert!(matches!(
            parse_path("items[?(price > 3)]"),
            Err(PathError::InvalidFilter(_))
        ));
        assert!(matches!(parse_path("a..b.c."), Err(PathError::EmptyKey(_))));
    }
}

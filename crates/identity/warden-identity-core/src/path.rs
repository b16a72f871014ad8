//! Path expressions over JSON payloads.
//!
//! A path is a `.` separated list of segments. Each segment is either an object
//! key, an array index written `[n]`, or the wildcard `[*]`:
//!
//! ```text
//! user.login
//! emails.[0].address
//! memberships.[*].team.name
//! ```
//!
//! The bare literals `true`, `false` and any finite number evaluate to
//! themselves, so a mapping table can also carry constant claim values.

use serde_json::{Number, Value};
use thiserror::Error;

use crate::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("field '{0}' not found")]
    NotFound(String),

    #[error("segment '{segment}' expects {expected}")]
    TypeMismatch {
        segment: String,
        expected: &'static str,
    },

    #[error("bad array index '{0}'")]
    BadIndex(String),
}

impl PathError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PathError::NotFound(_) => ErrorKind::NotFound,
            PathError::TypeMismatch { .. } => ErrorKind::Mismatch,
            PathError::BadIndex(_) => ErrorKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Index(&'a str),
    Wildcard,
}

impl<'a> Segment<'a> {
    fn parse(raw: &'a str) -> Self {
        match raw.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            Some("*") => Segment::Wildcard,
            Some(index) => Segment::Index(index),
            None => Segment::Key(raw),
        }
    }
}

/// Evaluates `path` against `document`.
///
/// Errors on any segment fail the whole path, except below a wildcard where
/// elements that do not resolve are skipped.
pub fn extract(document: &Value, path: &str) -> Result<Value, PathError> {
    if let Some(literal) = literal_value(path) {
        return Ok(literal);
    }

    let segments: Vec<Segment<'_>> = path
        .split('.')
        .filter(|segment| !segment.is_empty())
        .map(Segment::parse)
        .collect();

    if segments.is_empty() {
        return Err(PathError::NotFound(path.to_string()));
    }
    walk(document, &segments)
}

fn literal_value(path: &str) -> Option<Value> {
    match path {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }

    if let Ok(int) = path.parse::<i64>() {
        return Some(Value::Number(int.into()));
    }

    // Rust's float parser accepts "inf" and "NaN", which are not JSON numbers.
    path.parse::<f64>()
        .ok()
        .filter(|float| float.is_finite())
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn walk(current: &Value, segments: &[Segment<'_>]) -> Result<Value, PathError> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(current.clone());
    };

    match *segment {
        Segment::Key(key) => {
            let object = current.as_object().ok_or_else(|| PathError::TypeMismatch {
                segment: key.to_string(),
                expected: "an object",
            })?;
            let next = object
                .get(key)
                .ok_or_else(|| PathError::NotFound(key.to_string()))?;
            walk(next, rest)
        }
        Segment::Index(raw) => {
            let array = current.as_array().ok_or_else(|| PathError::TypeMismatch {
                segment: format!("[{raw}]"),
                expected: "an array",
            })?;
            let next = raw
                .parse::<usize>()
                .ok()
                .and_then(|index| array.get(index))
                .ok_or_else(|| PathError::BadIndex(raw.to_string()))?;
            walk(next, rest)
        }
        Segment::Wildcard => {
            let array = current.as_array().ok_or_else(|| PathError::TypeMismatch {
                segment: "[*]".to_string(),
                expected: "an array",
            })?;
            if rest.is_empty() {
                return Ok(current.clone());
            }
            let values = array
                .iter()
                .filter_map(|element| walk(element, rest).ok())
                .collect();
            Ok(Value::Array(values))
        }
    }
}

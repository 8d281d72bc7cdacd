//! Reading and writing a JSON state tree by path.
//!
//! Two path flavours meet here:
//!
//! - [`FieldPath`]: the normalized form used for dependencies and dirty
//!   tracking, where every array position is the `*` wildcard.
//! - [`StatePath`]: a concrete location used for writes, where array
//!   positions are real indexes (`items[3].price`).
//!
//! Writes materialize missing structure: absent or non-object intermediates
//! become objects, and array indexes past the end are padded with `null`.

use std::fmt;

use converge_foundation::{FieldPath, FieldPathError, WILDCARD};
use serde_json::{Map, Value};

/// One concrete step into a state tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Object key.
    Key(String),
    /// Array position.
    Index(usize),
}

/// A concrete, writable location in a state tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath {
    segments: Vec<Segment>,
}

impl StatePath {
    /// Parse `a.b[2].c` / `a.b.2.c` style strings.
    pub fn parse(input: &str) -> Result<Self, FieldPathError> {
        let mut segments = Vec::new();
        for part in input.split('.').filter(|p| !p.is_empty()) {
            if part == WILDCARD || part.ends_with("[]") {
                return Err(FieldPathError::MalformedSegment {
                    input: input.to_string(),
                    segment: part.to_string(),
                });
            }

            let (base, mut rest) = match part.find('[') {
                Some(open) => (&part[..open], &part[open..]),
                None => (part, ""),
            };

            if !base.is_empty() {
                if base.contains(']') {
                    return Err(malformed(input, part));
                }
                match base.parse::<usize>() {
                    Ok(index) => segments.push(Segment::Index(index)),
                    Err(_) => segments.push(Segment::Key(base.to_string())),
                }
            }

            while !rest.is_empty() {
                let Some(close) = rest.find(']') else {
                    return Err(malformed(input, part));
                };
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| malformed(input, part))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(malformed(input, part));
                }
            }
        }

        if segments.is_empty() {
            return Err(FieldPathError::Empty);
        }
        Ok(Self { segments })
    }

    /// Concrete path for a normalized field path without wildcards.
    pub fn from_field_path(path: &FieldPath) -> Option<Self> {
        if path.has_wildcard() {
            return None;
        }
        Some(Self {
            segments: path
                .segments()
                .iter()
                .map(|s| Segment::Key(s.clone()))
                .collect(),
        })
    }

    /// The segments of this path.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Normalized form used for dirty tracking.
    pub fn normalized(&self) -> Result<FieldPath, FieldPathError> {
        FieldPath::from_segments(self.segments.iter().map(|s| match s {
            Segment::Key(k) => k.clone(),
            Segment::Index(_) => WILDCARD.to_string(),
        }))
    }
}

fn malformed(input: &str, part: &str) -> FieldPathError {
    FieldPathError::MalformedSegment {
        input: input.to_string(),
        segment: part.to_string(),
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Key(k) if i == 0 => write!(f, "{k}")?,
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(n) => write!(f, "[{n}]")?,
            }
        }
        Ok(())
    }
}

/// Borrow the value at a wildcard-free field path, if present.
pub fn lookup<'a>(root: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut node = root;
    for seg in path.segments() {
        if seg == WILDCARD {
            return None;
        }
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// Borrow the value at a concrete path, if present.
pub fn lookup_at<'a>(root: &'a Value, path: &StatePath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |node, seg| match seg {
            Segment::Key(key) => node.as_object()?.get(key),
            Segment::Index(index) => node.as_array()?.get(*index),
        })
}

/// Read the value at a field path.
///
/// A wildcard segment maps the rest of the path over every element of the
/// array found there and yields the results as an array (missing items read
/// as `null`). Returns `None` when the path is absent.
pub fn read_value(root: &Value, path: &FieldPath) -> Option<Value> {
    read_segments(root, path.segments())
}

fn read_segments(node: &Value, segments: &[String]) -> Option<Value> {
    let Some((head, tail)) = segments.split_first() else {
        return Some(node.clone());
    };
    if head == WILDCARD {
        let items = node.as_array()?;
        return Some(Value::Array(
            items
                .iter()
                .map(|item| read_segments(item, tail).unwrap_or(Value::Null))
                .collect(),
        ));
    }
    read_segments(node.as_object()?.get(head)?, tail)
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOutcome {
    /// Structure had to be created or replaced along the path.
    pub materialized: bool,
}

/// Write `value` at a concrete path, materializing missing structure.
pub fn write_at(root: &mut Value, path: &StatePath, value: Value) -> WriteOutcome {
    let mut outcome = WriteOutcome::default();
    let mut node = root;
    for seg in path.segments() {
        node = match seg {
            Segment::Key(key) => {
                if !node.is_object() {
                    outcome.materialized = true;
                    *node = Value::Object(Map::new());
                }
                let Value::Object(map) = node else {
                    return outcome;
                };
                if !map.contains_key(key) {
                    outcome.materialized = true;
                }
                map.entry(key.clone()).or_insert(Value::Null)
            }
            Segment::Index(index) => {
                if !node.is_array() {
                    outcome.materialized = true;
                    *node = Value::Array(Vec::new());
                }
                let Value::Array(items) = node else {
                    return outcome;
                };
                if items.len() <= *index {
                    outcome.materialized = true;
                    items.resize(*index + 1, Value::Null);
                }
                &mut items[*index]
            }
        };
    }
    *node = value;
    outcome
}

/// Write at a wildcard-free field path (derived outputs).
pub fn write_field(root: &mut Value, path: &FieldPath, value: Value) -> WriteOutcome {
    match StatePath::from_field_path(path) {
        Some(concrete) => write_at(root, &concrete, value),
        None => WriteOutcome::default(),
    }
}

/// Enumerate every field path present in a value (used to derive a shape).
pub(crate) fn collect_paths(value: &Value, out: &mut Vec<FieldPath>) {
    fn walk(node: &Value, prefix: &mut Vec<String>, out: &mut Vec<FieldPath>) {
        match node {
            Value::Object(map) => {
                for (key, child) in map {
                    prefix.push(key.clone());
                    if let Ok(path) = FieldPath::from_segments(prefix.iter().cloned()) {
                        out.push(path);
                    }
                    walk(child, prefix, out);
                    prefix.pop();
                }
            }
            Value::Array(items) if !prefix.is_empty() => {
                prefix.push(WILDCARD.to_string());
                if let Ok(path) = FieldPath::from_segments(prefix.iter().cloned()) {
                    out.push(path);
                }
                for item in items {
                    walk(item, prefix, out);
                }
                prefix.pop();
            }
            _ => {}
        }
    }
    walk(value, &mut Vec::new(), out);
}

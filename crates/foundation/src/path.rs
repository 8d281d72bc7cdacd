//! Normalized field paths into a state tree.
//!
//! A [`FieldPath`] is a non-empty sequence of segments. Array positions are
//! never addressed individually: `items[3]`, `items[]` and `items.3` all
//! normalize to the wildcard segment `*`, so "every item of a list" can be a
//! dependency target and writes to any index mark the same path dirty.
//!
//! Ordering is lexicographic over segments with shorter paths first on a
//! shared prefix, which makes "sort, then drop paths covered by the previous
//! one" a valid prefix-free canonicalization (see [`canonicalize_roots`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The wildcard segment standing for any array position.
pub const WILDCARD: &str = "*";

/// Reasons a string cannot be normalized into a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldPathError {
    /// The input had no addressable segment (empty string, only dots).
    #[error("empty field path")]
    Empty,

    /// The whole input was the wildcard, which addresses no specific field.
    #[error("bare wildcard is not a field path")]
    BareWildcard,

    /// A segment contained unbalanced or non-numeric brackets.
    #[error("malformed segment `{segment}` in `{input}`")]
    MalformedSegment {
        /// The full input string.
        input: String,
        /// The offending segment.
        segment: String,
    },
}

/// A normalized, non-empty location in a state tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dot-separated path string.
    ///
    /// ```
    /// use converge_foundation::FieldPath;
    ///
    /// let p = FieldPath::parse("items[2].price").unwrap();
    /// assert_eq!(p.to_string(), "items.*.price");
    /// assert!(FieldPath::parse("*").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self, FieldPathError> {
        if input == WILDCARD {
            return Err(FieldPathError::BareWildcard);
        }

        let mut segments = Vec::new();
        for part in input.split('.').filter(|p| !p.is_empty()) {
            if let Some(base) = part.strip_suffix("[]") {
                push_base(&mut segments, base, input, part)?;
                segments.push(WILDCARD.to_string());
                continue;
            }

            if let Some(open) = part.find('[') {
                let base = &part[..open];
                let index = &part[open + 1..];
                let Some(index) = index.strip_suffix(']') else {
                    return Err(malformed(input, part));
                };
                if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed(input, part));
                }
                push_base(&mut segments, base, input, part)?;
                segments.push(WILDCARD.to_string());
                continue;
            }

            if part.contains(']') {
                return Err(malformed(input, part));
            }

            if part.bytes().all(|b| b.is_ascii_digit()) {
                segments.push(WILDCARD.to_string());
            } else {
                segments.push(part.to_string());
            }
        }

        Self::from_segments(segments)
    }

    /// Build a path from already-split segments, normalizing numeric ones.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, FieldPathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.bytes().all(|b| b.is_ascii_digit()) {
                    WILDCARD.to_string()
                } else {
                    s
                }
            })
            .collect();

        match segments.as_slice() {
            [] => Err(FieldPathError::Empty),
            [only] if only == WILDCARD => Err(FieldPathError::BareWildcard),
            _ => Ok(Self { segments }),
        }
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (always at least one).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// First segment (the top-level field).
    pub fn first(&self) -> &str {
        &self.segments[0]
    }

    /// Last segment (leaf name).
    pub fn last(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Whether any segment is the wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.segments.iter().any(|s| s == WILDCARD)
    }

    /// Parent path, or `None` for a top-level field.
    pub fn parent(&self) -> Option<Self> {
        (self.segments.len() > 1).then(|| Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append a segment to create a new path.
    pub fn append(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The leading `len` segments as a path, `None` when out of range.
    pub fn prefix(&self, len: usize) -> Option<Self> {
        (len >= 1 && len <= self.segments.len()).then(|| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True when either path is a prefix of the other.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

fn malformed(input: &str, segment: &str) -> FieldPathError {
    FieldPathError::MalformedSegment {
        input: input.to_string(),
        segment: segment.to_string(),
    }
}

fn push_base(
    segments: &mut Vec<String>,
    base: &str,
    input: &str,
    part: &str,
) -> Result<(), FieldPathError> {
    if base.contains('[') || base.contains(']') {
        return Err(malformed(input, part));
    }
    if !base.is_empty() {
        segments.push(base.to_string());
    }
    Ok(())
}

/// Sort, deduplicate and drop every path already covered by an ancestor.
///
/// ```
/// use converge_foundation::{canonicalize_roots, FieldPath};
///
/// let roots = ["a.b", "a", "c.d", "a.b"].map(|s| FieldPath::parse(s).unwrap());
/// let canonical = canonicalize_roots(roots);
/// let rendered: Vec<String> = canonical.iter().map(ToString::to_string).collect();
/// assert_eq!(rendered, ["a", "c.d"]);
/// ```
pub fn canonicalize_roots<I>(roots: I) -> Vec<FieldPath>
where
    I: IntoIterator<Item = FieldPath>,
{
    let mut sorted: Vec<FieldPath> = roots.into_iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut out: Vec<FieldPath> = Vec::with_capacity(sorted.len());
    for next in sorted {
        if let Some(prev) = out.last()
            && prev.is_prefix_of(&next)
        {
            continue;
        }
        out.push(next);
    }
    out
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = FieldPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = FieldPathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl TryFrom<&str> for FieldPath {
    type Error = FieldPathError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<FieldPath> for String {
    fn from(p: FieldPath) -> Self {
        p.to_string()
    }
}

impl PartialEq<&str> for FieldPath {
    fn eq(&self, other: &&str) -> bool {
        self.to_string() == *other
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;

/// A half-open key interval `[start, end)` used for range scans and
/// predicate locks. A missing bound is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyRange {
    start: Option<String>,
    end: Option<String>,
}

impl KeyRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    /// The whole key space.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_start(start: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: None,
        }
    }

    /// Every key beginning with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let end = prefix_successor(&prefix);
        Self {
            start: Some(prefix),
            end,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let after_start = self.start.as_deref().is_none_or(|s| key >= s);
        let before_end = self.end.as_deref().is_none_or(|e| key < e);
        after_start && before_end
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let a_before_b_end = match (&self.start, &other.end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        let b_before_a_end = match (&other.start, &self.end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        a_before_b_end && b_before_a_end
    }

    /// The range as skip-map bounds.
    pub fn bounds(&self) -> (Bound<String>, Bound<String>) {
        let start = match &self.start {
            Some(s) => Bound::Included(s.clone()),
            None => Bound::Unbounded,
        };
        let end = match &self.end {
            Some(e) => Bound::Excluded(e.clone()),
            None => Bound::Unbounded,
        };
        (start, end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.as_deref().unwrap_or("-inf"),
            self.end.as_deref().unwrap_or("+inf")
        )
    }
}

/// Smallest string greater than every string starting with `prefix`,
/// or `None` if no such string exists.
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            '\u{D7FF}' => Some('\u{E000}'),
            _ => char::from_u32(last as u32 + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

//! Named input/output slots.
//!
//! Entries are `"name:description"` strings. Everything before the first
//! colon is the name; the rest, if any, is the description.

use crate::error::{Error, Result};

/// Description reported for entries without a colon.
pub const NO_DESCRIPTION: &str = "No description available";

/// Ordered scheme of one side (inputs or outputs) of a function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoScheme {
    entries: Vec<String>,
}

impl IoScheme {
    pub fn new(entries: Vec<String>) -> Self {
        IoScheme { entries }
    }

    /// `prefix0, prefix1, ...` with `n` entries.
    pub fn numbered(prefix: &str, n: usize) -> Self {
        IoScheme {
            entries: (0..n).map(|i| format!("{prefix}{i}")).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Name of entry `i`.
    pub fn name(&self, i: usize) -> Option<&str> {
        self.entries.get(i).map(|e| split(e).0)
    }

    /// Description of entry `i`, or [`NO_DESCRIPTION`].
    pub fn description(&self, i: usize) -> Option<&str> {
        self.entries
            .get(i)
            .map(|e| split(e).1.unwrap_or(NO_DESCRIPTION))
    }

    /// All names, in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| split(e).0.to_string()).collect()
    }

    /// Index of the first entry named `name`.
    pub fn index(&self, name: &str, context: &str) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| split(e).0 == name)
            .ok_or_else(|| Error::not_found(context, name, self.names()))
    }
}

fn split(entry: &str) -> (&str, Option<&str>) {
    match entry.split_once(':') {
        Some((name, descr)) => (name, Some(descr)),
        None => (entry, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_at_first_colon() {
        let s = IoScheme::new(vec!["x:state: with colon".into(), "p".into()]);
        assert_eq!(s.name(0), Some("x"));
        assert_eq!(s.description(0), Some("state: with colon"));
        assert_eq!(s.description(1), Some(NO_DESCRIPTION));
        assert_eq!(s.index("p", "f").unwrap(), 1);
    }

    #[test]
    fn first_match_wins() {
        let s = IoScheme::new(vec!["a:first".into(), "a:second".into()]);
        assert_eq!(s.index("a", "f").unwrap(), 0);
    }

    #[test]
    fn missing_name_lists_all() {
        let s = IoScheme::numbered("i", 3);
        match s.index("z", "In function f") {
            Err(Error::NotFound { available, .. }) => {
                assert_eq!(available, vec!["i0", "i1", "i2"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

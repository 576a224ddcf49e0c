//! Aggregated error reporting
//!
//! Backend failures are isolated from one another, so a run can end with
//! several unrelated errors. `ErrorSet` keeps every one of them together
//! with the name of the component that produced it.

use std::fmt;

use crate::SnapError;

/// Ordered list of `(source, error)` pairs
#[derive(Debug, Default)]
pub struct ErrorSet {
    entries: Vec<(String, SnapError)>,
}

impl ErrorSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure attributed to `source`
    pub fn push(&mut self, source: impl Into<String>, error: impl Into<SnapError>) {
        self.entries.push((source.into(), error.into()));
    }

    /// Append every entry of `other`, preserving order
    pub fn merge(&mut self, other: ErrorSet) {
        self.entries.extend(other.entries);
    }

    /// `true` when nothing failed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over `(source, error)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SnapError)> {
        self.entries.iter().map(|(source, err)| (source.as_str(), err))
    }

    /// Distinct sources that reported at least one failure
    pub fn sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = Vec::new();
        for (source, _) in &self.entries {
            if !sources.contains(&source.as_str()) {
                sources.push(source);
            }
        }
        sources
    }

    /// `Ok(())` when empty, otherwise the set itself as the error
    pub fn into_result(self) -> Result<(), ErrorSet> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entries.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "1 error occurred: {}: {}", self.entries[0].0, self.entries[0].1),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for (source, err) in &self.entries {
                    write!(f, "\n\t* {}: {}", source, err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ErrorSet {}

impl IntoIterator for ErrorSet {
    type Item = (String, SnapError);
    type IntoIter = std::vec::IntoIter<(String, SnapError)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Extend<(String, SnapError)> for ErrorSet {
    fn extend<T: IntoIterator<Item = (String, SnapError)>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

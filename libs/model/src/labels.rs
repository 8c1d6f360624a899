//! Key/value labels used to constrain VM placement.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A set of key/value labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this label set is a superset of `other`.
    ///
    /// A worker can run a VM only when the worker's labels contain every
    /// label the VM requires, with matching values.
    pub fn contains(&self, other: &Labels) -> bool {
        other
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{key}: {value}")?;
            first = false;
        }
        Ok(())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Labels {
    fn from(entries: [(&str, &str); N]) -> Self {
        let mut labels = Labels::new();
        for (key, value) in entries {
            labels.insert(key, value);
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_requires_matching_values() {
        let worker = Labels::from([("arch", "arm64"), ("pool", "ci")]);

        assert!(worker.contains(&Labels::new()));
        assert!(worker.contains(&Labels::from([("arch", "arm64")])));
        assert!(!worker.contains(&Labels::from([("arch", "amd64")])));
        assert!(!worker.contains(&Labels::from([("zone", "eu")])));
    }
}

//! Named resource capacities and requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource name for the default VM slot capacity.
pub const RESOURCE_VMS: &str = "vms";

/// A map of named integer capacities (VM slots, GPUs, ...).
///
/// Both worker capacities and VM requests use the same shape; scheduling
/// compares them key-wise. Missing keys count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, u64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: impl Into<String>, amount: u64) {
        self.0.insert(name.into(), amount);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add every capacity in `other` to this map.
    pub fn add(&mut self, other: &Resources) {
        for (name, amount) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += amount;
        }
    }

    /// Subtract `other` key-wise, saturating at zero.
    pub fn subtract(&mut self, other: &Resources) {
        for (name, amount) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_sub(*amount);
        }
    }

    /// `self - other` (saturating), leaving both operands untouched.
    pub fn subtracted(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        result.subtract(other);
        result
    }

    /// Whether every capacity requested in `other` fits into `self`.
    pub fn can_fit(&self, other: &Resources) -> bool {
        other.0.iter().all(|(name, amount)| self.get(name) >= *amount)
    }

    /// Merge in defaults for keys not already present.
    pub fn merged(&self, defaults: &Resources) -> Resources {
        let mut result = defaults.clone();
        for (name, amount) in &self.0 {
            result.0.insert(name.clone(), *amount);
        }
        result
    }
}

impl FromIterator<(String, u64)> for Resources {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, u64); N]> for Resources {
    fn from(entries: [(&str, u64); N]) -> Self {
        entries
            .into_iter()
            .map(|(name, amount)| (name.to_string(), amount))
            .collect()
    }
}

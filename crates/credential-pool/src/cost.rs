//! Quota cost per call kind

use std::collections::{BTreeMap, HashMap};

/// Published unit costs of the upstream's endpoints.
pub const DEFAULT_COSTS: &[(&str, u64)] = &[
    ("search", 100),
    ("list-comments", 1),
    ("channels", 1),
    ("playlist-items", 1),
    ("videos", 1),
];

/// Immutable map from call kind to the quota units one call consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostTable {
    costs: BTreeMap<String, u64>,
}

impl CostTable {
    /// Exactly the given costs, no defaults.
    pub fn new(costs: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            costs: costs.into_iter().collect(),
        }
    }

    /// Defaults with the given entries added or overriding them.
    pub fn with_overrides(overrides: &HashMap<String, u64>) -> Self {
        let mut table = Self::default();
        for (kind, cost) in overrides {
            table.costs.insert(kind.clone(), *cost);
        }
        table
    }

    /// Cost of one call, or `None` for a kind the table doesn't know.
    pub fn cost(&self, kind: &str) -> Option<u64> {
        self.costs.get(kind).copied()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.costs.contains_key(kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.costs.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for CostTable {
    fn default() -> Self {
        Self::new(DEFAULT_COSTS.iter().map(|(k, v)| (k.to_string(), *v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_costs() {
        let table = CostTable::default();
        assert_eq!(table.cost("search"), Some(100));
        assert_eq!(table.cost("list-comments"), Some(1));
        assert_eq!(table.cost("videos"), Some(1));
        assert_eq!(table.cost("unknown"), None);
    }

    #[test]
    fn overrides_replace_and_extend_defaults() {
        let overrides = HashMap::from([
            ("search".to_string(), 50),
            ("captions".to_string(), 200),
        ]);
        let table = CostTable::with_overrides(&overrides);
        assert_eq!(table.cost("search"), Some(50));
        assert_eq!(table.cost("captions"), Some(200));
        assert_eq!(table.cost("channels"), Some(1));
    }

    #[test]
    fn explicit_table_has_no_defaults() {
        let table = CostTable::new([("search".to_string(), 4)]);
        assert!(table.contains("search"));
        assert!(!table.contains("videos"));
        assert_eq!(table.iter().count(), 1);
    }
}

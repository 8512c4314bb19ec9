//! Query Criteria
//!
//! A thin, engine-agnostic query descriptor: field equality filters,
//! ordering, and result slicing. The layer never translates this to SQL;
//! it hands the descriptor to the engine verbatim.

use crate::engine::core::{FieldMap, Value};

/// Sort direction for an ordered query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Query descriptor passed through to the engine
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    filters: Vec<(String, Value)>,
    order: Option<(String, SortOrder)>,
    first_result: Option<usize>,
    max_results: Option<usize>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a field to equal a value
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Order results ascending by a field
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order = Some((field.into(), SortOrder::Ascending));
        self
    }

    /// Order results descending by a field
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order = Some((field.into(), SortOrder::Descending));
        self
    }

    /// Skip the first `n` results
    pub fn skip(mut self, n: usize) -> Self {
        self.first_result = Some(n);
        self
    }

    /// Return at most `n` results
    pub fn take(mut self, n: usize) -> Self {
        self.max_results = Some(n);
        self
    }

    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    pub fn order(&self) -> Option<(&str, SortOrder)> {
        self.order.as_ref().map(|(f, o)| (f.as_str(), *o))
    }

    pub fn first_result(&self) -> Option<usize> {
        self.first_result
    }

    pub fn max_results(&self) -> Option<usize> {
        self.max_results
    }

    /// True when a record satisfies every equality filter.
    ///
    /// Comparison uses the canonical JSON form of each value, so a typed
    /// filter matches the textual form a round-tripped record carries.
    pub fn matches(&self, fields: &FieldMap) -> bool {
        self.filters.iter().all(|(name, expected)| {
            fields
                .get(name)
                .map(|actual| actual.same_as(expected))
                .unwrap_or(false)
        })
    }

    /// Apply ordering and slicing to a fetched result set
    pub fn arrange(&self, mut rows: Vec<FieldMap>) -> Vec<FieldMap> {
        if let Some((field, order)) = &self.order {
            rows.sort_by(|a, b| {
                let left = a.get(field).map(Value::to_key_string).unwrap_or_default();
                let right = b.get(field).map(Value::to_key_string).unwrap_or_default();
                match order {
                    SortOrder::Ascending => left.cmp(&right),
                    SortOrder::Descending => right.cmp(&left),
                }
            });
        }
        let skip = self.first_result.unwrap_or(0);
        let take = self.max_results.unwrap_or(usize::MAX);
        rows.into_iter().skip(skip).take(take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, age: i64) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("name".to_string(), Value::from(name));
        fields.insert("age".to_string(), Value::Int(age));
        fields
    }

    #[test]
    fn test_matches_on_equality() {
        let criteria = Criteria::new().eq("name", "kate");
        assert!(criteria.matches(&row("kate", 30)));
        assert!(!criteria.matches(&row("anna", 30)));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let criteria = Criteria::new().eq("email", "kate@example.com");
        assert!(!criteria.matches(&row("kate", 30)));
    }

    #[test]
    fn test_arrange_orders_and_slices() {
        let rows = vec![row("carol", 3), row("alice", 1), row("bob", 2)];
        let criteria = Criteria::new().order_by("name").skip(1).take(1);
        let arranged = criteria.arrange(rows);
        assert_eq!(arranged.len(), 1);
        assert_eq!(arranged[0].get("name"), Some(&Value::from("bob")));
    }

    #[test]
    fn test_arrange_descending() {
        let rows = vec![row("alice", 1), row("bob", 2)];
        let criteria = Criteria::new().order_by_desc("name");
        let arranged = criteria.arrange(rows);
        assert_eq!(arranged[0].get("name"), Some(&Value::from("bob")));
    }
}

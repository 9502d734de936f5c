use anyhow::Result;
use std::collections::HashMap;

use super::{rank_matches, FeatureStore, SearchIndex, SearchMatch, SearchRecord};
use crate::detect::FeatureComparator;

#[derive(Clone, Debug, Default)]
pub struct InMemoryFeatureStore {
    features: HashMap<String, String>,
}

impl FeatureStore for InMemoryFeatureStore {
    fn put(&mut self, label: &str, feature: &str) -> Result<()> {
        self.features.insert(label.to_string(), feature.to_string());
        Ok(())
    }

    fn get(&self, label: &str) -> Result<Option<String>> {
        Ok(self.features.get(label).cloned())
    }

    fn delete(&mut self, label: &str) -> Result<bool> {
        Ok(self.features.remove(label).is_some())
    }
}

/// Insertion-ordered search library.
#[derive(Clone, Debug, Default)]
pub struct InMemorySearchIndex {
    records: Vec<SearchRecord>,
}

impl SearchIndex for InMemorySearchIndex {
    fn insert(&mut self, record: SearchRecord) -> Result<()> {
        match self.records.iter_mut().find(|r| r.label == record.label) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        Ok(())
    }

    fn delete_by_label(&mut self, label: &str) -> Result<bool> {
        let before = self.records.len();
        self.records.retain(|r| r.label != label);
        Ok(self.records.len() != before)
    }

    fn search(
        &self,
        feature: &str,
        comparator: &dyn FeatureComparator,
    ) -> Result<Vec<SearchMatch>> {
        rank_matches(self.records.iter(), feature, comparator)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.len())
    }

    fn clear(&mut self) -> Result<usize> {
        let removed = self.records.len();
        self.records.clear();
        Ok(removed)
    }
}

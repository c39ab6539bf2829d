// ABOUTME: Secondary indexes over cached jobs (by field, by type) used to answer queries without scanning.
// ABOUTME: The index is a pure accelerator and is always rebuildable from the cached entries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIndex {
    by_field: BTreeMap<String, BTreeSet<String>>,
    by_type: BTreeMap<String, BTreeSet<String>>,
}

impl JobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from a set of cached jobs.
    pub fn rebuild<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut index = Self::new();
        for job in jobs {
            index.insert(job.id(), job.field_id(), job.job_type());
        }
        index
    }

    pub fn insert(&mut self, job_id: &str, field_id: &str, job_type: JobType) {
        self.by_field
            .entry(field_id.to_string())
            .or_default()
            .insert(job_id.to_string());
        self.by_type
            .entry(job_type.as_str().to_string())
            .or_default()
            .insert(job_id.to_string());
    }

    /// Remove a job whose field and type are known. Returns true if anything
    /// was removed.
    pub fn remove(&mut self, job_id: &str, field_id: &str, job_type: JobType) -> bool {
        let a = remove_from(&mut self.by_field, field_id, job_id);
        let b = remove_from(&mut self.by_type, job_type.as_str(), job_id);
        a || b
    }

    /// Remove a job from every set. Used when the cached entry is unreadable
    /// and its field and type are unknown.
    pub fn purge(&mut self, job_id: &str) -> bool {
        let mut removed = false;
        for set in self.by_field.values_mut().chain(self.by_type.values_mut()) {
            removed |= set.remove(job_id);
        }
        self.by_field.retain(|_, set| !set.is_empty());
        self.by_type.retain(|_, set| !set.is_empty());
        removed
    }

    pub fn for_field(&self, field_id: &str) -> BTreeSet<String> {
        self.by_field.get(field_id).cloned().unwrap_or_default()
    }

    pub fn for_type(&self, job_type: JobType) -> BTreeSet<String> {
        self.by_type
            .get(job_type.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Ids present for both the field and the type.
    pub fn for_field_and_type(&self, field_id: &str, job_type: JobType) -> BTreeSet<String> {
        match (self.by_field.get(field_id), self.by_type.get(job_type.as_str())) {
            (Some(field), Some(kind)) => field.intersection(kind).cloned().collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn field_count(&self, field_id: &str) -> usize {
        self.by_field.get(field_id).map_or(0, BTreeSet::len)
    }

    /// Every field with at least one cached job.
    pub fn field_ids(&self) -> Vec<String> {
        self.by_field.keys().cloned().collect()
    }

    pub fn all_ids(&self) -> BTreeSet<String> {
        self.by_field.values().flatten().cloned().collect()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.by_field.values().any(|set| set.contains(job_id))
    }

    pub fn len(&self) -> usize {
        self.by_field.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_field.is_empty()
    }
}

fn remove_from(map: &mut BTreeMap<String, BTreeSet<String>>, key: &str, job_id: &str) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(job_id);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

//! Per-tag completion state for one harvest run.
//!
//! The registry is the single source of truth for run termination: a run is
//! finished when every registered tag is [`EntryStatus::Completed`]. Entries
//! only ever move from Pending to Completed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{MonitoredHandle, TagId};

/// How a tag left the Pending state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// A good value was captured and written to the result file.
    Recorded,
    /// The server does not know the tag, or the stuck-tag policy gave up.
    Unreachable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Completed(Completion),
}

impl EntryStatus {
    pub fn is_pending(self) -> bool {
        matches!(self, EntryStatus::Pending)
    }
}

#[derive(Clone, Debug)]
pub struct CompletionEntry {
    pub tag: TagId,
    /// Binding to the live subscription, present while the tag is admitted.
    pub handle: Option<MonitoredHandle>,
    pub status: EntryStatus,
    /// Consecutive drain cycles this admitted tag went without a good value.
    pub stale_cycles: u32,
    /// Consecutive admissions in which the server refused to monitor the tag.
    pub rejections: u32,
    /// Times the server confirmed the tag exists while it stayed stale.
    pub verifications: u32,
}

impl CompletionEntry {
    fn new(tag: TagId) -> Self {
        Self {
            tag,
            handle: None,
            status: EntryStatus::Pending,
            stale_cycles: 0,
            rejections: 0,
            verifications: 0,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.status.is_pending() && self.handle.is_some()
    }
}

/// Counters describing registry progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub pending: usize,
    pub admitted: usize,
    pub recorded: usize,
    pub unreachable: usize,
}

impl RegistrySummary {
    pub fn completed(&self) -> usize {
        self.recorded + self.unreachable
    }
}

#[derive(Debug, Default)]
pub struct CompletionRegistry {
    entries: Vec<CompletionEntry>,
    index: HashMap<TagId, usize>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register tags as Pending in input order. Tags already present are
    /// skipped, so the first occurrence decides the FIFO position. Returns the
    /// number of newly registered tags.
    pub fn register<I>(&mut self, tags: I) -> usize
    where
        I: IntoIterator<Item = TagId>,
    {
        let mut added = 0;
        for tag in tags {
            if self.index.contains_key(&tag) {
                tracing::debug!(target: "harvest::registry", tag = %tag, "duplicate tag ignored");
                continue;
            }
            self.index.insert(tag.clone(), self.entries.len());
            self.entries.push(CompletionEntry::new(tag));
            added += 1;
        }
        added
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, tag: &TagId) -> Option<&CompletionEntry> {
        self.index.get(tag).map(|&idx| &self.entries[idx])
    }

    fn get_mut(&mut self, tag: &TagId) -> Option<&mut CompletionEntry> {
        match self.index.get(tag) {
            Some(&idx) => Some(&mut self.entries[idx]),
            None => None,
        }
    }

    pub fn status(&self, tag: &TagId) -> Option<EntryStatus> {
        self.get(tag).map(|entry| entry.status)
    }

    pub fn is_pending(&self, tag: &TagId) -> bool {
        self.status(tag).is_some_and(EntryStatus::is_pending)
    }

    /// Move a tag to Completed. Completing an already completed tag is a
    /// no-op that keeps the first outcome; unknown tags are logged and
    /// ignored. Returns `true` only for an actual Pending -> Completed move.
    pub fn mark_completed(&mut self, tag: &TagId, completion: Completion) -> bool {
        let Some(entry) = self.get_mut(tag) else {
            tracing::warn!(target: "harvest::registry", tag = %tag, "mark_completed for unregistered tag ignored");
            return false;
        };
        if !entry.status.is_pending() {
            return false;
        }
        entry.status = EntryStatus::Completed(completion);
        true
    }

    pub fn is_all_completed(&self) -> bool {
        self.entries.iter().all(|entry| !entry.status.is_pending())
    }

    /// Up to `limit` Pending tags that are not bound to the subscription,
    /// oldest registration first.
    pub fn pending_entries(&self, limit: usize) -> Vec<TagId> {
        self.entries
            .iter()
            .filter(|entry| entry.status.is_pending() && entry.handle.is_none())
            .take(limit)
            .map(|entry| entry.tag.clone())
            .collect()
    }

    /// Pending tags currently bound to the subscription.
    pub fn admitted_pending(&self) -> impl Iterator<Item = &CompletionEntry> {
        self.entries.iter().filter(|entry| entry.is_admitted())
    }

    pub fn attach_handle(&mut self, tag: &TagId, handle: MonitoredHandle) -> bool {
        match self.get_mut(tag) {
            Some(entry) if entry.status.is_pending() => {
                entry.handle = Some(handle);
                entry.stale_cycles = 0;
                entry.rejections = 0;
                true
            }
            _ => false,
        }
    }

    pub fn detach_handle(&mut self, tag: &TagId) -> Option<MonitoredHandle> {
        self.get_mut(tag).and_then(|entry| entry.handle.take())
    }

    /// Drop every handle, e.g. after the session that minted them was torn
    /// down. Status is untouched. Returns how many handles were dropped.
    pub fn release_all_handles(&mut self) -> usize {
        let mut released = 0;
        for entry in &mut self.entries {
            if entry.handle.take().is_some() {
                released += 1;
            }
            entry.stale_cycles = 0;
        }
        released
    }

    /// Increment the stale counter of an admitted tag and return the new value.
    pub fn record_stale_cycle(&mut self, tag: &TagId) -> u32 {
        match self.get_mut(tag) {
            Some(entry) if entry.is_admitted() => {
                entry.stale_cycles = entry.stale_cycles.saturating_add(1);
                entry.stale_cycles
            }
            _ => 0,
        }
    }

    /// Count a refusal to create a monitored item for a Pending tag and return
    /// the new value.
    pub fn record_rejection(&mut self, tag: &TagId) -> u32 {
        match self.get_mut(tag) {
            Some(entry) if entry.status.is_pending() => {
                entry.rejections = entry.rejections.saturating_add(1);
                entry.rejections
            }
            _ => 0,
        }
    }

    /// Note that the server confirmed the tag exists; the stale and rejection
    /// counters start over. Returns the total confirmations so far.
    pub fn record_verification(&mut self, tag: &TagId) -> u32 {
        match self.get_mut(tag) {
            Some(entry) => {
                entry.stale_cycles = 0;
                entry.rejections = 0;
                entry.verifications = entry.verifications.saturating_add(1);
                entry.verifications
            }
            None => 0,
        }
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            total: self.entries.len(),
            ..RegistrySummary::default()
        };
        for entry in &self.entries {
            match entry.status {
                EntryStatus::Pending => {
                    summary.pending += 1;
                    if entry.handle.is_some() {
                        summary.admitted += 1;
                    }
                }
                EntryStatus::Completed(Completion::Recorded) => summary.recorded += 1,
                EntryStatus::Completed(Completion::Unreachable) => summary.unreachable += 1,
            }
        }
        summary
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompletionEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<TagId> {
        names.iter().map(|name| TagId::from(*name)).collect()
    }

    #[test]
    fn register_keeps_first_occurrence_order() {
        let mut registry = CompletionRegistry::new();
        let added = registry.register(tags(&["A", "B", "A", "C", "B"]));
        assert_eq!(added, 3);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.pending_entries(10), tags(&["A", "B", "C"]));
    }

    #[test]
    fn mark_completed_is_monotonic_and_idempotent() {
        let mut registry = CompletionRegistry::new();
        registry.register(tags(&["A"]));
        let a = TagId::from("A");

        assert!(registry.mark_completed(&a, Completion::Recorded));
        assert!(!registry.mark_completed(&a, Completion::Unreachable));
        assert_eq!(
            registry.status(&a),
            Some(EntryStatus::Completed(Completion::Recorded))
        );

        // Handles cannot be attached to completed entries either.
        assert!(!registry.attach_handle(&a, MonitoredHandle(1)));
    }

    #[test]
    fn mark_completed_on_unknown_tag_is_a_noop() {
        let mut registry = CompletionRegistry::new();
        registry.register(tags(&["A"]));
        assert!(!registry.mark_completed(&TagId::from("missing"), Completion::Recorded));
        assert!(!registry.is_all_completed());
    }

    #[test]
    fn pending_entries_skip_admitted_and_completed_tags() {
        let mut registry = CompletionRegistry::new();
        registry.register(tags(&["A", "B", "C", "D"]));
        registry.attach_handle(&TagId::from("A"), MonitoredHandle(1));
        registry.mark_completed(&TagId::from("B"), Completion::Recorded);

        assert_eq!(registry.pending_entries(1), tags(&["C"]));
        assert_eq!(registry.pending_entries(10), tags(&["C", "D"]));

        let admitted: Vec<_> = registry.admitted_pending().map(|e| e.tag.clone()).collect();
        assert_eq!(admitted, tags(&["A"]));
    }

    #[test]
    fn release_all_handles_keeps_completion_state() {
        let mut registry = CompletionRegistry::new();
        registry.register(tags(&["A", "B"]));
        registry.attach_handle(&TagId::from("A"), MonitoredHandle(1));
        registry.attach_handle(&TagId::from("B"), MonitoredHandle(2));
        registry.mark_completed(&TagId::from("B"), Completion::Recorded);

        assert_eq!(registry.release_all_handles(), 2);
        assert_eq!(registry.pending_entries(10), tags(&["A"]));
        assert_eq!(
            registry.status(&TagId::from("B")),
            Some(EntryStatus::Completed(Completion::Recorded))
        );
    }

    #[test]
    fn stale_counter_resets_on_verification() {
        let mut registry = CompletionRegistry::new();
        registry.register(tags(&["A"]));
        let a = TagId::from("A");

        // Unadmitted tags do not accumulate staleness.
        assert_eq!(registry.record_stale_cycle(&a), 0);

        registry.attach_handle(&a, MonitoredHandle(7));
        assert_eq!(registry.record_stale_cycle(&a), 1);
        assert_eq!(registry.record_stale_cycle(&a), 2);
        assert_eq!(registry.record_verification(&a), 1);
        assert_eq!(registry.get(&a).map(|e| e.stale_cycles), Some(0));
    }

    #[test]
    fn rejections_count_until_verified_or_attached() {
        let mut registry = CompletionRegistry::new();
        registry.register(tags(&["A", "B"]));
        let a = TagId::from("A");

        assert_eq!(registry.record_rejection(&a), 1);
        assert_eq!(registry.record_rejection(&a), 2);
        assert_eq!(registry.record_verification(&a), 1);
        assert_eq!(registry.get(&a).map(|e| e.rejections), Some(0));

        registry.record_rejection(&a);
        registry.attach_handle(&a, MonitoredHandle(3));
        assert_eq!(registry.get(&a).map(|e| e.rejections), Some(0));

        let b = TagId::from("B");
        registry.mark_completed(&b, Completion::Unreachable);
        assert_eq!(registry.record_rejection(&b), 0);
    }

    #[test]
    fn summary_counts_each_state() {
        let mut registry = CompletionRegistry::new();
        registry.register(tags(&["A", "B", "C", "D"]));
        registry.attach_handle(&TagId::from("A"), MonitoredHandle(1));
        registry.mark_completed(&TagId::from("B"), Completion::Recorded);
        registry.mark_completed(&TagId::from("C"), Completion::Unreachable);

        let summary = registry.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.admitted, 1);
        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.unreachable, 1);
        assert_eq!(summary.completed(), 2);
    }
}

use std::collections::BTreeSet;

use super::record::{Record, RecordId};

/// A primary record plus the secondary records grouped under it: one logical
/// piece of work. Rebuilt from scratch on every run, never persisted.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub primary: Record,
    /// Secondary members in discovery order. The order is load-bearing: it is
    /// what keeps sub-task ordering stable across runs.
    pub secondaries: Vec<Record>,
    /// Open records outside this unit that block one of its members.
    pub unresolved_blockers: BTreeSet<RecordId>,
    /// True for a unit synthesized around a record that had no eligible root
    /// and was not claimed by any other unit.
    pub orphan: bool,
}

impl WorkUnit {
    pub fn new(primary: Record) -> Self {
        Self {
            primary,
            secondaries: Vec::new(),
            unresolved_blockers: BTreeSet::new(),
            orphan: false,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.primary.id
    }

    pub fn title(&self) -> &str {
        &self.primary.title
    }

    /// Union of primary and secondary labels.
    pub fn labels(&self) -> BTreeSet<String> {
        let mut labels = self.primary.labels.clone();
        for secondary in &self.secondaries {
            labels.extend(secondary.labels.iter().cloned());
        }
        labels
    }

    /// True while some open record outside the unit still blocks a member.
    pub fn unresolved(&self) -> bool {
        !self.unresolved_blockers.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &Record> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.members().any(|r| &r.id == id)
    }
}

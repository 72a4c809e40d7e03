use std::collections::{HashSet, VecDeque};

use super::model::ProctoringViolation;

/// Append-only violation log, newest entry first.
///
/// Entries are never edited or removed during a session. Review marks are
/// kept beside the entries so the records themselves stay immutable.
#[derive(Debug, Default)]
pub struct ViolationLedger {
    entries: VecDeque<ProctoringViolation>,
    reviewed: HashSet<String>,
    revision: u64,
}

impl ViolationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, violation: ProctoringViolation) {
        self.entries.push_front(violation);
        self.revision += 1;
    }

    pub fn filter_by_student<'a>(
        &'a self,
        student_id: &'a str,
    ) -> impl Iterator<Item = &'a ProctoringViolation> + 'a {
        self.entries.iter().filter(move |v| v.student_id == student_id)
    }

    pub fn count_all(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProctoringViolation> {
        self.entries.iter()
    }

    pub fn get(&self, violation_id: &str) -> Option<&ProctoringViolation> {
        self.entries.iter().find(|v| v.id == violation_id)
    }

    /// Returns false for ids that are not in the ledger
    pub fn mark_reviewed(&mut self, violation_id: &str) -> bool {
        if self.get(violation_id).is_none() {
            return false;
        }
        if self.reviewed.insert(violation_id.to_string()) {
            self.revision += 1;
        }
        true
    }

    pub fn is_reviewed(&self, violation_id: &str) -> bool {
        self.reviewed.contains(violation_id)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

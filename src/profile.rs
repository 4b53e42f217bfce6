//! Interpreter class profiles
//!
//! A histogram of the classes seen at one bytecode (receiver classes at a
//! call, object classes at a cast). Both the guard selector and the cast
//! planner read it; neither trusts an entry without filtering it first.

use serde::{Deserialize, Serialize};

use crate::ids::ClassId;

/// One histogram bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub class: ClassId,
    pub count: u64,
}

/// Class histogram for a single bytecode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassProfile {
    entries: Vec<ProfileEntry>,
}

impl ClassProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` observations of `class`
    pub fn record(&mut self, class: ClassId, count: u64) {
        match self.entries.iter_mut().find(|e| e.class == class) {
            Some(entry) => entry.count += count,
            None => self.entries.push(ProfileEntry { class, count }),
        }
    }

    pub fn with(mut self, class: ClassId, count: u64) -> Self {
        self.record(class, count);
        self
    }

    /// Samples over every class, filtered or not
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries by descending count; ties keep first-seen order
    pub fn sorted(&self) -> Vec<ProfileEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| b.count.cmp(&a.count));
        entries
    }

    /// Fraction of all samples that hit `count`
    pub fn frequency(&self, count: u64) -> f64 {
        match self.total() {
            0 => 0.0,
            total => count as f64 / total as f64,
        }
    }
}

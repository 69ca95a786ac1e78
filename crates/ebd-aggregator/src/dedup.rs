//! Group checklist deduplication
//!
//! Observers birding together each submit a checklist sharing one
//! `GROUP IDENTIFIER`. Those checklists are one sampling event, so they must
//! count once in the sample denominator and once per species in the
//! observation count. A sampling unit is therefore:
//!
//! - `(location, date, group id)` when the group id is non-empty
//! - `(location, date, checklist id)` otherwise
//!
//! The location is carried separately in every aggregation key, so
//! [`SamplingUnit`] only encodes the date and the id. The engine counts
//! distinct units per group.

use chrono::NaiveDate;

/// Identity of one sampling event at a known location
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SamplingUnit(String);

impl SamplingUnit {
    pub fn new(date: NaiveDate, group_id: Option<&str>, checklist_id: &str) -> Self {
        match group_id.map(str::trim).filter(|g| !g.is_empty()) {
            Some(group) => Self(format!("G|{}|{}", date.format("%Y-%m-%d"), group)),
            None => Self(format!("S|{}|{}", date.format("%Y-%m-%d"), checklist_id.trim())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

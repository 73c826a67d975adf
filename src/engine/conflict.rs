use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::model::*;

/// Two appointments conflict when they are distinct, both active, booked on the
/// same inspector and date, and their half-open windows overlap.
pub fn conflicts_with(a: &Appointment, b: &Appointment) -> bool {
    a.id != b.id
        && a.inspector_id == b.inspector_id
        && a.date == b.date
        && a.is_active()
        && b.is_active()
        && a.window.overlaps(&b.window)
}

/// Every appointment in `existing` that collides with `candidate`, in input order.
/// An entry sharing the candidate's id is the candidate itself and never reported.
pub fn find_conflicts<'a>(candidate: &Appointment, existing: &'a [Appointment]) -> Vec<&'a Appointment> {
    existing
        .iter()
        .filter(|other| conflicts_with(candidate, other))
        .collect()
}

/// Unordered conflicting pair; `first.id < second.id`.
#[derive(Debug, Clone, Copy)]
pub struct ConflictPair<'a> {
    pub first: &'a Appointment,
    pub second: &'a Appointment,
}

impl<'a> ConflictPair<'a> {
    fn new(a: &'a Appointment, b: &'a Appointment) -> Self {
        if a.id <= b.id {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn ids(&self) -> (AppointmentId, AppointmentId) {
        (self.first.id, self.second.id)
    }

    pub fn contains(&self, id: &AppointmentId) -> bool {
        self.first.id == *id || self.second.id == *id
    }
}

impl PartialEq for ConflictPair<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ids() == other.ids()
    }
}

impl Eq for ConflictPair<'_> {}

/// All conflicting pairs in `appointments`, sorted by id pair.
///
/// Buckets by `(inspector, date)` and sweeps each bucket in start order, which
/// visits exactly the pairs a full pairwise comparison would report.
pub fn detect_all_conflicts(appointments: &[Appointment]) -> Vec<ConflictPair<'_>> {
    let mut buckets: HashMap<(InspectorId, NaiveDate), Vec<&Appointment>> = HashMap::new();
    for a in appointments.iter().filter(|a| a.is_active()) {
        buckets.entry((a.inspector_id, a.date)).or_default().push(a);
    }

    let mut pairs = Vec::new();
    for bucket in buckets.values_mut() {
        bucket.sort_by_key(|a| a.window.start);
        for (i, a) in bucket.iter().enumerate() {
            for b in &bucket[i + 1..] {
                // Sorted by start: once b starts at or after a ends, so do the rest.
                if b.window.start >= a.window.end {
                    break;
                }
                if conflicts_with(a, b) {
                    pairs.push(ConflictPair::new(a, b));
                }
            }
        }
    }

    pairs.sort_by_key(|p| p.ids());
    pairs.dedup();
    pairs
}

/// Ids of every appointment that takes part in at least one conflict.
pub fn conflicted_ids(appointments: &[Appointment]) -> HashSet<AppointmentId> {
    detect_all_conflicts(appointments)
        .into_iter()
        .flat_map(|p| [p.first.id, p.second.id])
        .collect()
}

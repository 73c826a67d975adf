use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::limits::MAX_INSPECTORS_PER_TENANT;
use crate::model::*;

use super::{EngineError, SharedSchedule};

/// In-memory system of record for one organization: a schedule per inspector
/// plus an appointment → inspector index. Mutated only through `apply_event`.
pub struct AppointmentStore {
    schedules: DashMap<InspectorId, SharedSchedule>,
    appointment_to_inspector: DashMap<AppointmentId, InspectorId>,
}

impl Default for AppointmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AppointmentStore {
    pub fn new() -> Self {
        Self {
            schedules: DashMap::new(),
            appointment_to_inspector: DashMap::new(),
        }
    }

    // ── Schedules ────────────────────────────────────────────

    pub fn inspector_count(&self) -> usize {
        self.schedules.len()
    }

    pub fn get_schedule(&self, inspector_id: &InspectorId) -> Option<SharedSchedule> {
        self.schedules.get(inspector_id).map(|e| e.value().clone())
    }

    /// Inspector ids are opaque: a schedule springs into existence on first use.
    pub fn schedule_or_create(&self, inspector_id: InspectorId) -> Result<SharedSchedule, EngineError> {
        if let Some(existing) = self.get_schedule(&inspector_id) {
            return Ok(existing);
        }
        if self.schedules.len() >= MAX_INSPECTORS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many inspectors"));
        }
        let entry = self
            .schedules
            .entry(inspector_id)
            .or_insert_with(|| Arc::new(RwLock::new(InspectorSchedule::new(inspector_id))));
        Ok(entry.value().clone())
    }

    pub fn inspector_ids(&self) -> Vec<InspectorId> {
        let mut ids: Vec<_> = self.schedules.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Appointment index ────────────────────────────────────

    pub fn contains_appointment(&self, id: &AppointmentId) -> bool {
        self.appointment_to_inspector.contains_key(id)
    }

    pub fn inspector_for(&self, id: &AppointmentId) -> Option<InspectorId> {
        self.appointment_to_inspector.get(id).map(|e| *e.value())
    }

    pub fn appointment_count(&self) -> usize {
        self.appointment_to_inspector.len()
    }

    // ── Event application ────────────────────────────────────

    /// Apply `event` to `target`, the schedule named by `event.inspector_id()`.
    /// `previous` is the old schedule when an update moves an appointment
    /// between inspectors; the caller holds every lock involved.
    pub fn apply_event(
        &self,
        target: &mut InspectorSchedule,
        previous: Option<&mut InspectorSchedule>,
        event: &Event,
    ) {
        match event {
            Event::AppointmentScheduled { appointment } => {
                target.insert(appointment.clone());
                self.appointment_to_inspector
                    .insert(appointment.id, appointment.inspector_id);
            }
            Event::AppointmentUpdated { appointment, .. } => {
                match previous {
                    Some(prev) => prev.remove(appointment.id),
                    None => target.remove(appointment.id),
                };
                target.insert(appointment.clone());
                self.appointment_to_inspector
                    .insert(appointment.id, appointment.inspector_id);
            }
            Event::AppointmentConfirmed { id, .. } => {
                if let Some(a) = target.get_mut(id) {
                    a.status = AppointmentStatus::Confirmed;
                }
            }
            Event::AppointmentCancelled { id, .. } => {
                if let Some(a) = target.get_mut(id) {
                    a.status = AppointmentStatus::Cancelled;
                }
            }
        }
    }
}

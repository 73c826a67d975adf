use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;
use crate::validate::{self, AppointmentDraft, ValidationError};

use super::conflict::{conflicted_ids, detect_all_conflicts, find_conflicts};
use super::{Engine, EngineError};

impl Engine {
    /// Dry run: what would this draft collide with if it were saved now?
    /// A draft carrying an existing id is treated as an edit of that appointment.
    pub async fn check(&self, draft: AppointmentDraft) -> Result<Vec<Appointment>, EngineError> {
        let candidate = validate::appointment(draft)?;
        let Some(schedule) = self.store.get_schedule(&candidate.inspector_id) else {
            return Ok(Vec::new());
        };
        let guard = schedule.read().await;
        Ok(find_conflicts(&candidate, guard.on_date(candidate.date))
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn get_appointment(&self, id: &AppointmentId) -> Option<Appointment> {
        let inspector_id = self.store.inspector_for(id)?;
        let schedule = self.store.get_schedule(&inspector_id)?;
        let guard = schedule.read().await;
        guard.get(id).cloned()
    }

    /// An inspector's appointments in date/start order, cancelled ones included.
    pub async fn list_appointments(
        &self,
        inspector_id: InspectorId,
        date: Option<NaiveDate>,
    ) -> Vec<Appointment> {
        let Some(schedule) = self.store.get_schedule(&inspector_id) else {
            return Vec::new();
        };
        let guard = schedule.read().await;
        match date {
            Some(d) => guard.on_date(d).to_vec(),
            None => guard.appointments.clone(),
        }
    }

    /// Schedule rows annotated with a computed `has_conflict` flag.
    pub async fn schedule_view(
        &self,
        inspector_id: InspectorId,
        date: Option<NaiveDate>,
    ) -> Vec<ScheduleEntry> {
        let appointments = self.list_appointments(inspector_id, date).await;
        let flagged = conflicted_ids(&appointments);
        appointments
            .into_iter()
            .map(|appointment| ScheduleEntry {
                has_conflict: flagged.contains(&appointment.id),
                appointment,
            })
            .collect()
    }

    /// Every conflicting pair, optionally narrowed to one inspector and/or date.
    /// Pairs come back sorted by inspector, then by id.
    pub async fn conflicts(
        &self,
        inspector_id: Option<InspectorId>,
        date: Option<NaiveDate>,
    ) -> Vec<(Appointment, Appointment)> {
        let inspectors = match inspector_id {
            Some(id) => vec![id],
            None => self.store.inspector_ids(),
        };

        let mut pairs = Vec::new();
        for id in inspectors {
            let appointments = self.list_appointments(id, date).await;
            pairs.extend(
                detect_all_conflicts(&appointments)
                    .into_iter()
                    .map(|p| (p.first.clone(), p.second.clone())),
            );
        }
        pairs
    }

    /// Active appointments and booked minutes for an inspector over `[from, to]`.
    pub async fn workload(
        &self,
        inspector_id: InspectorId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<InspectorWorkload, EngineError> {
        if from > to {
            return Err(ValidationError::InvalidRange { from, to }.into());
        }
        if to.signed_duration_since(from).num_days() >= MAX_WORKLOAD_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("workload range too wide"));
        }

        let mut workload = InspectorWorkload {
            inspector_id,
            from,
            to,
            appointments: 0,
            booked_minutes: 0,
        };
        if let Some(schedule) = self.store.get_schedule(&inspector_id) {
            let guard = schedule.read().await;
            for a in guard.between(from, to).iter().filter(|a| a.is_active()) {
                workload.appointments += 1;
                workload.booked_minutes += a.window.duration_minutes();
            }
        }
        Ok(workload)
    }

    pub fn inspector_ids(&self) -> Vec<InspectorId> {
        self.store.inspector_ids()
    }

    pub fn appointment_count(&self) -> usize {
        self.store.appointment_count()
    }
}

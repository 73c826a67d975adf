use tokio::sync::oneshot;

use crate::backup::{self, DeliveryTicket};
use crate::limits::*;
use crate::model::*;
use crate::validate::{self, AppointmentChanges, AppointmentDraft};

use super::conflict::find_conflicts;
use super::{ConflictPolicy, ConflictWarning, Engine, EngineError, WalCommand, WriteOutcome};

impl Engine {
    /// Book a new appointment. Under the advisory policy an overlap is reported,
    /// not refused.
    pub async fn schedule(&self, draft: AppointmentDraft) -> Result<WriteOutcome, EngineError> {
        let appointment = validate::appointment(draft)?;
        if self.store.contains_appointment(&appointment.id) {
            return Err(EngineError::AlreadyExists(appointment.id));
        }
        let schedule = self.store.schedule_or_create(appointment.inspector_id)?;

        let (event, warning, ticket) = {
            let _gate = self.write_gate.read().await;
            let mut guard = schedule.write().await;
            if self.store.contains_appointment(&appointment.id) {
                return Err(EngineError::AlreadyExists(appointment.id));
            }
            ensure_capacity(&guard)?;
            let warning = self.evaluate(&appointment, guard.on_date(appointment.date))?;
            let event = Event::AppointmentScheduled {
                appointment: appointment.clone(),
            };
            self.persist_and_apply(&mut guard, None, &event).await?;
            (event, warning, self.delivery.ticket(appointment.id))
        };

        Ok(self.complete(event, appointment, warning, ticket).await)
    }

    /// Edit time, date, inspector or details of an active appointment.
    pub async fn reschedule(
        &self,
        id: AppointmentId,
        changes: AppointmentChanges,
    ) -> Result<WriteOutcome, EngineError> {
        let current_inspector = self
            .store
            .inspector_for(&id)
            .ok_or(EngineError::NotFound(id))?;
        let target_inspector = changes.inspector_id.unwrap_or(current_inspector);

        if target_inspector == current_inspector {
            let (event, next, warning, ticket) = {
                let _gate = self.write_gate.read().await;
                let mut guard = self.resolve_write(&id).await?;
                let current = active_appointment(&guard, &id)?;
                let next = validate::apply_changes(&current, changes)?;
                let warning = self.evaluate(&next, guard.on_date(next.date))?;
                let event = Event::AppointmentUpdated {
                    previous_inspector: current_inspector,
                    appointment: next.clone(),
                };
                self.persist_and_apply(&mut guard, None, &event).await?;
                (event, next, warning, self.delivery.ticket(id))
            };
            return Ok(self.complete(event, next, warning, ticket).await);
        }

        let source = self
            .store
            .get_schedule(&current_inspector)
            .ok_or(EngineError::NotFound(id))?;
        let target = self.store.schedule_or_create(target_inspector)?;

        let (event, next, warning, ticket) = {
            let _gate = self.write_gate.read().await;
            // Sorted lock order, same as every other multi-schedule writer.
            let (mut source_guard, mut target_guard) = if current_inspector < target_inspector {
                let s = source.clone().write_owned().await;
                let t = target.clone().write_owned().await;
                (s, t)
            } else {
                let t = target.clone().write_owned().await;
                let s = source.clone().write_owned().await;
                (s, t)
            };
            let current = active_appointment(&source_guard, &id)?;
            ensure_capacity(&target_guard)?;
            let next = validate::apply_changes(&current, changes)?;
            let warning = self.evaluate(&next, target_guard.on_date(next.date))?;
            let event = Event::AppointmentUpdated {
                previous_inspector: current_inspector,
                appointment: next.clone(),
            };
            self.persist_and_apply(&mut target_guard, Some(&mut *source_guard), &event)
                .await?;
            (event, next, warning, self.delivery.ticket(id))
        };

        Ok(self.complete(event, next, warning, ticket).await)
    }

    /// `tentative -> confirmed`. Overlaps that still stand are reported again.
    pub async fn confirm(&self, id: AppointmentId) -> Result<WriteOutcome, EngineError> {
        let (event, next, warning, ticket) = {
            let _gate = self.write_gate.read().await;
            let mut guard = self.resolve_write(&id).await?;
            let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
            let status = current
                .status
                .confirm()
                .map_err(|(from, to)| EngineError::InvalidTransition { id, from, to })?;
            let next = Appointment { status, ..current };
            let warning = self.evaluate(&next, guard.on_date(next.date))?;
            let event = Event::AppointmentConfirmed {
                id,
                inspector_id: next.inspector_id,
            };
            self.persist_and_apply(&mut guard, None, &event).await?;
            (event, next, warning, self.delivery.ticket(id))
        };
        Ok(self.complete(event, next, warning, ticket).await)
    }

    /// Cancel. The appointment stays in history but no longer blocks its slot.
    pub async fn cancel(&self, id: AppointmentId) -> Result<WriteOutcome, EngineError> {
        let (event, next, ticket) = {
            let _gate = self.write_gate.read().await;
            let mut guard = self.resolve_write(&id).await?;
            let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
            let status = current
                .status
                .cancel()
                .map_err(|(from, to)| EngineError::InvalidTransition { id, from, to })?;
            let next = Appointment { status, ..current };
            let event = Event::AppointmentCancelled {
                id,
                inspector_id: next.inspector_id,
            };
            self.persist_and_apply(&mut guard, None, &event).await?;
            (event, next, self.delivery.ticket(id))
        };
        Ok(self.complete(event, next, None, ticket).await)
    }

    /// Run the conflict rule for `candidate` against the slice it would join.
    fn evaluate(
        &self,
        candidate: &Appointment,
        existing: &[Appointment],
    ) -> Result<Option<ConflictWarning>, EngineError> {
        let hits = find_conflicts(candidate, existing);
        if hits.is_empty() {
            return Ok(None);
        }
        metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL).increment(hits.len() as u64);
        let warning = ConflictWarning {
            appointment_id: candidate.id,
            conflicts_with: hits.into_iter().cloned().collect(),
        };
        match self.policy {
            ConflictPolicy::Reject => {
                metrics::counter!(crate::observability::CONFLICT_REJECTIONS_TOTAL).increment(1);
                tracing::info!("rejected {warning}");
                Err(EngineError::Conflict(warning.ids()))
            }
            ConflictPolicy::Advisory => {
                tracing::info!("{warning} (advisory)");
                Ok(Some(warning))
            }
        }
    }

    /// Post-commit: mirror to the backup sink. Runs with no schedule lock held;
    /// `ticket` keeps mirror writes of one appointment in commit order.
    async fn complete(
        &self,
        event: Event,
        appointment: Appointment,
        warning: Option<ConflictWarning>,
        ticket: DeliveryTicket,
    ) -> WriteOutcome {
        metrics::counter!(crate::observability::APPOINTMENT_WRITES_TOTAL, "event" => event.kind())
            .increment(1);
        let backup =
            backup::deliver_in_order(self.backup.as_ref(), ticket, &event, &appointment).await;
        WriteOutcome {
            appointment,
            warning,
            backup,
        }
    }

    /// Rewrite the WAL as one `AppointmentScheduled` per stored appointment.
    ///
    /// Holds the write gate until the new log is in place, so no write can land
    /// in the old log after its snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut guards = Vec::new();
        for inspector_id in self.store.inspector_ids() {
            if let Some(schedule) = self.store.get_schedule(&inspector_id) {
                guards.push(schedule.read_owned().await);
            }
        }

        let events: Vec<Event> = guards
            .iter()
            .flat_map(|g| g.appointments.iter())
            .map(|a| Event::AppointmentScheduled {
                appointment: a.clone(),
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Cancelled appointments free an active slot but still count toward history.
pub(super) fn ensure_capacity(schedule: &InspectorSchedule) -> Result<(), EngineError> {
    if schedule.appointments.len() >= MAX_HISTORY_PER_INSPECTOR {
        return Err(EngineError::LimitExceeded("inspector history is full"));
    }
    if schedule.active_count() >= MAX_APPOINTMENTS_PER_INSPECTOR {
        return Err(EngineError::LimitExceeded("too many appointments for inspector"));
    }
    Ok(())
}

fn active_appointment(
    schedule: &InspectorSchedule,
    id: &AppointmentId,
) -> Result<Appointment, EngineError> {
    let current = schedule.get(id).cloned().ok_or(EngineError::NotFound(*id))?;
    if !current.is_active() {
        return Err(EngineError::Cancelled(*id));
    }
    Ok(current)
}

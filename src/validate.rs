//! Boundary checks run before an appointment ever reaches conflict detection.

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::MAX_DETAIL_LEN;
use crate::model::*;

/// An appointment as received from a caller, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentDraft {
    pub id: Option<AppointmentId>,
    pub inspector_id: Option<InspectorId>,
    pub date: Option<NaiveDate>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub status: Option<AppointmentStatus>,
    pub details: AppointmentDetails,
}

/// An edit request. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentChanges {
    pub inspector_id: Option<InspectorId>,
    pub date: Option<NaiveDate>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub property: Option<String>,
    pub client: Option<String>,
    pub notes: Option<String>,
}

impl AppointmentChanges {
    pub fn is_empty(&self) -> bool {
        *self == AppointmentChanges::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Missing(&'static str),
    InvalidWindow { start: NaiveTime, end: NaiveTime },
    CancelledOnCreate,
    TooLong(&'static str),
    NothingToChange,
    InvalidRange { from: NaiveDate, to: NaiveDate },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Missing(field) => write!(f, "missing field: {field}"),
            ValidationError::InvalidWindow { start, end } => {
                write!(f, "start {start} must be before end {end}")
            }
            ValidationError::CancelledOnCreate => {
                write!(f, "an appointment cannot be created as cancelled")
            }
            ValidationError::TooLong(field) => {
                write!(f, "{field} longer than {MAX_DETAIL_LEN} bytes")
            }
            ValidationError::NothingToChange => write!(f, "edit request changes nothing"),
            ValidationError::InvalidRange { from, to } => {
                write!(f, "range start {from} is after end {to}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Turn a draft into a well-formed appointment, or say why it isn't one.
pub fn appointment(draft: AppointmentDraft) -> Result<Appointment, ValidationError> {
    let inspector_id = draft
        .inspector_id
        .filter(|id| !id.is_nil())
        .ok_or(ValidationError::Missing("inspector_id"))?;
    let date = draft.date.ok_or(ValidationError::Missing("date"))?;
    let start = draft.start.ok_or(ValidationError::Missing("start_time"))?;
    let end = draft.end.ok_or(ValidationError::Missing("end_time"))?;
    let window = window(start, end)?;

    let status = draft.status.unwrap_or(AppointmentStatus::Tentative);
    if !status.is_active() {
        return Err(ValidationError::CancelledOnCreate);
    }
    details(&draft.details)?;

    Ok(Appointment {
        id: draft.id.unwrap_or_else(Ulid::new),
        inspector_id,
        date,
        window,
        status,
        details: draft.details,
    })
}

/// Apply an edit to `current`, producing the candidate to re-check.
pub fn apply_changes(
    current: &Appointment,
    changes: AppointmentChanges,
) -> Result<Appointment, ValidationError> {
    if changes.is_empty() {
        return Err(ValidationError::NothingToChange);
    }
    let mut next = current.clone();
    if let Some(inspector_id) = changes.inspector_id {
        if inspector_id.is_nil() {
            return Err(ValidationError::Missing("inspector_id"));
        }
        next.inspector_id = inspector_id;
    }
    if let Some(date) = changes.date {
        next.date = date;
    }
    next.window = window(
        changes.start.unwrap_or(current.window.start),
        changes.end.unwrap_or(current.window.end),
    )?;
    if changes.property.is_some() {
        next.details.property = changes.property;
    }
    if changes.client.is_some() {
        next.details.client = changes.client;
    }
    if changes.notes.is_some() {
        next.details.notes = changes.notes;
    }
    details(&next.details)?;
    Ok(next)
}

fn window(start: NaiveTime, end: NaiveTime) -> Result<TimeWindow, ValidationError> {
    if start >= end {
        return Err(ValidationError::InvalidWindow { start, end });
    }
    Ok(TimeWindow::new(start, end))
}

fn details(d: &AppointmentDetails) -> Result<(), ValidationError> {
    for (field, value) in [
        ("property", &d.property),
        ("client", &d.client),
        ("notes", &d.notes),
    ] {
        if value.as_ref().is_some_and(|v| v.len() > MAX_DETAIL_LEN) {
            return Err(ValidationError::TooLong(field));
        }
    }
    Ok(())
}

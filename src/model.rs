use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type AppointmentId = Ulid;
pub type InspectorId = Ulid;

/// Half-open time-of-day window `[start, end)` inside a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Tentative,
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    /// Tentative and confirmed appointments take part in conflict checks.
    pub fn is_active(self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    /// `tentative -> confirmed`. Anything else is rejected.
    pub fn confirm(self) -> Result<Self, (Self, Self)> {
        match self {
            AppointmentStatus::Tentative => Ok(AppointmentStatus::Confirmed),
            other => Err((other, AppointmentStatus::Confirmed)),
        }
    }

    /// `tentative | confirmed -> cancelled`. Nothing leaves `cancelled`.
    pub fn cancel(self) -> Result<Self, (Self, Self)> {
        match self {
            AppointmentStatus::Tentative | AppointmentStatus::Confirmed => {
                Ok(AppointmentStatus::Cancelled)
            }
            AppointmentStatus::Cancelled => Err((self, AppointmentStatus::Cancelled)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Tentative => "tentative",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tentative" => Ok(AppointmentStatus::Tentative),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Opaque payload carried with an appointment. Never looked at by conflict detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentDetails {
    pub property: Option<String>,
    pub client: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub inspector_id: InspectorId,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub status: AppointmentStatus,
    pub details: AppointmentDetails,
}

impl Appointment {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    fn sort_key(&self) -> (NaiveDate, NaiveTime) {
        (self.date, self.window.start)
    }
}

/// All appointments booked against one inspector, history included.
#[derive(Debug, Clone)]
pub struct InspectorSchedule {
    pub inspector_id: InspectorId,
    /// Sorted by `(date, window.start)`.
    pub appointments: Vec<Appointment>,
}

impl InspectorSchedule {
    pub fn new(inspector_id: InspectorId) -> Self {
        Self {
            inspector_id,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `(date, window.start)`.
    pub fn insert(&mut self, appointment: Appointment) {
        let key = appointment.sort_key();
        let pos = self
            .appointments
            .partition_point(|a| a.sort_key() <= key);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: AppointmentId) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: &AppointmentId) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &AppointmentId) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Every appointment on `date`, in start order.
    pub fn on_date(&self, date: NaiveDate) -> &[Appointment] {
        let lo = self.appointments.partition_point(|a| a.date < date);
        let hi = self.appointments.partition_point(|a| a.date <= date);
        &self.appointments[lo..hi]
    }

    /// Every appointment with `from <= date <= to`.
    pub fn between(&self, from: NaiveDate, to: NaiveDate) -> &[Appointment] {
        let lo = self.appointments.partition_point(|a| a.date < from);
        let hi = self.appointments.partition_point(|a| a.date <= to);
        if lo >= hi {
            return &[];
        }
        &self.appointments[lo..hi]
    }

    pub fn active_count(&self) -> usize {
        self.appointments.iter().filter(|a| a.is_active()).count()
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentScheduled {
        appointment: Appointment,
    },
    AppointmentUpdated {
        previous_inspector: InspectorId,
        appointment: Appointment,
    },
    AppointmentConfirmed {
        id: AppointmentId,
        inspector_id: InspectorId,
    },
    AppointmentCancelled {
        id: AppointmentId,
        inspector_id: InspectorId,
    },
}

impl Event {
    /// The inspector whose schedule holds the appointment after this event.
    pub fn inspector_id(&self) -> InspectorId {
        match self {
            Event::AppointmentScheduled { appointment }
            | Event::AppointmentUpdated { appointment, .. } => appointment.inspector_id,
            Event::AppointmentConfirmed { inspector_id, .. }
            | Event::AppointmentCancelled { inspector_id, .. } => *inspector_id,
        }
    }

    pub fn appointment_id(&self) -> AppointmentId {
        match self {
            Event::AppointmentScheduled { appointment }
            | Event::AppointmentUpdated { appointment, .. } => appointment.id,
            Event::AppointmentConfirmed { id, .. } | Event::AppointmentCancelled { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::AppointmentScheduled { .. } => "scheduled",
            Event::AppointmentUpdated { .. } => "updated",
            Event::AppointmentConfirmed { .. } => "confirmed",
            Event::AppointmentCancelled { .. } => "cancelled",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A schedule row together with its computed conflict flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub appointment: Appointment,
    pub has_conflict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorWorkload {
    pub inspector_id: InspectorId,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub appointments: usize,
    pub booked_minutes: i64,
}

#[cfg(test)]
pub(crate) fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

#[cfg(test)]
pub(crate) fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

use crate::model::{Appointment, AppointmentId, AppointmentStatus};
use crate::validate::ValidationError;

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    NotFound(AppointmentId),
    AlreadyExists(AppointmentId),
    InvalidTransition {
        id: AppointmentId,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Cancelled appointments are history and cannot be edited.
    Cancelled(AppointmentId),
    /// Only raised under `ConflictPolicy::Reject`.
    Conflict(Vec<AppointmentId>),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "invalid appointment: {e}"),
            EngineError::NotFound(id) => write!(f, "appointment not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "appointment already exists: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "appointment {id} cannot go from {from} to {to}")
            }
            EngineError::Cancelled(id) => write!(f, "appointment {id} is cancelled"),
            EngineError::Conflict(ids) => {
                write!(f, "inspector double-booked with: {}", join_ids(ids))
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

/// Soft outcome of a write: the saved appointment overlaps others on the same inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictWarning {
    pub appointment_id: AppointmentId,
    pub conflicts_with: Vec<Appointment>,
}

impl ConflictWarning {
    pub fn ids(&self) -> Vec<AppointmentId> {
        self.conflicts_with.iter().map(|a| a.id).collect()
    }
}

impl std::fmt::Display for ConflictWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "appointment {} overlaps {}",
            self.appointment_id,
            join_ids(&self.ids())
        )
    }
}

/// A backup/notification side effect failed after the write committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationFailure {
    pub sink: &'static str,
    pub attempts: u32,
    pub message: String,
}

impl std::fmt::Display for IntegrationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} backup failed after {} attempt(s): {}",
            self.sink, self.attempts, self.message
        )
    }
}

pub(crate) fn join_ids(ids: &[AppointmentId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::engine::IntegrationFailure;
use crate::limits::{BACKUP_ATTEMPTS, BACKUP_RETRY_DELAY_MS};
use crate::model::{Appointment, AppointmentId, Event};

#[derive(Debug)]
pub enum BackupError {
    Io(std::io::Error),
    Encode(serde_json::Error),
    Rejected(String),
}

impl std::fmt::Display for BackupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupError::Io(e) => write!(f, "io: {e}"),
            BackupError::Encode(e) => write!(f, "encode: {e}"),
            BackupError::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

impl std::error::Error for BackupError {}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        BackupError::Io(e)
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Encode(e)
    }
}

/// Receives every committed appointment write (e.g. a Drive/Calendar mirror).
/// A failure here is reported to the caller but never undoes the write.
#[async_trait]
pub trait BackupSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// `appointment` is the state after `event` was applied.
    async fn record(&self, event: &Event, appointment: &Appointment) -> Result<(), BackupError>;
}

pub struct NoopSink;

#[async_trait]
impl BackupSink for NoopSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn record(&self, _event: &Event, _appointment: &Appointment) -> Result<(), BackupError> {
        Ok(())
    }
}

/// Mirrors each appointment as JSON at `<root>/<inspector>/<date>/<appointment>.json`.
/// A reschedule to another inspector or date leaves the old file in place as history.
pub struct DirectorySink {
    root: PathBuf,
}

#[derive(Serialize)]
struct BackupRecord<'a> {
    event: &'static str,
    appointment: &'a Appointment,
}

impl DirectorySink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, appointment: &Appointment) -> PathBuf {
        self.root
            .join(appointment.inspector_id.to_string())
            .join(appointment.date.format("%Y-%m-%d").to_string())
            .join(format!("{}.json", appointment.id))
    }
}

#[async_trait]
impl BackupSink for DirectorySink {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn record(&self, event: &Event, appointment: &Appointment) -> Result<(), BackupError> {
        let path = self.path_for(appointment);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec_pretty(&BackupRecord {
            event: event.kind(),
            appointment,
        })?;
        let tmp = path.with_extension(format!("json.{}.tmp", Ulid::new()));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Orders mirror writes per appointment by commit sequence.
///
/// A ticket must be taken while the appointment's schedule is write-locked,
/// so ticket order equals commit order.
#[derive(Default)]
pub struct DeliveryOrder {
    next_seq: AtomicU64,
    /// Last delivered sequence per appointment.
    slots: DashMap<AppointmentId, Arc<Mutex<u64>>>,
}

pub struct DeliveryTicket {
    seq: u64,
    slot: Arc<Mutex<u64>>,
}

impl DeliveryOrder {
    pub fn ticket(&self, id: AppointmentId) -> DeliveryTicket {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = self.slots.entry(id).or_default().clone();
        DeliveryTicket { seq, slot }
    }

    /// Drop slots no ticket refers to.
    pub fn prune(&self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Deliver unless a later write of the same appointment already reached the sink.
pub async fn deliver_in_order(
    sink: &dyn BackupSink,
    ticket: DeliveryTicket,
    event: &Event,
    appointment: &Appointment,
) -> Option<IntegrationFailure> {
    let mut delivered = ticket.slot.lock().await;
    if *delivered > ticket.seq {
        tracing::debug!("skipping stale backup of {} ({})", appointment.id, event.kind());
        return None;
    }
    let failure = deliver(sink, event, appointment).await;
    *delivered = ticket.seq;
    failure
}

/// Run the sink with bounded retries. `None` means the backup landed.
pub async fn deliver(
    sink: &dyn BackupSink,
    event: &Event,
    appointment: &Appointment,
) -> Option<IntegrationFailure> {
    let start = std::time::Instant::now();
    let mut last_err = None;
    for attempt in 1..=BACKUP_ATTEMPTS {
        match sink.record(event, appointment).await {
            Ok(()) => {
                metrics::histogram!(crate::observability::BACKUP_DURATION_SECONDS)
                    .record(start.elapsed().as_secs_f64());
                return None;
            }
            Err(e) => {
                tracing::debug!(
                    "backup attempt {attempt}/{BACKUP_ATTEMPTS} to {} failed for {}: {e}",
                    sink.name(),
                    appointment.id
                );
                last_err = Some(e);
                if attempt < BACKUP_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(BACKUP_RETRY_DELAY_MS * attempt as u64)).await;
                }
            }
        }
    }

    let message = last_err.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
    tracing::warn!(
        "backup to {} failed for appointment {}: {message}",
        sink.name(),
        appointment.id
    );
    metrics::counter!(crate::observability::BACKUP_FAILURES_TOTAL, "sink" => sink.name())
        .increment(1);
    Some(IntegrationFailure {
        sink: sink.name(),
        attempts: BACKUP_ATTEMPTS,
        message,
    })
}

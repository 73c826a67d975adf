mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use conflict::{conflicted_ids, conflicts_with, detect_all_conflicts, find_conflicts, ConflictPair};
pub use error::{ConflictWarning, EngineError, IntegrationFailure};
pub(crate) use error::join_ids;
pub use store::AppointmentStore;

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::backup::{BackupSink, DeliveryOrder};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<InspectorSchedule>>;

/// What to do when a write would double-book an inspector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Commit and report a `ConflictWarning`.
    #[default]
    Advisory,
    /// Refuse with `EngineError::Conflict`.
    Reject,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "advisory" | "warn" => Ok(ConflictPolicy::Advisory),
            "reject" | "block" => Ok(ConflictPolicy::Reject),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Result of every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub appointment: Appointment,
    pub warning: Option<ConflictWarning>,
    pub backup: Option<IntegrationFailure>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that arrive while one is pending share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after an append error so half-written bytes don't bleed into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

fn replay_contended(_: tokio::sync::TryLockError) -> io::Error {
    io::Error::other("replay: schedule unexpectedly locked")
}

/// Scheduling engine for one organization.
pub struct Engine {
    pub(super) store: AppointmentStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) backup: Arc<dyn BackupSink>,
    pub(super) delivery: DeliveryOrder,
    pub(super) policy: ConflictPolicy,
    /// Held shared by every mutation from lock acquisition through apply,
    /// exclusively by compaction.
    pub(super) write_gate: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        backup: Arc<dyn BackupSink>,
        policy: ConflictPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: AppointmentStore::new(),
            wal_tx,
            notify,
            backup,
            delivery: DeliveryOrder::default(),
            policy,
            write_gate: RwLock::new(()),
        };

        // Sole owner of every schedule during replay, so try_write never contends.
        // blocking_write would panic here: replay can run inside the runtime.
        for event in &events {
            let target = engine
                .store
                .schedule_or_create(event.inspector_id())
                .map_err(|e| io::Error::other(e.to_string()))?;
            let mut target_guard = target.try_write().map_err(replay_contended)?;
            match event {
                Event::AppointmentUpdated { previous_inspector, appointment }
                    if *previous_inspector != appointment.inspector_id =>
                {
                    let prev = engine
                        .store
                        .schedule_or_create(*previous_inspector)
                        .map_err(|e| io::Error::other(e.to_string()))?;
                    let mut prev_guard = prev.try_write().map_err(replay_contended)?;
                    engine.store.apply_event(&mut target_guard, Some(&mut *prev_guard), event);
                }
                _ => engine.store.apply_event(&mut target_guard, None, event),
            }
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} appointments across {} inspectors",
                events.len(),
                engine.store.appointment_count(),
                engine.store.inspector_count()
            );
        }

        Ok(engine)
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Forget backup ordering state for appointments with no delivery in flight.
    pub fn prune_delivery_slots(&self) {
        self.delivery.prune();
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply, notify. Caller holds the write lock on every schedule passed in.
    pub(super) async fn persist_and_apply(
        &self,
        target: &mut InspectorSchedule,
        previous: Option<&mut InspectorSchedule>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let moved_from = previous.as_ref().map(|p| p.inspector_id);
        self.store.apply_event(target, previous, event);
        self.notify.send(target.inspector_id, event);
        if let Some(prev_id) = moved_from {
            self.notify.send(prev_id, event);
        }
        Ok(())
    }

    /// Lookup appointment → inspector, acquire that schedule's write lock.
    ///
    /// A cross-inspector move can land while we wait for the lock, so the
    /// index is checked again once the lock is held.
    pub(super) async fn resolve_write(
        &self,
        id: &AppointmentId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<InspectorSchedule>, EngineError> {
        for _ in 0..2 {
            let inspector_id = self
                .store
                .inspector_for(id)
                .ok_or(EngineError::NotFound(*id))?;
            let schedule = self
                .store
                .get_schedule(&inspector_id)
                .ok_or(EngineError::NotFound(*id))?;
            let guard = schedule.write_owned().await;
            if self.store.inspector_for(id) == Some(inspector_id) {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(*id))
    }
}

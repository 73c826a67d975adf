use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::info;

use crate::backup::{BackupSink, DirectorySink, NoopSink};
use crate::compactor;
use crate::config::Config;
use crate::engine::{ConflictPolicy, Engine};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Per-organization settings shared by every tenant engine.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub conflict_policy: ConflictPolicy,
    pub backup_dir: Option<PathBuf>,
}

impl From<&Config> for TenantSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            data_dir: cfg.data_dir.clone(),
            compact_threshold: cfg.compact_threshold,
            conflict_policy: cfg.conflict_policy,
            backup_dir: cfg.backup_dir.clone(),
        }
    }
}

/// One engine + WAL + compactor per organization.
/// Organization = database name on the pgwire connection. The name is used
/// verbatim as the WAL file stem, so distinct organizations never share a log.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    settings: TenantSettings,
    /// Serializes engine creation so a WAL is never opened twice.
    creating: Mutex<()>,
}

impl TenantManager {
    pub fn new(settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            settings,
            creating: Mutex::new(()),
        }
    }

    /// Get or lazily create the engine for an organization.
    pub fn get_or_create(&self, org: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(org) {
            return Ok(engine.value().clone());
        }
        check_name(org)?;

        let _creating = self
            .creating
            .lock()
            .map_err(|_| io::Error::other("organization registry poisoned"))?;
        if let Some(engine) = self.engines.get(org) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many organizations"));
        }

        let engine = Arc::new(self.open_engine(org)?);
        let compactor_engine = engine.clone();
        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(org.to_string(), engine.clone());
        info!(
            "opened organization {org}: {} appointments, {:?} conflict policy",
            engine.appointment_count(),
            engine.policy()
        );
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    fn open_engine(&self, file_stem: &str) -> io::Result<Engine> {
        let wal_path = self.settings.data_dir.join(format!("{file_stem}.wal"));
        let backup: Arc<dyn BackupSink> = match &self.settings.backup_dir {
            Some(root) => Arc::new(DirectorySink::new(root.join(file_stem))),
            None => Arc::new(NoopSink),
        };
        Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            backup,
            self.settings.conflict_policy,
        )
    }

    /// Every loaded engine, for shutdown.
    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines.iter().map(|e| e.value().clone()).collect()
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

/// Organization names become file names as-is. Anything that would need
/// rewriting to be path-safe is refused, since two rewritten names could land
/// on the same log. Uppercase is refused too: case-insensitive filesystems
/// would fold `Acme` and `acme` together.
fn check_name(org: &str) -> io::Result<()> {
    if org.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty organization name",
        ));
    }
    if org.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "organization name too long",
        ));
    }
    if let Some(bad) = org
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "invalid character {bad:?} in organization name (use a-z, 0-9, '_' or '-')"
            ),
        ));
    }
    Ok(())
}

use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::ConflictPolicy;

/// Process configuration, read from `INSPECTA_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites a tenant's log.
    pub compact_threshold: u64,
    pub conflict_policy: ConflictPolicy,
    /// Root of the JSON backup mirror. Backups are skipped when unset.
    pub backup_dir: Option<PathBuf>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "inspecta".into(),
            max_connections: 256,
            compact_threshold: 1000,
            conflict_policy: ConflictPolicy::Advisory,
            backup_dir: None,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let d = Config::default();
        Ok(Self {
            bind: lookup("INSPECTA_BIND").unwrap_or(d.bind),
            port: parse(&lookup, "INSPECTA_PORT")?.unwrap_or(d.port),
            data_dir: lookup("INSPECTA_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("INSPECTA_PASSWORD").unwrap_or(d.password),
            max_connections: parse(&lookup, "INSPECTA_MAX_CONNECTIONS")?
                .unwrap_or(d.max_connections),
            compact_threshold: parse(&lookup, "INSPECTA_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            conflict_policy: parse(&lookup, "INSPECTA_CONFLICT_POLICY")?
                .unwrap_or(d.conflict_policy),
            backup_dir: lookup("INSPECTA_BACKUP_DIR").map(PathBuf::from),
            tls_cert: lookup("INSPECTA_TLS_CERT"),
            tls_key: lookup("INSPECTA_TLS_KEY"),
            metrics_port: parse(&lookup, "INSPECTA_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{key}={raw}: {e}")),
    }
}

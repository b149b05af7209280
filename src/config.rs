use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiverError, Result};

/// Upper bound for any configured duration: one hundred years.
pub const MAX_DURATION_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Daemon configuration, read from a camelCase JSON file.
///
/// Every field has a default, so an empty object is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Identity written into claims. Must be unique per running instance.
    pub identity: String,
    /// Only consider jobs owned by this account uuid.
    pub job_owner: Option<String>,
    #[serde(rename = "pollInterval")]
    pub poll_interval_ms: u64,
    /// Age after which an unrenewed claim may be taken over.
    #[serde(rename = "takeoverTime")]
    pub takeover_time_ms: u64,
    /// Retention after archival before the job record is purged.
    #[serde(rename = "lingerTime")]
    pub linger_time_ms: u64,
    pub queue_limit: usize,
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    pub heartbeat_retries: u32,
    /// Consecutive fetch rounds without a new record before an export fails.
    pub export_stall_limit: u32,
    pub scratch_dir: PathBuf,
    /// Root of the administrative archive namespace.
    pub admin_root: String,
    pub database_path: PathBuf,
    pub store_root: PathBuf,
    /// Owner uuid → login, served by the static identity service.
    pub accounts: BTreeMap<String, String>,
    pub status_addr: Option<SocketAddr>,
    pub log_level: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            job_owner: std::env::var("WRASSE_JOB_OWNER").ok(),
            poll_interval_ms: 10_000,
            takeover_time_ms: 30 * 60 * 1000,
            linger_time_ms: 4 * 60 * 60 * 1000,
            queue_limit: 10,
            heartbeat_interval_ms: 500,
            heartbeat_retries: 3,
            export_stall_limit: 3,
            scratch_dir: PathBuf::from("/var/tmp/wrasse"),
            admin_root: "/poseidon/stor".to_string(),
            database_path: PathBuf::from("/var/db/wrasse/jobs.db"),
            store_root: PathBuf::from("/var/db/wrasse/store"),
            accounts: BTreeMap::new(),
            status_addr: None,
            log_level: None,
        }
    }
}

/// `$WRASSE_IDENTITY`, else the hostname, else a random instance name.
fn default_identity() -> String {
    std::env::var("WRASSE_IDENTITY")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("wrasse-{}", uuid::Uuid::new_v4()))
}

impl DaemonConfig {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ArchiverError::Config(format!("unable to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ArchiverError::Config(format!("unable to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(ArchiverError::Config("identity must not be empty".into()));
        }
        if self.queue_limit == 0 {
            return Err(ArchiverError::Config("queueLimit must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ArchiverError::Config("pollInterval must be positive".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.takeover_time_ms {
            return Err(ArchiverError::Config(
                "heartbeatInterval must be positive and shorter than takeoverTime".into(),
            ));
        }
        for (name, ms) in [
            ("pollInterval", self.poll_interval_ms),
            ("takeoverTime", self.takeover_time_ms),
            ("lingerTime", self.linger_time_ms),
        ] {
            if ms > MAX_DURATION_MS {
                return Err(ArchiverError::Config(format!(
                    "{name} must not exceed {MAX_DURATION_MS}ms"
                )));
            }
        }
        if !self.admin_root.starts_with('/') {
            return Err(ArchiverError::Config("adminRoot must be absolute".into()));
        }
        Ok(())
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.job_owner = Some(owner.to_string());
        self
    }

    pub fn with_account(mut self, uuid: &str, login: &str) -> Self {
        self.accounts.insert(uuid.to_string(), login.to_string());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn takeover_time(&self) -> chrono::Duration {
        bounded_millis(self.takeover_time_ms)
    }

    pub fn linger_time(&self) -> chrono::Duration {
        bounded_millis(self.linger_time_ms)
    }
}

/// Unvalidated configs are clamped so date arithmetic cannot overflow.
fn bounded_millis(ms: u64) -> chrono::Duration {
    let ms = i64::try_from(ms.min(MAX_DURATION_MS)).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_config_default() {
        let cfg = DaemonConfig::new("host-a");
        assert_eq!(cfg.identity, "host-a");
        assert_eq!(cfg.poll_interval_ms, 10_000);
        assert_eq!(cfg.takeover_time_ms, 1_800_000);
        assert_eq!(cfg.linger_time_ms, 14_400_000);
        assert_eq!(cfg.queue_limit, 10);
        assert_eq!(cfg.heartbeat_interval_ms, 500);
        assert_eq!(cfg.heartbeat_retries, 3);
        assert_eq!(cfg.scratch_dir, PathBuf::from("/var/tmp/wrasse"));
        assert_eq!(cfg.admin_root, "/poseidon/stor");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_identity_is_never_empty() {
        assert!(!default_identity().is_empty());
    }

    #[test]
    fn parses_camel_case_file_keys() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{
                "identity": "host-b",
                "jobOwner": "U1",
                "pollInterval": 2000,
                "takeoverTime": 60000,
                "lingerTime": 0,
                "queueLimit": 4,
                "accounts": {"U1": "alice"},
                "statusAddr": "127.0.0.1:8080"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.identity, "host-b");
        assert_eq!(cfg.job_owner.as_deref(), Some("U1"));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.takeover_time(), chrono::Duration::seconds(60));
        assert_eq!(cfg.linger_time(), chrono::Duration::zero());
        assert_eq!(cfg.queue_limit, 4);
        assert_eq!(cfg.accounts["U1"], "alice");
        assert_eq!(cfg.status_addr.unwrap().port(), 8080);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.heartbeat_interval_ms, 500);
    }

    #[test]
    fn load_reports_unreadable_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            DaemonConfig::load(&missing),
            Err(ArchiverError::Config(_))
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(DaemonConfig::load(&bad), Err(ArchiverError::Config(_))));

        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"identity": "host-c", "queueLimit": 2}"#).unwrap();
        let cfg = DaemonConfig::load(&good).unwrap();
        assert_eq!(cfg.identity, "host-c");
        assert_eq!(cfg.queue_limit, 2);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = DaemonConfig::new("host-a");
        cfg.queue_limit = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = DaemonConfig::new("host-a");
        cfg.heartbeat_interval_ms = cfg.takeover_time_ms;
        assert!(cfg.validate().is_err());

        let mut cfg = DaemonConfig::new(" ");
        cfg.identity = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = DaemonConfig::new("host-a");
        cfg.admin_root = "relative".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_durations_beyond_bound() {
        let mut cfg = DaemonConfig::new("host-a");
        cfg.linger_time_ms = u64::MAX;
        assert!(matches!(cfg.validate(), Err(ArchiverError::Config(_))));

        let mut cfg = DaemonConfig::new("host-a");
        cfg.takeover_time_ms = MAX_DURATION_MS + 1;
        assert!(cfg.validate().is_err());
        cfg.takeover_time_ms = MAX_DURATION_MS;
        assert!(cfg.validate().is_ok());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.json");
        std::fs::write(&path, r#"{"lingerTime": 18446744073709551615}"#).unwrap();
        assert!(matches!(DaemonConfig::load(&path), Err(ArchiverError::Config(_))));
    }

    #[test]
    fn unvalidated_durations_are_clamped() {
        let mut cfg = DaemonConfig::new("host-a");
        cfg.takeover_time_ms = u64::MAX;
        cfg.linger_time_ms = u64::MAX;
        let bound = chrono::Duration::milliseconds(MAX_DURATION_MS as i64);
        assert_eq!(cfg.takeover_time(), bound);
        assert_eq!(cfg.linger_time(), bound);
        assert!(chrono::Utc::now()
            .checked_sub_signed(cfg.linger_time() + cfg.takeover_time())
            .is_some());
    }

    #[test]
    fn builder_helpers() {
        let cfg = DaemonConfig::new("host-a")
            .with_owner("U1")
            .with_account("U1", "alice");
        assert_eq!(cfg.job_owner.as_deref(), Some("U1"));
        assert_eq!(cfg.accounts.get("U1").map(String::as_str), Some("alice"));
    }
}

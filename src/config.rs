//! Worker configuration.
//!
//! Settings come from `PIPELINE_*` environment variables with defaults. The
//! thread count can additionally be overridden per host through a properties
//! file at [`HOST_OVERRIDES_PATH`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::filestore::RetryPolicy;

/// Per-host overrides file, relative to the working directory.
pub const HOST_OVERRIDES_PATH: &str = "etc/worker-overrides.properties";

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Host name recorded on tasks and used by startup recovery.
    pub host: String,
    /// Worker threads; 0 means one per core.
    pub worker_threads: usize,
    /// Two-phase commit across store and file store instead of a local pair.
    pub use_xa: bool,
    /// Sleep between polls when every queue is empty.
    pub poll_interval: Duration,
    /// Pause after an error in the listener loop.
    pub error_pause: Duration,
    /// Upper bound of the random delay before an attempt starts (zero disables).
    pub max_start_jitter: Duration,
    /// Directory for per-task log files; `None` disables them.
    pub task_log_dir: Option<PathBuf>,
    /// Software revision stamped on tasks.
    pub software_revision: String,
    /// Cap the memory budget (MB) instead of probing physical memory.
    pub memory_budget_mb: Option<u32>,
    /// Disable memory admission control.
    pub memory_gate_enabled: bool,
    /// libSQL database file.
    pub database_path: PathBuf,
    /// Root of the local file store.
    pub filestore_root: PathBuf,
    /// Listen address of the status endpoint.
    pub status_addr: String,
    /// Reconnect policy for the file store.
    pub filestore_retry: RetryPolicy,
    /// Redis URL of the shared broker; unset means a process-local one.
    pub broker_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: local_hostname(),
            worker_threads: 0,
            use_xa: true,
            poll_interval: Duration::from_millis(500),
            error_pause: Duration::from_secs(1),
            max_start_jitter: Duration::ZERO,
            task_log_dir: None,
            software_revision: env!("CARGO_PKG_VERSION").to_string(),
            memory_budget_mb: None,
            memory_gate_enabled: true,
            database_path: PathBuf::from("data/pipeline.db"),
            filestore_root: PathBuf::from("data/filestore"),
            status_addr: "127.0.0.1:8085".to_string(),
            filestore_retry: RetryPolicy::default(),
            broker_url: None,
        }
    }
}

impl WorkerConfig {
    /// Build from `PIPELINE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = std::env::var("PIPELINE_WORKER_HOST").unwrap_or(defaults.host);
        let worker_threads = parse_var("PIPELINE_WORKER_THREADS")?.unwrap_or(0);
        let use_xa = parse_bool_var("PIPELINE_USE_XA")?.unwrap_or(defaults.use_xa);

        let poll_interval = parse_var("PIPELINE_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let error_pause = parse_var("PIPELINE_ERROR_PAUSE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.error_pause);
        let max_start_jitter = parse_var("PIPELINE_MAX_START_JITTER_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_start_jitter);

        let task_log_dir = std::env::var("PIPELINE_TASK_LOG_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let software_revision =
            std::env::var("PIPELINE_SOFTWARE_REVISION").unwrap_or(defaults.software_revision);
        let memory_budget_mb = parse_var("PIPELINE_MEMORY_BUDGET_MB")?;
        let memory_gate_enabled =
            parse_bool_var("PIPELINE_MEMORY_GATE")?.unwrap_or(defaults.memory_gate_enabled);

        let database_path = std::env::var("PIPELINE_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);
        let filestore_root = std::env::var("PIPELINE_FILESTORE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.filestore_root);
        let status_addr = std::env::var("PIPELINE_STATUS_ADDR").unwrap_or(defaults.status_addr);
        let broker_url = std::env::var("PIPELINE_BROKER_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            host,
            worker_threads,
            use_xa,
            poll_interval,
            error_pause,
            max_start_jitter,
            task_log_dir,
            software_revision,
            memory_budget_mb,
            memory_gate_enabled,
            database_path,
            filestore_root,
            status_addr,
            filestore_retry: defaults.filestore_retry,
            broker_url,
        })
    }

    /// Thread count for this host: override file, then configured value,
    /// then one per core when the result is 0.
    pub fn resolve_worker_threads(&self, overrides: &HostOverrides) -> usize {
        let configured = overrides
            .threads_for(&self.host)
            .unwrap_or(self.worker_threads);
        if configured > 0 {
            return configured;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

fn parse_bool_var(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got {other}"),
            }),
        },
        Err(_) => Ok(None),
    }
}

/// This machine's host name, or an empty string if it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default()
}

// ── Host overrides ──────────────────────────────────────────────────────

/// Per-host worker thread counts (`host = threads` lines, `#` comments).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOverrides {
    threads: HashMap<String, usize>,
}

impl HostOverrides {
    pub fn parse(path: &str, contents: &str) -> Result<Self, ConfigError> {
        let mut threads = HashMap::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((host, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    path: path.to_string(),
                    line: index + 1,
                    message: "expected host = threads".into(),
                });
            };
            let count = value
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::ParseError {
                    path: path.to_string(),
                    line: index + 1,
                    message: e.to_string(),
                })?;
            threads.insert(host.trim().to_string(), count);
        }
        Ok(Self { threads })
    }

    /// Load the overrides file; a missing file means no overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&path.display().to_string(), &contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn threads_for(&self, host: &str) -> Option<usize> {
        self.threads.get(host).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse_hosts_and_skip_comments() {
        let overrides = HostOverrides::parse(
            "test",
            "# big boxes\nworker-a = 12\n\n  worker-b=0  \n",
        )
        .unwrap();
        assert_eq!(overrides.threads_for("worker-a"), Some(12));
        assert_eq!(overrides.threads_for("worker-b"), Some(0));
        assert_eq!(overrides.threads_for("worker-c"), None);
    }

    #[test]
    fn overrides_report_bad_line() {
        let err = HostOverrides::parse("test", "worker-a = 2\nworker-b = lots\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { line: 2, .. }));

        let err = HostOverrides::parse("test", "just-a-host\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { line: 1, .. }));
    }

    #[test]
    fn missing_overrides_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = HostOverrides::load(dir.path().join("nope.properties")).unwrap();
        assert_eq!(overrides, HostOverrides::default());
    }

    #[test]
    fn host_override_wins_over_global() {
        let config = WorkerConfig {
            host: "worker-a".into(),
            worker_threads: 3,
            ..WorkerConfig::default()
        };
        let overrides = HostOverrides::parse("test", "worker-a = 7").unwrap();
        assert_eq!(config.resolve_worker_threads(&overrides), 7);
        assert_eq!(config.resolve_worker_threads(&HostOverrides::default()), 3);
    }

    #[test]
    fn zero_threads_means_all_cores() {
        let config = WorkerConfig {
            host: "worker-a".into(),
            worker_threads: 0,
            ..WorkerConfig::default()
        };
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(config.resolve_worker_threads(&HostOverrides::default()), cores);
    }

    #[test]
    fn defaults_are_sane() {
        let config = WorkerConfig::default();
        assert!(config.use_xa);
        assert_eq!(config.worker_threads, 0);
        assert!(config.task_log_dir.is_none());
        assert_eq!(config.max_start_jitter, Duration::ZERO);
        assert!(config.broker_url.is_none());
    }
}

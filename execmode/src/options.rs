//! Runtime configuration.
//!
//! Sources are layered: defaults, then an optional JSON file, then
//! `EXECMODE_*` environment variables. The binary applies CLI flags last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ExecError, ExecResult};

/// What to do when an indefinite wait is attempted on an event-loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingPolicy {
    /// Fail the wait with `IllegalBlockingUse` without blocking.
    #[default]
    Reject,
    /// Record the violation, then block anyway (the pool compensates by
    /// handing the thread's queue to a replacement).
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecmodeOptions {
    /// Event-loop pool size.
    pub event_loop_threads: usize,
    /// Upper bound for the blocking-worker pool.
    pub worker_threads: usize,
    /// Idle worker threads are reclaimed after this long.
    pub worker_keep_alive_ms: u64,
    pub blocking_policy: BlockingPolicy,
    pub outbound: OutboundOptions,
    pub api: ApiOptions,
    pub logging: LoggingOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundOptions {
    pub base_url: String,
    pub joke_path: String,
    pub timeout_ms: u64,
    /// Returned by `async-request` when the outbound call fails.
    pub fallback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiOptions {
    pub delay_ms: u64,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ExecmodeOptions {
    fn default() -> Self {
        let cores = available_cores();
        Self {
            event_loop_threads: cores,
            worker_threads: (8 * cores).max(200),
            worker_keep_alive_ms: 60_000,
            blocking_policy: BlockingPolicy::default(),
            outbound: OutboundOptions::default(),
            api: ApiOptions::default(),
            logging: LoggingOptions::default(),
        }
    }
}

impl Default for OutboundOptions {
    fn default() -> Self {
        Self {
            base_url: "https://api.chucknorris.io".to_string(),
            joke_path: "/jokes/random".to_string(),
            timeout_ms: 5000,
            fallback: "Chuck Norris is sleeping".to_string(),
        }
    }
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            delay_ms: 5000,
            tick_interval_ms: 2000,
        }
    }
}

impl OutboundOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ApiOptions {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl ExecmodeOptions {
    /// Defaults overlaid with the JSON file (if any) and the environment.
    pub fn load(config_file: Option<&Path>) -> ExecResult<Self> {
        let mut options = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        options.apply_env(|key| std::env::var(key).ok())?;
        options.sanitize()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> ExecResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExecError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let options: Self = serde_json::from_str(&raw)?;
        Ok(options)
    }

    /// Apply `EXECMODE_*` overrides. `lookup` is injectable for tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> ExecResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> ExecResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| ExecError::Config(format!("{key} has invalid value '{raw}'")))
        }

        if let Some(v) = lookup("EXECMODE_EVENT_LOOP_THREADS") {
            self.event_loop_threads = parse("EXECMODE_EVENT_LOOP_THREADS", v)?;
        }
        if let Some(v) = lookup("EXECMODE_WORKER_THREADS") {
            self.worker_threads = parse("EXECMODE_WORKER_THREADS", v)?;
        }
        if let Some(v) = lookup("EXECMODE_BLOCKING_POLICY") {
            self.blocking_policy = match v.trim().to_ascii_lowercase().as_str() {
                "reject" => BlockingPolicy::Reject,
                "warn" => BlockingPolicy::Warn,
                other => {
                    return Err(ExecError::Config(format!(
                        "EXECMODE_BLOCKING_POLICY must be 'reject' or 'warn', got '{other}'"
                    )));
                }
            };
        }
        if let Some(v) = lookup("EXECMODE_BASE_URL") {
            self.outbound.base_url = v;
        }
        if let Some(v) = lookup("EXECMODE_OUTBOUND_TIMEOUT_MS") {
            self.outbound.timeout_ms = parse("EXECMODE_OUTBOUND_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("EXECMODE_DELAY_MS") {
            self.api.delay_ms = parse("EXECMODE_DELAY_MS", v)?;
        }
        if let Some(v) = lookup("EXECMODE_TICK_INTERVAL_MS") {
            self.api.tick_interval_ms = parse("EXECMODE_TICK_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("EXECMODE_LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Validate option values before any pool is built.
    pub fn sanitize(&self) -> ExecResult<()> {
        if self.event_loop_threads == 0 {
            return Err(ExecError::Config(
                "event_loop_threads must be at least 1".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ExecError::Config("worker_threads must be at least 1".into()));
        }
        if self.outbound.timeout_ms == 0 {
            return Err(ExecError::Config("outbound.timeout_ms must be positive".into()));
        }
        if self.api.tick_interval_ms == 0 {
            return Err(ExecError::Config(
                "api.tick_interval_ms must be positive".into(),
            ));
        }
        if !is_web_url(&self.outbound.base_url) {
            return Err(ExecError::Config(format!(
                "outbound.base_url must be an http:// or https:// URL, got: {}",
                self.outbound.base_url
            )));
        }
        Ok(())
    }

    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_millis(self.worker_keep_alive_ms)
    }
}

pub(crate) fn is_web_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let options = ExecmodeOptions::default();
        assert!(options.event_loop_threads >= 1);
        assert!(options.worker_threads >= 200);
        assert_eq!(options.outbound.timeout_ms, 5000);
        assert_eq!(options.outbound.fallback, "Chuck Norris is sleeping");
        assert_eq!(options.blocking_policy, BlockingPolicy::Reject);
        options.sanitize().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("execmode.json");
        std::fs::write(
            &path,
            r#"{"event_loop_threads": 2, "api": {"delay_ms": 10}, "blocking_policy": "warn"}"#,
        )
        .unwrap();

        let options = ExecmodeOptions::from_file(&path).unwrap();
        assert_eq!(options.event_loop_threads, 2);
        assert_eq!(options.api.delay_ms, 10);
        assert_eq!(options.api.tick_interval_ms, 2000);
        assert_eq!(options.blocking_policy, BlockingPolicy::Warn);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ExecmodeOptions::from_file(Path::new("/nonexistent/execmode.json")).unwrap_err();
        assert!(matches!(err, ExecError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("EXECMODE_WORKER_THREADS", "16"),
            ("EXECMODE_BLOCKING_POLICY", "WARN"),
            ("EXECMODE_TICK_INTERVAL_MS", "50"),
        ]
        .into_iter()
        .collect();

        let mut options = ExecmodeOptions::default();
        options
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(options.worker_threads, 16);
        assert_eq!(options.blocking_policy, BlockingPolicy::Warn);
        assert_eq!(options.api.tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut options = ExecmodeOptions::default();
        let result = options.apply_env(|key| {
            (key == "EXECMODE_EVENT_LOOP_THREADS").then(|| "many".to_string())
        });
        assert!(result.unwrap_err().to_string().contains("invalid value"));
    }

    #[test]
    fn test_sanitize_rejects_zero_threads() {
        let options = ExecmodeOptions {
            event_loop_threads: 0,
            ..Default::default()
        };
        assert!(options.sanitize().is_err());
    }

    #[test]
    fn test_sanitize_base_url_scheme() {
        let mut options = ExecmodeOptions::default();
        assert!(options.outbound.base_url.starts_with("https://"));
        options.sanitize().unwrap();

        options.outbound.base_url = "http://localhost:8080".into();
        options.sanitize().unwrap();

        options.outbound.base_url = "ftp://api.chucknorris.io".into();
        assert!(options.sanitize().unwrap_err().to_string().contains("https://"));
    }
}

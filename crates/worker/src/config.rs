use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use kiln_core::error::CoreError;
use kiln_core::thresholds::AlertThresholds;

use crate::backend::BackendKind;
use crate::monitor::MonitorConfig;
use crate::pool::PoolConfig;
use crate::recovery::RecoveryConfig;

/// Orchestrator configuration loaded from environment variables.
///
/// Every variable is optional; unset ones take the defaults below. A value
/// that is present but malformed is a [`CoreError::Configuration`].
///
/// | Env Var                   | Default                          |
/// |---------------------------|----------------------------------|
/// | `WORKERS_ENABLED`         | `true`                           |
/// | `WORKER_POOL_SIZE`        | available parallelism - 1, min 1 |
/// | `TASK_TIMEOUT_SECS`       | unset (no timeout)               |
/// | `RECOVERY_MAX_RETRIES`    | `3`                              |
/// | `RECOVERY_BASE_DELAY_MS`  | `1000`                           |
/// | `RECOVERY_MAX_BACKOFF_MS` | `30000`                          |
/// | `ERROR_RETENTION_SECS`    | `3600`                           |
/// | `ALERT_MEMORY_MB`         | `512`                            |
/// | `ALERT_LATENCY_MS`        | `100`                            |
/// | `ALERT_ERROR_RATE`        | `0.1`                            |
/// | `ALERT_COOLDOWN_SECS`     | `300`                            |
/// | `METRICS_RETENTION_HOURS` | `24`                             |
/// | `TRAINING_BACKEND`        | `simulated`                      |
/// | `SIMULATED_EPOCH_MS`      | `500`                            |
/// | `SHUTDOWN_TIMEOUT_SECS`   | `30`                             |
/// | `DATABASE_URL`            | unset (in-memory store)          |
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub pool: PoolConfig,
    pub recovery: RecoveryConfig,
    pub monitor: MonitorConfig,
    pub backend: BackendKind,
    /// Epoch cadence of the simulated backend.
    pub simulated_epoch: Duration,
    pub shutdown_timeout: Duration,
    pub database_url: Option<String>,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut pool = PoolConfig::default();
        if let Some(enabled) = get("WORKERS_ENABLED") {
            pool.workers_enabled = parse_bool("WORKERS_ENABLED", &enabled)?;
        }
        if let Some(size) = parse::<usize>(&get, "WORKER_POOL_SIZE")? {
            if size == 0 {
                return Err(CoreError::Configuration(
                    "WORKER_POOL_SIZE must be at least 1".into(),
                ));
            }
            pool.size = size;
        }
        pool.task_timeout = parse::<u64>(&get, "TASK_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let mut recovery = RecoveryConfig::default();
        if let Some(retries) = parse(&get, "RECOVERY_MAX_RETRIES")? {
            recovery.max_retries = retries;
        }
        if let Some(ms) = parse(&get, "RECOVERY_BASE_DELAY_MS")? {
            recovery.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&get, "RECOVERY_MAX_BACKOFF_MS")? {
            recovery.max_backoff = Duration::from_millis(ms);
        }
        if recovery.max_backoff < recovery.base_delay {
            return Err(CoreError::Configuration(
                "RECOVERY_MAX_BACKOFF_MS must not be below RECOVERY_BASE_DELAY_MS".into(),
            ));
        }
        if let Some(secs) = parse(&get, "ERROR_RETENTION_SECS")? {
            recovery.retention = Duration::from_secs(secs);
        }

        let mut thresholds = AlertThresholds::default();
        if let Some(mb) = parse_positive(&get, "ALERT_MEMORY_MB")? {
            thresholds.memory_mb = mb;
        }
        if let Some(ms) = parse_positive(&get, "ALERT_LATENCY_MS")? {
            thresholds.latency_ms = ms;
        }
        if let Some(rate) = parse_positive(&get, "ALERT_ERROR_RATE")? {
            thresholds.error_rate = rate;
        }

        let mut monitor = MonitorConfig {
            thresholds,
            ..Default::default()
        };
        if let Some(secs) = parse(&get, "ALERT_COOLDOWN_SECS")? {
            monitor.alert_cooldown = Duration::from_secs(secs);
        }
        if let Some(hours) = parse::<u64>(&get, "METRICS_RETENTION_HOURS")? {
            monitor.retention = Duration::from_secs(hours * 3600);
            recovery.log_retention = monitor.retention;
        }

        let backend = match get("TRAINING_BACKEND") {
            Some(kind) => BackendKind::parse(&kind)?,
            None => BackendKind::Simulated,
        };
        let simulated_epoch =
            Duration::from_millis(parse(&get, "SIMULATED_EPOCH_MS")?.unwrap_or(500));
        let shutdown_timeout =
            Duration::from_secs(parse(&get, "SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(30));

        Ok(Self {
            pool,
            recovery,
            monitor,
            backend,
            simulated_epoch,
            shutdown_timeout,
            database_url: get("DATABASE_URL"),
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, CoreError>
where
    T: FromStr,
    T::Err: Display,
{
    get(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| CoreError::Configuration(format!("{name}='{raw}' is invalid: {e}")))
        })
        .transpose()
}

fn parse_positive(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<f64>, CoreError> {
    match parse::<f64>(get, name)? {
        Some(v) if !(v.is_finite() && v > 0.0) => Err(CoreError::Configuration(format!(
            "{name} must be a positive number, got {v}"
        ))),
        other => Ok(other),
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, CoreError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::Configuration(format!(
            "{name} must be a boolean, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use assert_matches::assert_matches;

    fn load(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, CoreError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert!(config.pool.workers_enabled);
        assert!(config.pool.size >= 1);
        assert_eq!(config.pool.task_timeout, None);
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.recovery.base_delay, Duration::from_secs(1));
        assert_eq!(config.recovery.max_backoff, Duration::from_secs(30));
        assert_eq!(config.monitor.thresholds, AlertThresholds::default());
        assert_eq!(config.monitor.alert_cooldown, Duration::from_secs(300));
        assert_eq!(config.backend, BackendKind::Simulated);
        assert_eq!(config.simulated_epoch, Duration::from_millis(500));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("WORKERS_ENABLED", "false"),
            ("WORKER_POOL_SIZE", "6"),
            ("TASK_TIMEOUT_SECS", "90"),
            ("RECOVERY_MAX_RETRIES", "5"),
            ("ALERT_MEMORY_MB", "1024"),
            ("ALERT_COOLDOWN_SECS", "0"),
            ("METRICS_RETENTION_HOURS", "48"),
            ("TRAINING_BACKEND", "native"),
            ("DATABASE_URL", "postgres://localhost/kiln"),
        ])
        .unwrap();
        assert!(!config.pool.workers_enabled);
        assert_eq!(config.pool.size, 6);
        assert_eq!(config.pool.task_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.recovery.max_retries, 5);
        assert_eq!(config.monitor.thresholds.memory_mb, 1024.0);
        assert_eq!(config.monitor.alert_cooldown, Duration::ZERO);
        assert_eq!(config.monitor.retention, Duration::from_secs(48 * 3600));
        assert_eq!(config.recovery.log_retention, config.monitor.retention);
        assert_eq!(config.backend, BackendKind::Native);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/kiln"));
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        assert_matches!(load(&[("WORKER_POOL_SIZE", "many")]), Err(CoreError::Configuration(_)));
        assert_matches!(load(&[("WORKER_POOL_SIZE", "0")]), Err(CoreError::Configuration(_)));
        assert_matches!(load(&[("WORKERS_ENABLED", "maybe")]), Err(CoreError::Configuration(_)));
        assert_matches!(load(&[("ALERT_ERROR_RATE", "-1")]), Err(CoreError::Configuration(_)));
        assert_matches!(load(&[("TRAINING_BACKEND", "gpu")]), Err(CoreError::Configuration(_)));
        assert_matches!(
            load(&[("RECOVERY_BASE_DELAY_MS", "5000"), ("RECOVERY_MAX_BACKOFF_MS", "100")]),
            Err(CoreError::Configuration(_))
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("WORKER_POOL_SIZE", "  "), ("DATABASE_URL", "")]).unwrap();
        assert!(config.pool.size >= 1);
        assert!(config.database_url.is_none());
    }
}

//! Maintenance configuration.

use std::time::Duration;

/// Environment variable overriding [`MaintenanceConfig::purge_retention`], in seconds.
pub const PURGE_RETENTION_ENV: &str = "STEPGATE_PURGE_RETENTION_SECS";

/// Environment variable overriding [`MaintenanceConfig::maintenance_interval`], in milliseconds.
pub const MAINTENANCE_INTERVAL_ENV: &str = "STEPGATE_MAINTENANCE_INTERVAL_MS";

const DEFAULT_PURGE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Maintenance pass configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How long an ended instance is kept before it is purged with its chunks.
    pub purge_retention: Duration,
    /// Cadence of the background maintenance runner.
    pub maintenance_interval: Duration,
    /// Name for logging and the runner thread.
    pub name: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            purge_retention: DEFAULT_PURGE_RETENTION,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            name: "batch-maintenance".to_string(),
        }
    }
}

impl MaintenanceConfig {
    /// Defaults overridden by any of the `STEPGATE_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(secs) = parse_u64(&lookup, PURGE_RETENTION_ENV)? {
            config.purge_retention = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, MAINTENANCE_INTERVAL_ENV)? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    var: MAINTENANCE_INTERVAL_ENV,
                    value: ms.to_string(),
                    reason: "interval must be positive".to_string(),
                });
            }
            config.maintenance_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_purge_retention(mut self, retention: Duration) -> Self {
        self.purge_retention = retention;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

fn parse_u64<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = MaintenanceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.purge_retention, Duration::from_secs(604_800));
        assert_eq!(config.maintenance_interval, Duration::from_secs(60));
    }

    #[test]
    fn variables_override_defaults() {
        let config = MaintenanceConfig::from_lookup(lookup(&[
            (PURGE_RETENTION_ENV, "3600"),
            (MAINTENANCE_INTERVAL_ENV, " 250 "),
        ]))
        .unwrap();
        assert_eq!(config.purge_retention, Duration::from_secs(3600));
        assert_eq!(config.maintenance_interval, Duration::from_millis(250));
    }

    #[test]
    fn garbage_and_zero_interval_are_rejected() {
        assert!(MaintenanceConfig::from_lookup(lookup(&[(PURGE_RETENTION_ENV, "a week")])).is_err());
        assert!(MaintenanceConfig::from_lookup(lookup(&[(MAINTENANCE_INTERVAL_ENV, "0")])).is_err());
    }
}

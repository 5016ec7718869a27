//! Runtime configuration for the coordinator.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `TABGATE_*` environment variables. The binary applies CLI flags last.
//! All durations are stored as milliseconds so the file format stays flat.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::ring::DEFAULT_EVENT_CAPACITY;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TABGATE_CONFIG";

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabgateConfig {
    /// Host the port range is probed on.
    pub host: String,
    /// First port of the static candidate range (inclusive).
    pub port_start: u16,
    /// Last port of the static candidate range (inclusive).
    pub port_end: u16,
    pub scan_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Base delay for per-port reconnect backoff.
    pub reconnect_base_ms: u64,
    /// Cap for per-port reconnect backoff.
    pub reconnect_max_ms: u64,
    /// How long a `portListResponse` stays authoritative.
    pub discovery_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is presumed dead.
    pub heartbeat_timeout_ms: u64,
    /// Default wait for a contested resource lock.
    pub lock_timeout_ms: u64,
    /// Hold age after which a lock held by a dead connection is recovered.
    pub lock_stale_ms: u64,
    /// Hold age after which a lock is recovered for a requester that already timed out once.
    pub lock_hard_stale_ms: u64,
    pub lock_sweep_interval_ms: u64,
    /// Total attach (and detach) attempts before giving up.
    pub max_attach_retries: u32,
    pub attach_retry_base_ms: u64,
    pub event_buffer_capacity: usize,
    /// Events kept after a detach for post-mortem inspection.
    pub post_mortem_retain: usize,
}

impl Default for TabgateConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port_start: 8765,
            port_end: 8775,
            scan_interval_ms: 2_000,
            connect_timeout_ms: 1_000,
            handshake_timeout_ms: 3_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            discovery_ttl_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            lock_timeout_ms: 30_000,
            lock_stale_ms: 60_000,
            lock_hard_stale_ms: 300_000,
            lock_sweep_interval_ms: 5_000,
            max_attach_retries: 3,
            attach_retry_base_ms: 200,
            event_buffer_capacity: DEFAULT_EVENT_CAPACITY,
            post_mortem_retain: 50,
        }
    }
}

impl TabgateConfig {
    /// Loads configuration: defaults, then the config file (explicit path,
    /// `$TABGATE_CONFIG`, or the default location if it exists), then the
    /// environment. The result is validated.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        debug!(path = %path.display(), "Loaded config file");

        Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parses TOML text.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
    }

    /// Applies `TABGATE_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("TABGATE_HOST") {
            self.host = host;
        }
        override_num(&lookup, "TABGATE_PORT_START", &mut self.port_start)?;
        override_num(&lookup, "TABGATE_PORT_END", &mut self.port_end)?;
        override_num(&lookup, "TABGATE_LOCK_TIMEOUT_MS", &mut self.lock_timeout_ms)?;
        override_num(&lookup, "TABGATE_LOCK_STALE_MS", &mut self.lock_stale_ms)?;
        override_num(
            &lookup,
            "TABGATE_HEARTBEAT_INTERVAL_MS",
            &mut self.heartbeat_interval_ms,
        )?;
        override_num(
            &lookup,
            "TABGATE_MAX_ATTACH_RETRIES",
            &mut self.max_attach_retries,
        )?;
        override_num(&lookup, "TABGATE_RECONNECT_BASE_MS", &mut self.reconnect_base_ms)?;
        Ok(())
    }

    /// Rejects combinations the coordinator cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.port_start > self.port_end {
            return Err(ConfigError::invalid(
                "port range",
                format!("{}-{}", self.port_start, self.port_end),
                "port_start <= port_end",
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid("heartbeat_interval_ms", 0, "> 0"));
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(ConfigError::invalid(
                "heartbeat_timeout_ms",
                self.heartbeat_timeout_ms,
                ">= heartbeat_interval_ms",
            ));
        }
        if self.max_attach_retries == 0 {
            return Err(ConfigError::invalid("max_attach_retries", 0, ">= 1"));
        }
        if self.event_buffer_capacity == 0 {
            return Err(ConfigError::invalid("event_buffer_capacity", 0, ">= 1"));
        }
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::invalid("scan_interval_ms", 0, "> 0"));
        }
        if self.lock_sweep_interval_ms == 0 {
            return Err(ConfigError::invalid("lock_sweep_interval_ms", 0, "> 0"));
        }
        Ok(())
    }

    /// Static candidate ports, inclusive on both ends.
    pub fn port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.port_start..=self.port_end
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_millis(self.discovery_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_millis(self.lock_stale_ms)
    }

    pub fn lock_hard_stale(&self) -> Duration {
        Duration::from_millis(self.lock_hard_stale_ms)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lock_sweep_interval_ms)
    }

    pub fn attach_retry_base(&self) -> Duration {
        Duration::from_millis(self.attach_retry_base_ms)
    }
}

/// Returns `<config_dir>/tabgate/config.toml`, if a config dir is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tabgate").join("config.toml"))
}

fn override_num<F, T>(lookup: &F, var: &str, slot: &mut T) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(var) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = TabgateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port_range().count(), 11);
        assert_eq!(config.lock_stale(), Duration::from_secs(60));
        assert_eq!(config.max_attach_retries, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TabgateConfig::from_toml("port_start = 9000\nport_end = 9002\n").unwrap();
        assert_eq!(config.port_start, 9000);
        assert_eq!(config.port_end, 9002);
        assert_eq!(config.heartbeat_interval_ms, 5_000);
    }

    #[test]
    fn test_from_file_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port_start = \"not a number\"").unwrap();

        let err = TabgateConfig::from_file(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = TabgateConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TabgateConfig::default();
        config
            .apply_env(env(&[
                ("TABGATE_PORT_START", "9100"),
                ("TABGATE_PORT_END", "9105"),
                ("TABGATE_LOCK_STALE_MS", "1500"),
                ("TABGATE_HOST", "localhost"),
            ]))
            .unwrap();

        assert_eq!(config.port_range(), 9100..=9105);
        assert_eq!(config.lock_stale_ms, 1500);
        assert_eq!(config.host, "localhost");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = TabgateConfig::default();
        let err = config
            .apply_env(env(&[("TABGATE_MAX_ATTACH_RETRIES", "three")]))
            .unwrap_err();
        assert!(err.to_string().contains("TABGATE_MAX_ATTACH_RETRIES"));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let config = TabgateConfig {
            port_start: 9000,
            port_end: 8000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_heartbeat_timeout() {
        let config = TabgateConfig {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 1_000,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat_timeout_ms"));
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = TabgateConfig {
            max_attach_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sweep_interval() {
        let config = TabgateConfig {
            lock_sweep_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock_sweep_interval_ms"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TabgateConfig {
            port_start: 7000,
            port_end: 7010,
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        assert_eq!(TabgateConfig::from_toml(&text).unwrap(), config);
    }
}

pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Prefix of environment variables overriding file values
pub const ENV_PREFIX: &str = "CONDUIT_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ConnectivityConfig {
    /// Load configuration from a JSON file, apply environment overrides, validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();

        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read configuration {}", config_path.display()))?;

        let mut cfg: ConnectivityConfig =
            serde_json::from_str(&raw).context("Failed to deserialize configuration")?;

        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `CONDUIT_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        override_parsed(&get, "CONNECTING_MIN_TIMEOUT_MS", &mut self.client.connecting_min_timeout_ms)?;
        override_parsed(&get, "CONNECTING_MAX_TIMEOUT_MS", &mut self.client.connecting_max_timeout_ms)?;
        override_parsed(&get, "MIN_BACKOFF_MS", &mut self.client.min_backoff_ms)?;
        override_parsed(&get, "MAX_BACKOFF_MS", &mut self.client.max_backoff_ms)?;
        override_parsed(&get, "MAX_TRIES", &mut self.client.max_tries)?;
        override_parsed(&get, "DISCONNECT_TIMEOUT_MS", &mut self.client.disconnect_timeout_ms)?;
        override_parsed(&get, "TESTING_TIMEOUT_MS", &mut self.client.testing_timeout_ms)?;
        override_parsed(&get, "COLLECTOR_LIFETIME_MS", &mut self.acknowledgement.collector_lifetime_ms)?;
        override_parsed(&get, "PUBLISH_TIMEOUT_MS", &mut self.acknowledgement.publish_timeout_ms)?;
        override_parsed(&get, "INTAKE_BUFFER_CAPACITY", &mut self.intake.buffer_capacity)?;

        if let Some(level) = get("LOG_LEVEL") {
            self.logging.log_level = level;
        }
        if let Some(json) = get("JSON_LOGS") {
            self.logging.json_logs = json
                .parse()
                .with_context(|| format!("Invalid {ENV_PREFIX}JSON_LOGS '{json}'"))?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let client = &self.client;

        if client.connecting_min_timeout_ms == 0 {
            anyhow::bail!("client.connecting_min_timeout_ms must be positive");
        }
        if client.connecting_min_timeout_ms > client.connecting_max_timeout_ms {
            anyhow::bail!(
                "client.connecting_min_timeout_ms ({}) exceeds connecting_max_timeout_ms ({})",
                client.connecting_min_timeout_ms,
                client.connecting_max_timeout_ms
            );
        }
        if client.min_backoff_ms > client.max_backoff_ms {
            anyhow::bail!(
                "client.min_backoff_ms ({}) exceeds max_backoff_ms ({})",
                client.min_backoff_ms,
                client.max_backoff_ms
            );
        }
        if client.max_tries == 0 {
            anyhow::bail!("client.max_tries must be at least 1");
        }
        if client.disconnect_timeout_ms == 0 || client.testing_timeout_ms == 0 {
            anyhow::bail!("client disconnect and testing timeouts must be positive");
        }
        if client.command_timeout_ms == 0 {
            anyhow::bail!("client.command_timeout_ms must be positive");
        }

        if self.acknowledgement.collector_lifetime_ms == 0 {
            anyhow::bail!("acknowledgement.collector_lifetime_ms must be positive");
        }
        if self.acknowledgement.publish_timeout_ms == 0 {
            anyhow::bail!("acknowledgement.publish_timeout_ms must be positive");
        }

        if self.intake.buffer_capacity == 0 {
            anyhow::bail!("intake.buffer_capacity must be positive");
        }
        if self.intake.max_messages_per_second == Some(0) {
            anyhow::bail!("intake.max_messages_per_second must be positive when set");
        }

        if !LOG_LEVELS.contains(&self.logging.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of {:?}",
                self.logging.log_level,
                LOG_LEVELS
            );
        }
        if self.logging.connection_log_capacity == 0 {
            anyhow::bail!("logging.connection_log_capacity must be positive");
        }

        Ok(())
    }
}

fn override_parsed<T, G>(get: &G, name: &str, slot: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *slot = raw
            .parse()
            .with_context(|| format!("Invalid {ENV_PREFIX}{name} '{raw}'"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        ConnectivityConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "client": {{ "max_tries": 3, "min_backoff_ms": 50 }}, "intake": {{ "buffer_capacity": 8 }} }}"#
        )
        .unwrap();

        let cfg = ConnectivityConfig::load(file.path()).unwrap();
        assert_eq!(cfg.client.max_tries, 3);
        assert_eq!(cfg.client.min_backoff_ms, 50);
        assert_eq!(cfg.client.connecting_min_timeout_ms, 10_000);
        assert_eq!(cfg.intake.buffer_capacity, 8);
        assert_eq!(cfg.logging.log_level, "info");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(ConnectivityConfig::load("/nonexistent/conduit.json").is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let env: HashMap<String, String> = [
            ("CONDUIT_MAX_TRIES", "7"),
            ("CONDUIT_LOG_LEVEL", "debug"),
            ("CONDUIT_JSON_LOGS", "true"),
            ("CONDUIT_PUBLISH_TIMEOUT_MS", "2500"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut cfg = ConnectivityConfig::default();
        cfg.apply_overrides(|key| env.get(key).cloned()).unwrap();

        assert_eq!(cfg.client.max_tries, 7);
        assert_eq!(cfg.logging.log_level, "debug");
        assert!(cfg.logging.json_logs);
        assert_eq!(cfg.acknowledgement.publish_timeout(), std::time::Duration::from_millis(2500));
    }

    #[test]
    fn test_unparsable_override_fails() {
        let mut cfg = ConnectivityConfig::default();
        let err = cfg
            .apply_overrides(|key| (key == "CONDUIT_MAX_TRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CONDUIT_MAX_TRIES"));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut cfg = ConnectivityConfig::default();
        cfg.client.connecting_min_timeout_ms = 120_000;
        assert!(cfg.validate().is_err());

        let mut cfg = ConnectivityConfig::default();
        cfg.client.min_backoff_ms = cfg.client.max_backoff_ms + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = ConnectivityConfig::default();
        cfg.acknowledgement.publish_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_log_level() {
        let mut cfg = ConnectivityConfig::default();
        cfg.logging.log_level = "verbose".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backoff_config_conversion() {
        let cfg = ConnectivityConfig::default();
        let backoff = cfg.client.backoff_config();
        assert_eq!(backoff.min_timeout, Duration::from_secs(10));
        assert_eq!(backoff.max_backoff, Duration::from_secs(60));
        assert_eq!(backoff.max_tries, 50);
        assert_eq!(cfg.client.disconnect_timeout(true), Duration::from_secs(20));
    }
}

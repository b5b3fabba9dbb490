//! Configuration for the core's four ambient knobs (spec §6.4).
//!
//! Grounded on `shipper/src/config.rs`'s nested-section-plus-defaults shape
//! and `types.rs`'s `deserialize_duration`/`serialize_duration` pair, plus
//! `StorageConfigInner`'s env-var-overrides-file pattern. Kiln has far fewer
//! knobs than Shipper, but the same three layers apply: built-in defaults,
//! an optional TOML file, and environment variables that win over both.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Nested heater-watchdog section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaterConfig {
    /// How long a printer may sit idle with a nonzero heater target before
    /// the watchdog cools it. Zero disables the watchdog.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    #[serde(default = "default_idle_heater_timeout")]
    pub idle_timeout: Duration,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self { idle_timeout: default_idle_heater_timeout() }
    }
}

fn default_idle_heater_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Nested scheduler section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerSection {
    /// Base delay for the scheduler's exponential dispatch-retry backoff.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    #[serde(default = "default_retry_base")]
    pub retry_base: Duration,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { retry_base: default_retry_base() }
    }
}

fn default_retry_base() -> Duration {
    Duration::from_secs(30)
}

/// Nested webhook-delivery section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookSection {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self { worker_count: default_worker_count(), max_redirects: default_max_redirects() }
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_max_redirects() -> u32 {
    0
}

/// The core's full environment configuration (spec §6.4). Credentials and
/// feature flags are not part of this struct; they arrive through the
/// collaborator interfaces the core is constructed with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KilnConfig {
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub webhook: WebhookSection,
}

impl KilnConfig {
    /// Loads from an optional TOML file, then applies environment variable
    /// overrides on top. A missing file is not an error; missing env vars
    /// leave the file (or built-in default) value in place.
    pub fn load(toml_path: Option<&Path>) -> Result<Self> {
        let mut config = match toml_path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("KILN_IDLE_HEATER_TIMEOUT_MINUTES") {
            let minutes: u64 = raw
                .parse()
                .with_context(|| "KILN_IDLE_HEATER_TIMEOUT_MINUTES must be an integer number of minutes")?;
            self.heater.idle_timeout = Duration::from_secs(minutes * 60);
        }
        if let Ok(raw) = std::env::var("KILN_SCHEDULER_RETRY_BASE_SECONDS") {
            let seconds: u64 =
                raw.parse().with_context(|| "KILN_SCHEDULER_RETRY_BASE_SECONDS must be an integer number of seconds")?;
            self.scheduler.retry_base = Duration::from_secs(seconds);
        }
        if let Ok(raw) = std::env::var("KILN_WEBHOOK_WORKER_COUNT") {
            self.webhook.worker_count = raw.parse().with_context(|| "KILN_WEBHOOK_WORKER_COUNT must be an integer")?;
        }
        if let Ok(raw) = std::env::var("KILN_MAX_WEBHOOK_REDIRECTS") {
            self.webhook.max_redirects = raw.parse().with_context(|| "KILN_MAX_WEBHOOK_REDIRECTS must be an integer")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.retry_base.is_zero() {
            bail!("scheduler.retry_base must be greater than 0");
        }
        if self.webhook.worker_count == 0 {
            bail!("webhook.worker_count must be greater than 0");
        }
        Ok(())
    }
}

/// Parses a duration from either a humantime string ("30m", "5s") or a
/// plain integer number of milliseconds, so hand-edited TOML and
/// machine-generated TOML both round-trip.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => {
            humantime::parse_duration(&s).map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}")))
        }
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the env-var tests
    // against each other so they don't race.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "KILN_IDLE_HEATER_TIMEOUT_MINUTES",
            "KILN_SCHEDULER_RETRY_BASE_SECONDS",
            "KILN_WEBHOOK_WORKER_COUNT",
            "KILN_MAX_WEBHOOK_REDIRECTS",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = KilnConfig::default();
        assert_eq!(config.heater.idle_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.scheduler.retry_base, Duration::from_secs(30));
        assert_eq!(config.webhook.worker_count, 4);
        assert_eq!(config.webhook.max_redirects, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_idle_timeout_is_accepted_as_a_disable_sentinel() {
        let toml = "[heater]\nidle_timeout = \"0s\"\n";
        let config: KilnConfig = toml::from_str(toml).unwrap();
        assert!(config.heater.idle_timeout.is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_humantime_strings() {
        let toml = "[heater]\nidle_timeout = \"45m\"\n[scheduler]\nretry_base = \"10s\"\n";
        let config: KilnConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.heater.idle_timeout, Duration::from_secs(45 * 60));
        assert_eq!(config.scheduler.retry_base, Duration::from_secs(10));
    }

    #[test]
    fn rejects_zero_retry_base() {
        let toml = "[scheduler]\nretry_base = \"0s\"\n";
        let config: KilnConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_worker_count() {
        let toml = "[webhook]\nworker_count = 0\n";
        let config: KilnConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_vars_override_file_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(&path, "[scheduler]\nretry_base = \"5s\"\n").unwrap();

        unsafe { std::env::set_var("KILN_SCHEDULER_RETRY_BASE_SECONDS", "60") };
        let config = KilnConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.retry_base, Duration::from_secs(60));

        clear_env();
    }

    #[test]
    fn missing_file_falls_back_to_defaults_plus_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("KILN_WEBHOOK_WORKER_COUNT", "8") };
        let config = KilnConfig::load(Some(Path::new("/nonexistent/kiln.toml"))).unwrap();
        assert_eq!(config.webhook.worker_count, 8);
        assert_eq!(config.heater.idle_timeout, Duration::from_secs(30 * 60));
        clear_env();
    }

    #[test]
    fn load_with_no_path_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = KilnConfig::load(None).unwrap();
        assert_eq!(config, KilnConfig::default());
    }
}

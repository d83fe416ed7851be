use std::{env, fmt::Display, fs::read_to_string, path::PathBuf, str::FromStr, time::Duration};

use records::DEFAULT_NAMESPACE;
use tracing::{info, warn};

use crate::{
    error::ConfigError,
    guard::{BotScoreConfig, RateLimitConfig},
    retry::RetryPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Simulated,
    Supabase,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" => Ok(BackendKind::Simulated),
            "supabase" => Ok(BackendKind::Supabase),
            other => Err(format!("expected simulated or supabase, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    File,
    Redis,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "redis" => Ok(StorageKind::Redis),
            other => Err(format!("expected file or redis, got {other}")),
        }
    }
}

pub struct Config {
    pub port: u16,
    pub backend: BackendKind,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub namespace: String,
    pub storage: StorageKind,
    pub storage_dir: PathBuf,
    pub redis_url: String,
    pub retry: RetryPolicy,
    pub rate: RateLimitConfig,
    pub bot: BotScoreConfig,
    pub cache_failed: bool,
    pub simulated_latency: Duration,
    pub simulated_failure_rate: f64,
    pub email_function_url: Option<String>,
    pub admin_email: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let backend: BackendKind = try_load("FORMS_BACKEND", "simulated")?;

        let (supabase_url, supabase_key) = match backend {
            BackendKind::Supabase => (
                Some(optional("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?),
                Some(read_secret("SUPABASE_ANON_KEY")?),
            ),
            BackendKind::Simulated => (optional("SUPABASE_URL"), None),
        };

        let simulated_failure_rate: f64 = try_load("SIMULATED_FAILURE_RATE", "0.0")?;
        if !(0.0..=1.0).contains(&simulated_failure_rate) {
            return Err(invalid(
                "SIMULATED_FAILURE_RATE",
                simulated_failure_rate,
                "must be between 0 and 1",
            ));
        }

        let max_attempts: u32 = try_load("FORMS_MAX_ATTEMPTS", "3")?;
        if max_attempts == 0 {
            return Err(invalid("FORMS_MAX_ATTEMPTS", max_attempts, "must be at least 1"));
        }

        Ok(Self {
            port: try_load("RUST_PORT", "1111")?,
            backend,
            supabase_url,
            supabase_key,
            namespace: try_load("FORMS_NAMESPACE", DEFAULT_NAMESPACE)?,
            storage: try_load("FORMS_STORAGE", "file")?,
            storage_dir: try_load("FORMS_STORAGE_DIR", "./data")?,
            redis_url: try_load("REDIS_URL", "redis://127.0.0.1:6379")?,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(try_load("FORMS_BASE_DELAY_MS", "1000")?),
                attempt_timeout: Duration::from_millis(try_load(
                    "FORMS_ATTEMPT_TIMEOUT_MS",
                    "10000",
                )?),
            },
            rate: RateLimitConfig {
                max_requests: try_load("FORMS_RATE_LIMIT", "10")?,
                window: Duration::from_secs(try_load("FORMS_RATE_WINDOW_SECS", "60")?),
            },
            bot: BotScoreConfig {
                threshold: try_load("FORMS_BOT_THRESHOLD", "0.7")?,
                ..BotScoreConfig::default()
            },
            cache_failed: try_load("FORMS_CACHE_FAILED", "true")?,
            simulated_latency: Duration::from_millis(try_load("SIMULATED_LATENCY_MS", "0")?),
            simulated_failure_rate,
            email_function_url: optional("EMAIL_FUNCTION_URL"),
            admin_email: optional("ADMIN_EMAIL"),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1111,
            backend: BackendKind::Simulated,
            supabase_url: None,
            supabase_key: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            storage: StorageKind::File,
            storage_dir: PathBuf::from("./data"),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            retry: RetryPolicy::default(),
            rate: RateLimitConfig::default(),
            bot: BotScoreConfig::default(),
            cache_failed: true,
            simulated_latency: Duration::ZERO,
            simulated_failure_rate: 0.0,
            email_function_url: None,
            admin_email: None,
        }
    }
}

fn invalid(key: &str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        invalid(key, &raw, e)
    })
}

fn read_secret(secret_name: &str) -> Result<String, ConfigError> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|source| {
            warn!("Failed to read {secret_name} from file: {source}");
            ConfigError::Secret {
                name: secret_name.to_string(),
                source,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind() {
        assert_eq!("Supabase".parse(), Ok(BackendKind::Supabase));
        assert_eq!("simulated".parse(), Ok(BackendKind::Simulated));
        assert!("firebase".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_storage_kind() {
        assert_eq!("redis".parse(), Ok(StorageKind::Redis));
        assert!("s3".parse::<StorageKind>().is_err());
    }

    #[test]
    fn test_try_load_default_and_invalid() {
        let port: u16 = try_load("FORMS_TEST_UNSET_PORT", "1111").unwrap();
        assert_eq!(port, 1111);

        let result: Result<u16, _> = try_load("FORMS_TEST_UNSET_PORT", "not-a-port");
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key, .. }) if key == "FORMS_TEST_UNSET_PORT"
        ));
    }

    #[test]
    fn test_missing_secret() {
        assert!(matches!(
            read_secret("FORMS_TEST_NO_SUCH_SECRET"),
            Err(ConfigError::Secret { .. })
        ));
    }
}

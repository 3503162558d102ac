use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::hash::DEFAULT_KDF_ITERATIONS;
use crate::jobs::migration::MigrationConfig;
use crate::middleware::dos_guard::DosGuardConfig;
use crate::validator::ValidatorConfig;

const PLACEHOLDER_SECRET: &str = "CHANGE_ME_SERVER_SECRET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Deserialize)]
pub struct Config {
    /// Keys every hash. Rotating it invalidates every stored key.
    pub server_secret: String,
    /// `None` selects the in-process store and lock.
    pub redis_url: Option<String>,
    pub kdf_iterations: u32,
    pub validator: ValidatorConfig,
    pub dos: DosGuardConfig,
    pub migration: MigrationConfig,
    pub collision_scan_interval_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub log_format: LogFormat,
}

impl Config {
    /// Defaults around an explicit server secret. For embedding and tests.
    pub fn with_secret(server_secret: impl Into<String>) -> Self {
        Self {
            server_secret: server_secret.into(),
            redis_url: None,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            validator: ValidatorConfig::default(),
            dos: DosGuardConfig::default(),
            migration: MigrationConfig::default(),
            collision_scan_interval_secs: 3600,
            expiry_sweep_interval_secs: 300,
            log_format: LogFormat::Text,
        }
    }

    pub fn collision_scan_interval(&self) -> Duration {
        Duration::from_secs(self.collision_scan_interval_secs.max(1))
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs.max(1))
    }

    /// Build from any variable source. `load` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_secret =
            lookup("KEYGATE_SERVER_SECRET").unwrap_or_else(|| PLACEHOLDER_SECRET.into());

        if server_secret == PLACEHOLDER_SECRET {
            let env_mode = lookup("KEYGATE_ENV")
                .or_else(|| lookup("RUST_ENV"))
                .unwrap_or_default();
            if env_mode == "production" {
                anyhow::bail!(
                    "KEYGATE_SERVER_SECRET is still the insecure placeholder. \
                     Set a long random secret before running in production."
                );
            }
            eprintln!("KEYGATE_SERVER_SECRET is not set, using insecure placeholder. Set a long random secret for production.");
        }

        let parsed = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Config::with_secret(server_secret);

        config.redis_url = parsed("REDIS_URL");
        config.kdf_iterations = number(&lookup, "KEYGATE_KDF_ITERATIONS", config.kdf_iterations);
        if config.kdf_iterations == 0 {
            anyhow::bail!("KEYGATE_KDF_ITERATIONS must be positive");
        }
        if let Some(prefix) = parsed("KEYGATE_KEY_PREFIX") {
            config.validator.key_prefix = prefix;
        }
        config.validator.full_scan_cap =
            number(&lookup, "KEYGATE_FULL_SCAN_CAP", config.validator.full_scan_cap);

        config.dos.failure_threshold =
            number(&lookup, "KEYGATE_DOS_FAILURE_THRESHOLD", config.dos.failure_threshold);
        config.dos.cooldown_secs =
            number(&lookup, "KEYGATE_DOS_COOLDOWN_SECS", config.dos.cooldown_secs);
        config.dos.max_full_scan_attempts =
            number(&lookup, "KEYGATE_DOS_MAX_SCANS", config.dos.max_full_scan_attempts);
        config.dos.window_secs = number(&lookup, "KEYGATE_DOS_WINDOW_SECS", config.dos.window_secs);

        config.migration.lease_ttl_ms = number(
            &lookup,
            "KEYGATE_MIGRATION_LEASE_TTL_MS",
            config.migration.lease_ttl_ms,
        );
        config.migration.max_retries = number(
            &lookup,
            "KEYGATE_MIGRATION_MAX_RETRIES",
            config.migration.max_retries,
        );
        config.migration.retry_delay_ms = number(
            &lookup,
            "KEYGATE_MIGRATION_RETRY_DELAY_MS",
            config.migration.retry_delay_ms,
        );
        config.migration.queue_capacity = number(
            &lookup,
            "KEYGATE_MIGRATION_QUEUE_CAPACITY",
            config.migration.queue_capacity,
        );
        config.migration.workers =
            number(&lookup, "KEYGATE_MIGRATION_WORKERS", config.migration.workers);

        config.collision_scan_interval_secs = number(
            &lookup,
            "KEYGATE_COLLISION_SCAN_INTERVAL_SECS",
            config.collision_scan_interval_secs,
        );
        config.expiry_sweep_interval_secs = number(
            &lookup,
            "KEYGATE_EXPIRY_SWEEP_INTERVAL_SECS",
            config.expiry_sweep_interval_secs,
        );
        config.log_format = match parsed("KEYGATE_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(config)
    }
}

// Unparseable values fall back to the default, matching how the gateway
// treats its numeric env vars.
fn number<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_secret", &"[REDACTED]")
            .field("redis_url", &self.redis_url)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("validator", &self.validator)
            .field("dos", &self.dos)
            .field("migration", &self.migration)
            .field("collision_scan_interval_secs", &self.collision_scan_interval_secs)
            .field("expiry_sweep_interval_secs", &self.expiry_sweep_interval_secs)
            .field("log_format", &self.log_format)
            .finish()
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Config::from_lookup(|name| std::env::var(name).ok())
}

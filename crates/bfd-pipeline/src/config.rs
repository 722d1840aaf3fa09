//! Pipeline configuration
//!
//! Everything is read from environment variables (a `.env` file is honoured
//! via `dotenvy`). Unset or unparsable values fall back to the `DEFAULT_*`
//! constants below; [`AppConfig::validate`] rejects combinations that cannot
//! run.

use crate::rda::ClaimType;
use crate::storage::config::StorageConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Slots needed by the volunteer loop, the scheduler loop and one real job.
pub const MIN_WORKER_SLOTS: usize = 3;

pub const DEFAULT_WORKER_SLOTS: usize = 4;
pub const DEFAULT_VOLUNTEER_TICK_MS: u64 = 100;
pub const DEFAULT_SCHEDULER_TICK_MS: u64 = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

pub const DEFAULT_CCW_RUN_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_CCW_DOWNLOAD_ATTEMPTS: u32 = 3;
pub const DEFAULT_CCW_MAX_MANIFEST_AGE_DAYS: i64 = 60;

pub const DEFAULT_RDA_RUN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RDA_BATCH_SIZE: usize = 100;
pub const DEFAULT_RDA_CLAIM_TYPES: &str = "fiss";
pub const DEFAULT_RDA_RETRY_ATTEMPTS: u32 = 5;

pub const DEFAULT_HASH_ITERATIONS: u32 = 1_000;
pub const DEFAULT_HASH_CACHE_SIZE: u64 = 100_000;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

/// Comma separated values, blanks dropped
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub worker_slots: usize,
    pub volunteer_tick: Duration,
    pub scheduler_tick: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_slots: DEFAULT_WORKER_SLOTS,
            volunteer_tick: Duration::from_millis(DEFAULT_VOLUNTEER_TICK_MS),
            scheduler_tick: Duration::from_millis(DEFAULT_SCHEDULER_TICK_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        Self {
            worker_slots: env_or("BFD_WORKER_SLOTS", DEFAULT_WORKER_SLOTS),
            volunteer_tick: Duration::from_millis(env_or(
                "BFD_VOLUNTEER_TICK_MS",
                DEFAULT_VOLUNTEER_TICK_MS,
            )),
            scheduler_tick: Duration::from_millis(env_or(
                "BFD_SCHEDULER_TICK_MS",
                DEFAULT_SCHEDULER_TICK_MS,
            )),
            shutdown_grace: Duration::from_secs(env_or(
                "BFD_SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
        }
    }
}

/// CCW extract loading
#[derive(Debug, Clone)]
pub struct CcwConfig {
    pub enabled: bool,
    pub run_interval: Duration,
    /// Where downloaded extract files are staged while processed
    pub temp_dir: PathBuf,
    /// Where the built-in processor hands files off to the loader
    pub staging_dir: PathBuf,
    pub download_attempts: u32,
    /// Manifests older than this are ignored
    pub max_manifest_age: chrono::Duration,
}

impl Default for CcwConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            run_interval: Duration::from_secs(DEFAULT_CCW_RUN_INTERVAL_SECS),
            temp_dir: std::env::temp_dir().join("bfd-ccw"),
            staging_dir: PathBuf::from("./staging/ccw"),
            download_attempts: DEFAULT_CCW_DOWNLOAD_ATTEMPTS,
            max_manifest_age: chrono::Duration::days(DEFAULT_CCW_MAX_MANIFEST_AGE_DAYS),
        }
    }
}

impl CcwConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_or("CCW_ENABLED", false),
            run_interval: Duration::from_secs(env_or(
                "CCW_RUN_INTERVAL_SECS",
                DEFAULT_CCW_RUN_INTERVAL_SECS,
            )),
            temp_dir: env_opt("CCW_TEMP_DIR").map_or(defaults.temp_dir, PathBuf::from),
            staging_dir: env_opt("CCW_STAGING_DIR").map_or(defaults.staging_dir, PathBuf::from),
            download_attempts: env_or("CCW_DOWNLOAD_ATTEMPTS", DEFAULT_CCW_DOWNLOAD_ATTEMPTS),
            max_manifest_age: chrono::Duration::days(env_or(
                "CCW_MAX_MANIFEST_AGE_DAYS",
                DEFAULT_CCW_MAX_MANIFEST_AGE_DAYS,
            )),
        }
    }
}

/// Claims-change stream loading
#[derive(Debug, Clone)]
pub struct RdaConfig {
    pub enabled: bool,
    pub run_interval: Duration,
    pub batch_size: usize,
    /// Where to start reading when no progress has been recorded yet
    pub starting_sequence: Option<i64>,
    /// One load job is registered per entry
    pub claim_types: Vec<String>,
    /// Directory holding one `<claim_type>.ndjson` file per claim type
    pub source_dir: Option<PathBuf>,
    /// Attempts for stream, progress and dead letter calls, including the first
    pub retry_attempts: u32,
    pub replay_dead_letters: bool,
    /// JSON lines destination, used when no database is configured
    pub output_file: PathBuf,
    pub database_url: Option<String>,
}

impl Default for RdaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            run_interval: Duration::from_secs(DEFAULT_RDA_RUN_INTERVAL_SECS),
            batch_size: DEFAULT_RDA_BATCH_SIZE,
            starting_sequence: None,
            claim_types: split_list(DEFAULT_RDA_CLAIM_TYPES),
            source_dir: None,
            retry_attempts: DEFAULT_RDA_RETRY_ATTEMPTS,
            replay_dead_letters: true,
            output_file: PathBuf::from("./output/claims.ndjson"),
            database_url: None,
        }
    }
}

impl RdaConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_or("RDA_ENABLED", false),
            run_interval: Duration::from_secs(env_or(
                "RDA_RUN_INTERVAL_SECS",
                DEFAULT_RDA_RUN_INTERVAL_SECS,
            )),
            batch_size: env_or("RDA_BATCH_SIZE", DEFAULT_RDA_BATCH_SIZE),
            starting_sequence: env_opt("RDA_STARTING_SEQUENCE").and_then(|s| s.parse().ok()),
            claim_types: env_opt("RDA_CLAIM_TYPES").map_or(defaults.claim_types, |s| split_list(&s)),
            source_dir: env_opt("RDA_SOURCE_DIR").map(PathBuf::from),
            retry_attempts: env_or("RDA_RETRY_ATTEMPTS", DEFAULT_RDA_RETRY_ATTEMPTS),
            replay_dead_letters: env_or("RDA_REPLAY_DEAD_LETTERS", true),
            output_file: env_opt("RDA_OUTPUT_FILE").map_or(defaults.output_file, PathBuf::from),
            database_url: env_opt("DATABASE_URL"),
        }
    }

    /// The configured claim types, rejecting unknown or repeated entries.
    pub fn parsed_claim_types(&self) -> anyhow::Result<Vec<ClaimType>> {
        if self.claim_types.is_empty() {
            anyhow::bail!("RDA_CLAIM_TYPES must name at least one claim type");
        }
        let mut parsed = Vec::with_capacity(self.claim_types.len());
        for name in &self.claim_types {
            let claim_type: ClaimType = name
                .parse()
                .map_err(|e| anyhow::anyhow!("RDA_CLAIM_TYPES: {e}"))?;
            if parsed.contains(&claim_type) {
                anyhow::bail!("RDA_CLAIM_TYPES lists {claim_type} more than once");
            }
            parsed.push(claim_type);
        }
        Ok(parsed)
    }
}

/// Identifier hashing
#[derive(Clone)]
pub struct HasherConfig {
    /// Hex encoded secret
    pub pepper: String,
    pub iterations: u32,
    /// 0 disables the cache
    pub cache_size: u64,
}

impl std::fmt::Debug for HasherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HasherConfig")
            .field("pepper", &"<redacted>")
            .field("iterations", &self.iterations)
            .field("cache_size", &self.cache_size)
            .finish()
    }
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            pepper: String::new(),
            iterations: DEFAULT_HASH_ITERATIONS,
            cache_size: DEFAULT_HASH_CACHE_SIZE,
        }
    }
}

impl HasherConfig {
    pub fn from_env() -> Self {
        Self {
            pepper: env_opt("HASH_PEPPER").unwrap_or_default(),
            iterations: env_or("HASH_ITERATIONS", DEFAULT_HASH_ITERATIONS),
            cache_size: env_or("HASH_CACHE_SIZE", DEFAULT_HASH_CACHE_SIZE),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub manager: ManagerConfig,
    pub storage: StorageConfig,
    pub ccw: CcwConfig,
    pub rda: RdaConfig,
    pub hasher: HasherConfig,
}

impl AppConfig {
    /// Read `.env` if present, then the process environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            manager: ManagerConfig::from_env(),
            storage: StorageConfig::from_env(),
            ccw: CcwConfig::from_env(),
            rda: RdaConfig::from_env(),
            hasher: HasherConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.manager.worker_slots < MIN_WORKER_SLOTS {
            anyhow::bail!("BFD_WORKER_SLOTS must be at least {}", MIN_WORKER_SLOTS);
        }
        if self.manager.volunteer_tick.is_zero() {
            anyhow::bail!("BFD_VOLUNTEER_TICK_MS must be greater than 0");
        }
        if self.manager.scheduler_tick.is_zero() {
            anyhow::bail!("BFD_SCHEDULER_TICK_MS must be greater than 0");
        }

        if self.ccw.enabled {
            if self.storage.bucket.is_empty() {
                anyhow::bail!("S3_BUCKET is required when CCW_ENABLED is set");
            }
            if self.ccw.download_attempts == 0 {
                anyhow::bail!("CCW_DOWNLOAD_ATTEMPTS must be greater than 0");
            }
        }

        if self.rda.enabled {
            if self.rda.batch_size == 0 {
                anyhow::bail!("RDA_BATCH_SIZE must be greater than 0");
            }
            if self.rda.source_dir.is_none() {
                anyhow::bail!("RDA_SOURCE_DIR is required when RDA_ENABLED is set");
            }
            if self.rda.retry_attempts == 0 {
                anyhow::bail!("RDA_RETRY_ATTEMPTS must be greater than 0");
            }
            self.rda.parsed_claim_types()?;
            if self.hasher.pepper.is_empty() {
                anyhow::bail!("HASH_PEPPER is required when RDA_ENABLED is set");
            }
            if self.hasher.iterations == 0 {
                anyhow::bail!("HASH_ITERATIONS must be greater than 0");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_too_few_slots() {
        let mut config = AppConfig::default();
        config.manager.worker_slots = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("BFD_WORKER_SLOTS"));
    }

    #[test]
    fn test_rda_requires_pepper_and_source() {
        let mut config = AppConfig::default();
        config.rda.enabled = true;
        assert!(config.validate().is_err());

        config.rda.source_dir = Some(PathBuf::from("changes"));
        assert!(config.validate().is_err());

        config.hasher.pepper = "6e6f74746865".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_claim_types_must_be_known_and_distinct() {
        let mut config = AppConfig::default();
        config.rda.enabled = true;
        config.rda.source_dir = Some(PathBuf::from("changes"));
        config.hasher.pepper = "6e6f74746865".to_string();

        config.rda.claim_types = split_list("fiss, MCS");
        assert_eq!(
            config.rda.parsed_claim_types().unwrap(),
            vec![ClaimType::Fiss, ClaimType::Mcs]
        );
        assert!(config.validate().is_ok());

        config.rda.claim_types = split_list("fiss,dme");
        assert!(config.validate().unwrap_err().to_string().contains("dme"));

        config.rda.claim_types = split_list("mcs,Mcs");
        assert!(config.validate().unwrap_err().to_string().contains("more than once"));

        config.rda.claim_types = split_list(" , ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hasher_debug_redacts_pepper() {
        let config = HasherConfig {
            pepper: "deadbeef".into(),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("deadbeef"));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_and_fallbacks() {
        std::env::set_var("BFD_WORKER_SLOTS", "8");
        std::env::set_var("BFD_VOLUNTEER_TICK_MS", "not-a-number");
        std::env::set_var("RDA_STARTING_SEQUENCE", "42");
        std::env::set_var("RDA_CLAIM_TYPES", "fiss,mcs");

        let manager = ManagerConfig::from_env();
        let rda = RdaConfig::from_env();

        assert_eq!(manager.worker_slots, 8);
        assert_eq!(
            manager.volunteer_tick,
            Duration::from_millis(DEFAULT_VOLUNTEER_TICK_MS)
        );
        assert_eq!(rda.starting_sequence, Some(42));
        assert_eq!(rda.claim_types, vec!["fiss", "mcs"]);
        assert_eq!(rda.retry_attempts, DEFAULT_RDA_RETRY_ATTEMPTS);

        std::env::remove_var("BFD_WORKER_SLOTS");
        std::env::remove_var("BFD_VOLUNTEER_TICK_MS");
        std::env::remove_var("RDA_STARTING_SEQUENCE");
        std::env::remove_var("RDA_CLAIM_TYPES");
    }
}

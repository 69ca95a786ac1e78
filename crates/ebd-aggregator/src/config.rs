//! Pipeline configuration
//!
//! Loaded once from `.env`, the environment and `DEFAULT_*` constants, then
//! overridden by command-line flags and validated. The resulting value is
//! passed explicitly into every stage; nothing reads the environment later.

use ebd_common::format::{format_size, parse_size};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregate::{AggregationConfig, DEFAULT_MIN_SAMPLES};
use crate::engine::EngineSettings;
use crate::error::Result;
use crate::reference::client::{DEFAULT_API_BASE, DEFAULT_HOTSPOT_DELAY_MS};
use crate::reference::EbirdClientConfig;
use crate::score::DEFAULT_Z;
use crate::storage::{DEFAULT_INSERT_BATCH, MAX_INSERT_BATCH};

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default root for datasets, reference files and outputs.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default memory ceiling for the aggregation engine.
pub const DEFAULT_MEMORY_LIMIT: &str = "2GiB";

/// Default capacity of the aggregation → writer channel, in rows.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8192;

/// Default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default S3 bucket for packs.
pub const DEFAULT_S3_BUCKET: &str = "ebd-packs";

/// S3-compatible object storage settings for pack upload
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            bucket: DEFAULT_S3_BUCKET.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

/// eBird API settings
#[derive(Debug, Clone)]
pub struct EbirdConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub hotspot_delay_ms: u64,
}

impl Default for EbirdConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            hotspot_delay_ms: DEFAULT_HOTSPOT_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Aggregation engine memory ceiling in bytes
    pub memory_limit: u64,
    pub threads: usize,
    pub wilson_z: f64,
    pub min_samples: u32,
    /// Engine scratch root; system temp when unset
    pub temp_dir: Option<PathBuf>,
    pub channel_capacity: usize,
    pub insert_batch: usize,
    pub ebird: EbirdConfig,
    pub storage: StorageConfig,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// `default` when `raw` is unset or blank, otherwise the parsed value
fn parse_setting<T: FromStr>(key: &str, raw: Option<String>, default: T) -> anyhow::Result<T> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => match value.parse() {
            Ok(parsed) => Ok(parsed),
            Err(_) => anyhow::bail!("Invalid value for {}: '{}'", key, value),
        },
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    parse_setting(key, std::env::var(key).ok(), default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            memory_limit: 2 * 1024 * 1024 * 1024,
            threads: default_threads(),
            wilson_z: DEFAULT_Z,
            min_samples: DEFAULT_MIN_SAMPLES,
            temp_dir: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            insert_batch: DEFAULT_INSERT_BATCH,
            ebird: EbirdConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `.env`, the environment and defaults
    ///
    /// Unset or blank variables take their default. A value that does not
    /// parse is an error naming the variable.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let memory_limit = parse_size(
            &std::env::var("EBD_MEMORY_LIMIT").unwrap_or_else(|_| DEFAULT_MEMORY_LIMIT.to_string()),
        )?;

        let config = PipelineConfig {
            data_dir: env_string("EBD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            memory_limit,
            threads: env_parse("EBD_THREADS", default_threads())?,
            wilson_z: env_parse("EBD_WILSON_Z", DEFAULT_Z)?,
            min_samples: env_parse("EBD_MIN_SAMPLES", DEFAULT_MIN_SAMPLES)?,
            temp_dir: env_string("EBD_TEMP_DIR").map(PathBuf::from),
            channel_capacity: env_parse("EBD_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?,
            insert_batch: env_parse("EBD_INSERT_BATCH", DEFAULT_INSERT_BATCH)?,
            ebird: EbirdConfig {
                api_key: env_string("EBIRD_API_KEY"),
                api_base: env_string("EBIRD_API_BASE")
                    .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
                hotspot_delay_ms: env_parse("EBD_HOTSPOT_DELAY_MS", DEFAULT_HOTSPOT_DELAY_MS)?,
            },
            storage: StorageConfig {
                endpoint: env_string("S3_ENDPOINT"),
                region: env_string("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                bucket: env_string("S3_BUCKET").unwrap_or_else(|| DEFAULT_S3_BUCKET.to_string()),
                access_key: env_string("S3_ACCESS_KEY").or_else(|| env_string("AWS_ACCESS_KEY_ID")),
                secret_key: env_string("S3_SECRET_KEY")
                    .or_else(|| env_string("AWS_SECRET_ACCESS_KEY")),
                path_style: env_parse("S3_PATH_STYLE", false)?,
            },
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            anyhow::bail!("Thread count must be greater than 0");
        }

        if !self.wilson_z.is_finite() || self.wilson_z <= 0.0 {
            anyhow::bail!("Wilson z must be a positive finite number, got {}", self.wilson_z);
        }

        if self.min_samples == 0 {
            anyhow::bail!("Minimum samples must be at least 1");
        }

        if self.channel_capacity == 0 {
            anyhow::bail!("Channel capacity must be greater than 0");
        }

        if self.insert_batch == 0 || self.insert_batch > MAX_INSERT_BATCH {
            anyhow::bail!(
                "Insert batch must be between 1 and {}, got {}",
                MAX_INSERT_BATCH,
                self.insert_batch
            );
        }

        if self.memory_limit == 0 {
            anyhow::bail!("Memory limit must be greater than 0");
        }

        if self.ebird.api_key.is_none() {
            tracing::debug!("EBIRD_API_KEY not set - reference fetches will be unauthenticated");
        }

        Ok(())
    }

    pub fn aggregation(&self) -> AggregationConfig {
        AggregationConfig {
            z: self.wilson_z,
            min_samples: self.min_samples,
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join("ebd-aggregator")
    }

    /// Engine limits for the aggregation stage
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        tracing::debug!(
            memory_limit = %format_size(self.memory_limit),
            threads = self.threads,
            "Sizing aggregation engine"
        );
        EngineSettings::new(self.memory_limit, self.threads, self.scratch_root())
    }

    pub fn ebird_client(&self) -> EbirdClientConfig {
        let mut config = EbirdClientConfig::default()
            .with_base_url(self.ebird.api_base.clone())
            .with_hotspot_delay(Duration::from_millis(self.ebird.hotspot_delay_ms));
        if let Some(key) = &self.ebird.api_key {
            config = config.with_api_key(key.clone());
        }
        config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregation().min_samples, 2);
        assert_eq!(config.memory_limit, parse_size(DEFAULT_MEMORY_LIMIT).unwrap());
    }

    #[test]
    fn test_rejects_bad_z() {
        for z in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = PipelineConfig {
                wilson_z: z,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "z = {} accepted", z);
        }
    }

    #[test]
    fn test_rejects_zero_min_samples_and_oversized_batch() {
        let config = PipelineConfig {
            min_samples: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            insert_batch: MAX_INSERT_BATCH + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_setting_names_variable() {
        let err = parse_setting("EBD_WILSON_Z", Some("1,96".to_string()), DEFAULT_Z).unwrap_err();
        assert!(err.to_string().contains("EBD_WILSON_Z"), "{}", err);

        let err = parse_setting("EBD_MIN_SAMPLES", Some("two".to_string()), 2u32).unwrap_err();
        assert!(err.to_string().contains("EBD_MIN_SAMPLES"), "{}", err);
    }

    #[test]
    fn test_unset_or_blank_setting_uses_default() {
        assert_eq!(parse_setting("EBD_MIN_SAMPLES", None, 2u32).unwrap(), 2);
        assert_eq!(parse_setting("EBD_MIN_SAMPLES", Some("  ".to_string()), 2u32).unwrap(), 2);
        assert_eq!(parse_setting("EBD_MIN_SAMPLES", Some(" 5 ".to_string()), 2u32).unwrap(), 5);
        assert!(parse_setting("S3_PATH_STYLE", Some("true".to_string()), false).unwrap());
    }

    #[test]
    fn test_ebird_client_settings() {
        let config = PipelineConfig {
            ebird: EbirdConfig {
                api_key: Some("key".to_string()),
                api_base: "http://localhost:1234".to_string(),
                hotspot_delay_ms: 0,
            },
            ..Default::default()
        };
        let client = config.ebird_client();
        assert_eq!(client.api_key.as_deref(), Some("key"));
        assert_eq!(client.base_url, "http://localhost:1234");
        assert!(client.hotspot_delay.is_zero());
    }
}

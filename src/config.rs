//! Configuration for a serving instance
//!
//! All sections fall back to defaults when missing from the TOML file, and
//! a handful of `EMBER_*` environment variables override the most commonly
//! tuned values.

use ember_types::{
    EmberError, KvCacheConfig, LoggingConfig, ParallelConfig, Result, RouterConfig, RunMode,
    TransferConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete configuration of one serving instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmberConfig {
    /// Admission, batching and run-mode settings
    pub router: RouterConfig,
    /// Per-token cache layout and prefix caching
    pub kv_cache: KvCacheConfig,
    /// Data-parallel layout
    pub parallel: ParallelConfig,
    /// Cache copy tunables for disaggregated serving
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

impl EmberConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EmberError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EMBER_*` environment overrides on top of this configuration
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(mode) = std::env::var("EMBER_RUN_MODE") {
            self.router.run_mode = match mode.to_lowercase().as_str() {
                "normal" => RunMode::Normal,
                "prefill" => RunMode::Prefill,
                "decode" => RunMode::Decode,
                other => {
                    return Err(EmberError::config(format!("Invalid run mode: {}", other)));
                }
            };
        }
        if let Ok(value) = std::env::var("EMBER_MAX_TOTAL_TOKEN_NUM") {
            self.router.max_total_token_num = value
                .parse()
                .map_err(|_| EmberError::config("Invalid max_total_token_num"))?;
        }
        if let Ok(value) = std::env::var("EMBER_BATCH_MAX_TOKENS") {
            self.router.batch_max_tokens = value
                .parse()
                .map_err(|_| EmberError::config("Invalid batch_max_tokens"))?;
        }
        if let Ok(value) = std::env::var("EMBER_DP") {
            self.parallel.dp = value
                .parse()
                .map_err(|_| EmberError::config("Invalid dp"))?;
        }
        if let Ok(level) = std::env::var("EMBER_LOG_LEVEL") {
            self.logging.level = level;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        self.kv_cache.validate()?;
        self.parallel.validate()?;
        self.transfer.validate()?;

        if self.kv_cache.use_dynamic_prompt_cache
            && self.kv_cache.cache_capacity > self.router.max_total_token_num
        {
            return Err(EmberError::config(format!(
                "cache_capacity ({}) exceeds max_total_token_num ({})",
                self.kv_cache.cache_capacity, self.router.max_total_token_num
            )));
        }
        if self.router.max_req_total_len > self.router.admission_limit() {
            return Err(EmberError::config(format!(
                "max_req_total_len ({}) exceeds admission limit ({})",
                self.router.max_req_total_len,
                self.router.admission_limit()
            )));
        }
        if self.router.is_embedding && self.router.run_mode != RunMode::Normal {
            return Err(EmberError::config(
                "embedding models only run in normal mode",
            ));
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(EmberError::config(format!("Invalid log format: {}", other)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EmberConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.run_mode, RunMode::Normal);
        assert_eq!(config.transfer.worker_count, 20);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config = EmberConfig::from_toml_str(
            r#"
            [router]
            run_mode = "prefill"
            max_total_token_num = 2048
            max_req_total_len = 1024
            batch_max_tokens = 512
            chunked_prefill_size = 256

            [parallel]
            dp = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.router.run_mode, RunMode::Prefill);
        assert_eq!(config.router.max_total_token_num, 2048);
        assert_eq!(config.parallel.dp, 2);
        assert_eq!(config.parallel.cards_per_shard, 1);
        assert_eq!(config.kv_cache, KvCacheConfig::default());
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let err = EmberConfig::from_toml_str("[transfer]\nworker_count = 0\n").unwrap_err();
        assert!(matches!(err, EmberError::Config { .. }));

        let err = EmberConfig::from_toml_str("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, EmberError::Config { .. }));

        let err = EmberConfig::from_toml_str("[router]\nmax_total_token_num = \"many\"\n")
            .unwrap_err();
        assert!(matches!(err, EmberError::Config { .. }));
    }
}

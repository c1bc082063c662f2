use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid breaker configuration: {0}")]
    InvalidBreaker(String),

    #[error("Invalid confidence weights: {0}")]
    InvalidWeights(String),

    #[error("Invalid risk_threshold: {0}. Must be between 0 and 1")]
    InvalidRiskThreshold(f64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging from the working directory
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .mender/config.yaml (project config)
    /// 3. .mender/local.yaml (project local overrides, optional)
    /// 4. Environment variables (MENDER_* prefix, `__` separates nested keys)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(".")
    }

    /// Same as [`Self::load`], with `.mender/` resolved under `root`.
    pub fn load_from_dir(root: impl AsRef<Path>) -> Result<Config> {
        let dir = root.as_ref().join(".mender");
        let config: Config = Self::figment()
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed("MENDER_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Self::figment()
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new().merge(Serialized::defaults(Config::default()))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        config
            .breaker
            .validate()
            .map_err(|e| ConfigError::InvalidBreaker(e.to_string()))?;

        let weights = &config.confidence_weights;
        let all = [weights.syntax, weights.logic, weights.risk];
        if all.iter().any(|w| w.is_nan() || *w < 0.0) {
            return Err(ConfigError::InvalidWeights(
                "weights must be non-negative".to_string(),
            ));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::InvalidWeights(
                "at least one weight must be positive".to_string(),
            ));
        }

        let threshold = config.escalation.risk_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidRiskThreshold(threshold));
        }
        if config
            .escalation
            .sensitive_categories
            .iter()
            .any(|c| c.trim().is_empty())
        {
            return Err(ConfigError::ValidationFailed(
                "sensitive categories cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}

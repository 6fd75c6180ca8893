//! Configuration for the evaluation service

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EvalError, Result};
use crate::service::Options;

/// Service-level defaults loaded from file and environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalServiceConfig {
    /// Workers per stage pool
    pub case_parallelism: usize,

    /// Run inference cases on the worker pool
    pub parallel_inference: bool,

    /// Run scoring cases on the worker pool
    pub parallel_evaluation: bool,

    /// Reject cases instead of waiting when every worker is busy
    pub nonblocking_submit: bool,

    /// Deadline for a single case, e.g. "30s" or "2m"
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub case_timeout: Option<Duration>,
}

impl Default for EvalServiceConfig {
    fn default() -> Self {
        Self {
            case_parallelism: crate::service::default_parallelism(),
            parallel_inference: false,
            parallel_evaluation: false,
            nonblocking_submit: false,
            case_timeout: None,
        }
    }
}

impl EvalServiceConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources win:
    /// 1. Defaults
    /// 2. `evalkit.toml` in the working directory
    /// 3. The file named by `EVALKIT_CONFIG_PATH`
    /// 4. `EVALKIT_*` environment variables (e.g. `EVALKIT_CASE_PARALLELISM=8`)
    ///
    /// # Errors
    ///
    /// Returns an error if a file is invalid or the result fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Toml},
        };

        let mut figment = Figment::new().merge(Toml::file("evalkit.toml"));
        if let Ok(path) = std::env::var("EVALKIT_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("EVALKIT_").ignore(&["CONFIG_PATH"]));

        let config: EvalServiceConfig = figment.extract().map_err(|e| {
            EvalError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let config: EvalServiceConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                EvalError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.case_parallelism == 0 {
            return Err(EvalError::Configuration(
                "case_parallelism must be greater than 0".to_string(),
            ));
        }
        if self.case_timeout.is_some_and(|t| t.is_zero()) {
            return Err(EvalError::Configuration(
                "case_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Service defaults carrying these settings
    pub fn to_options(&self) -> Options {
        Options {
            case_parallelism: self.case_parallelism,
            parallel_inference: self.parallel_inference,
            parallel_evaluation: self.parallel_evaluation,
            nonblocking_submit: self.nonblocking_submit,
            case_timeout: self.case_timeout,
            ..Options::default()
        }
    }
}

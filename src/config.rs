//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::compiler::JournalSizePolicy;

/// Default bound on the journal naming lock wait.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;
/// Default byte skew added to the target's rounding input when source and
/// target families cannot allocate identical capacities.
pub const DEFAULT_TARGET_SKEW_BYTES: u64 = 5 * 1024 * 1024;
/// Default floor for every journal sizing policy (10 GiB).
pub const DEFAULT_JOURNAL_MINIMUM_BYTES: u64 = 10 * 1024 * 1024 * 1024;
/// Default journal sizing policy for pools that do not name one.
pub const DEFAULT_JOURNAL_POLICY: &str = "min";

/// Planner configuration derived from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "RUSLAN",
    discovery(
        app_name = "ruslan",
        env_var = "RUSLAN_CONFIG_PATH",
        config_file_name = "ruslan.toml",
        dotfile_name = ".ruslan.toml",
        project_file_name = "ruslan.toml"
    )
)]
pub struct PlannerConfig {
    /// Seconds to wait for the journal naming lock before failing.
    #[ortho_config(default = DEFAULT_LOCK_TIMEOUT_SECS)]
    pub lock_timeout_secs: u64,
    /// Bytes added to the target's rounding input on the unmatched path.
    #[ortho_config(default = DEFAULT_TARGET_SKEW_BYTES)]
    pub target_skew_bytes: u64,
    /// Smallest journal ever provisioned, in bytes.
    #[ortho_config(default = DEFAULT_JOURNAL_MINIMUM_BYTES)]
    pub journal_minimum_bytes: u64,
    /// Journal sizing policy for pools that do not name one.
    #[ortho_config(default = DEFAULT_JOURNAL_POLICY.to_owned())]
    pub default_journal_policy: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn invalid(&self, problem: &str) -> ConfigError {
        ConfigError::InvalidField(format!(
            "{} {problem}: set {} or {} in ruslan.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl PlannerConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("ruslan")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages say which environment
    /// variable or key to change.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a value is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_secs == 0 {
            return Err(FieldMetadata::new(
                "journal lock timeout",
                "RUSLAN_LOCK_TIMEOUT_SECS",
                "lock_timeout_secs",
            )
            .invalid("must be greater than zero"));
        }
        if self.journal_minimum_bytes == 0 {
            return Err(FieldMetadata::new(
                "minimum journal size",
                "RUSLAN_JOURNAL_MINIMUM_BYTES",
                "journal_minimum_bytes",
            )
            .invalid("must be greater than zero"));
        }
        self.default_journal_policy
            .parse::<JournalSizePolicy>()
            .map_err(|err| {
                FieldMetadata::new(
                    "default journal policy",
                    "RUSLAN_DEFAULT_JOURNAL_POLICY",
                    "default_journal_policy",
                )
                .invalid(&err.to_string())
            })?;
        Ok(())
    }

    /// Validates the configuration and converts it into [`PlannerSettings`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn settings(&self) -> Result<PlannerSettings, ConfigError> {
        self.validate()?;
        let default_journal_policy = self
            .default_journal_policy
            .parse::<JournalSizePolicy>()
            .map_err(|err| ConfigError::InvalidField(err.to_string()))?;
        Ok(PlannerSettings {
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            target_skew_bytes: self.target_skew_bytes,
            journal_minimum_bytes: self.journal_minimum_bytes,
            default_journal_policy,
        })
    }
}

/// Immutable planner settings handed to every component by value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlannerSettings {
    /// Bound on the journal naming lock wait.
    pub lock_timeout: Duration,
    /// Bytes added to the target's rounding input on the unmatched path.
    pub target_skew_bytes: u64,
    /// Smallest journal ever provisioned, in bytes.
    pub journal_minimum_bytes: u64,
    /// Journal sizing policy for pools that do not name one.
    pub default_journal_policy: JournalSizePolicy,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            target_skew_bytes: DEFAULT_TARGET_SKEW_BYTES,
            journal_minimum_bytes: DEFAULT_JOURNAL_MINIMUM_BYTES,
            default_journal_policy: JournalSizePolicy::Minimum,
        }
    }
}

impl PlannerSettings {
    /// Overrides the lock wait bound, primarily used by tests.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Overrides the minimum journal size.
    #[must_use]
    pub const fn with_journal_minimum_bytes(mut self, bytes: u64) -> Self {
        self.journal_minimum_bytes = bytes;
        self
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    InvalidField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

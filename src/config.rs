//! Layered runtime configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `MEDIARELAY_*` environment variables.

use crate::task::{
    domain::{
        DEFAULT_BACKOFF_SECS, DEFAULT_MAX_ATTEMPTS, DeliveryTarget, RetryPolicy, RetryPolicyError,
        TaskDomainError,
    },
    services::{
        CaptionTemplate, CaptionTemplateError, DEFAULT_CAPTION_TEMPLATE, DispatchMode,
        PipelineSettings, RelaySettings,
    },
};
use crate::telemetry::LogFormat;
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "MEDIARELAY";

/// Configuration file used when none is named.
pub const DEFAULT_CONFIG_FILE: &str = "mediarelay.toml";

/// Delivery target of the log notifier side effect.
pub const NOTIFY_TARGET: &str = "notify";

/// Minimum ratio between the abandoned-work lease and the collaborator
/// timeout. A task waits for at most one full pipeline run of another
/// worker before its own stages start refreshing `updated_at`.
const STALE_TIMEOUT_FACTOR: u64 = 8;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The backoff table or attempt ceiling is unusable.
    #[error(transparent)]
    Retry(#[from] RetryPolicyError),
    /// A template does not parse.
    #[error(transparent)]
    Template(#[from] CaptionTemplateError),
    /// A delivery target is blank.
    #[error(transparent)]
    Target(#[from] TaskDomainError),
}

/// Full relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// `PostgreSQL` connection URL.
    pub database_url: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Root for stored and prepared media.
    pub storage_dir: Utf8PathBuf,
    /// Directory the local downloader reads from.
    pub inbox_dir: Utf8PathBuf,
    /// Directory the local publisher writes to.
    pub outbox_dir: Utf8PathBuf,
    /// Number of pipeline workers.
    pub worker_count: usize,
    /// Idle wait between empty polls, in seconds.
    pub poll_interval_secs: u64,
    /// Attempt ceiling per task and delivery.
    pub max_attempts: u32,
    /// Retry delays in seconds, one per attempt.
    pub backoff_secs: Vec<u64>,
    /// Poll or push dispatching.
    pub dispatch_mode: DispatchMode,
    /// Capacity of the hint channel.
    pub hint_capacity: usize,
    /// Upper bound on any collaborator call, in seconds.
    pub collaborator_timeout_secs: u64,
    /// Grace period for workers on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Idle time after which an in-progress task or sending delivery is
    /// treated as abandoned, in seconds.
    pub stale_after_secs: u64,
    /// Interval between abandoned-work sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Delivery target that guards publishing.
    pub publish_target: String,
    /// Caption template.
    pub caption_template: String,
    /// Template for the log notifier; unset disables it.
    pub notify_template: Option<String>,
    /// Default `tracing` filter.
    pub log_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/mediarelay".to_owned(),
            pool_size: 8,
            storage_dir: Utf8PathBuf::from("media"),
            inbox_dir: Utf8PathBuf::from("inbox"),
            outbox_dir: Utf8PathBuf::from("outbox"),
            worker_count: 4,
            poll_interval_secs: 10,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
            dispatch_mode: DispatchMode::Poll,
            hint_capacity: 256,
            collaborator_timeout_secs: 120,
            shutdown_timeout_secs: 30,
            stale_after_secs: 1_800,
            sweep_interval_secs: 60,
            publish_target: "status".to_owned(),
            caption_template: DEFAULT_CAPTION_TEMPLATE.to_owned(),
            notify_template: None,
            log_filter: "info".to_owned(),
            log_format: LogFormat::Compact,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from `file` and the process environment.
    ///
    /// A missing file is an error only when `required` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a source cannot be read or the result
    /// fails [`RelayConfig::validate`].
    pub fn load(file: &Utf8Path, required: bool) -> Result<Self, ConfigError> {
        Self::load_with_env(file, required, None)
    }

    /// Loads configuration with an explicit environment map in place of the
    /// process environment when `env` is `Some`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] as for [`RelayConfig::load`].
    pub fn load_with_env(
        file: &Utf8Path,
        required: bool,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let loaded: Self = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name(file.as_str()).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("backoff_secs")
                    .source(env),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Checks values that deserialization cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero count or interval, a lease that a
    /// live stage could outlast, an unusable backoff table, a blank publish
    /// target or a template that does not parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("worker_count", u64::try_from(self.worker_count).unwrap_or(u64::MAX)),
            ("pool_size", u64::from(self.pool_size)),
            ("poll_interval_secs", self.poll_interval_secs),
            ("collaborator_timeout_secs", self.collaborator_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        let min_lease = self
            .collaborator_timeout_secs
            .saturating_mul(STALE_TIMEOUT_FACTOR);
        if self.stale_after_secs < min_lease {
            return Err(ConfigError::Invalid(format!(
                "stale_after_secs must be at least {min_lease} \
                 ({STALE_TIMEOUT_FACTOR} collaborator timeouts)"
            )));
        }
        self.retry_policy()?;
        CaptionTemplate::new(self.caption_template.as_str())?;
        if let Some(template) = &self.notify_template {
            CaptionTemplate::new(template.as_str())?;
        }
        DeliveryTarget::new(self.publish_target.as_str())?;
        if self.notify_template.is_some() && self.publish_target == NOTIFY_TARGET {
            return Err(ConfigError::Invalid(format!(
                "publish_target must differ from the notifier target {NOTIFY_TARGET}"
            )));
        }
        Ok(())
    }

    /// Builds the retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] for an unusable table or ceiling.
    pub fn retry_policy(&self) -> Result<RetryPolicy, RetryPolicyError> {
        RetryPolicy::from_secs(&self.backoff_secs, self.max_attempts)
    }

    /// Builds runtime settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn relay_settings(&self) -> Result<RelaySettings, ConfigError> {
        Ok(RelaySettings {
            worker_count: self.worker_count,
            dispatch_mode: self.dispatch_mode,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            hint_capacity: self.hint_capacity,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            pipeline: PipelineSettings {
                policy: self.retry_policy()?,
                collaborator_timeout: Duration::from_secs(self.collaborator_timeout_secs),
                publish_target: DeliveryTarget::new(self.publish_target.as_str())?,
                caption: CaptionTemplate::new(self.caption_template.as_str())?,
            },
        })
    }
}

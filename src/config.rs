//! Process configuration for pg_viewmat.
//!
//! Read once at startup from an optional TOML file, then overridden by
//! `PG_VIEWMAT_*` environment variables, then validated. The resulting
//! [`SchedulerConfig`] is immutable and handed to every component at
//! construction; nothing reads configuration from ambient state later.
//!
//! ```toml
//! view_schema = "views"
//! materialized_schema = "materialized"
//! work_schema = "pg_viewmat"
//! schedule = "30s"
//!
//! [retry]
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//!
//! [log]
//! format = "json"
//! filter = "pg_viewmat=debug,info"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RetryPolicy, ViewMatError};
use crate::policy::SchedulePolicy;

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENT_LEN: usize = 63;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PG_VIEWMAT_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Schema the views to materialize are discovered in.
    pub view_schema: String,
    /// Schema the materialized output tables live in.
    pub materialized_schema: String,
    /// Schema for change-tracking bookkeeping.
    pub work_schema: String,
    /// Pass cadence: `continuous`, a duration (`30s`, `5m`) or a cron
    /// expression.
    pub schedule: String,
    pub retry: RetryConfig,
    pub log: LogConfig,
    /// Connection string used by the binary.
    pub database_url: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            view_schema: "views".to_string(),
            materialized_schema: "materialized".to_string(),
            work_schema: "pg_viewmat".to_string(),
            schedule: "continuous".to_string(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
            database_url: None,
        }
    }
}

/// Backoff for views whose refresh keeps failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// `0` retries a failing view on every pass.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failures before a view is reported at `error` level.
    pub alert_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        RetryConfig {
            base_delay_ms: policy.base_delay_ms,
            max_delay_ms: policy.max_delay_ms,
            alert_threshold: policy.alert_threshold,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            alert_threshold: self.alert_threshold,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ViewMatError> {
        toml::from_str(s).map_err(|e| ViewMatError::InvalidConfig(e.to_string()))
    }

    /// Load the file (if any), apply environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ViewMatError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ViewMatError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `PG_VIEWMAT_<FIELD>` variables.
    ///
    /// `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ViewMatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let parse_num = |name: &str, value: String| {
            value.trim().parse::<u64>().map_err(|_| {
                ViewMatError::InvalidConfig(format!(
                    "{ENV_PREFIX}{name} must be a non-negative integer, got '{value}'"
                ))
            })
        };

        if let Some(v) = var("VIEW_SCHEMA") {
            self.view_schema = v;
        }
        if let Some(v) = var("MATERIALIZED_SCHEMA") {
            self.materialized_schema = v;
        }
        if let Some(v) = var("WORK_SCHEMA") {
            self.work_schema = v;
        }
        if let Some(v) = var("SCHEDULE") {
            self.schedule = v;
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = var("RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_num("RETRY_BASE_DELAY_MS", v)?;
        }
        if let Some(v) = var("RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_num("RETRY_MAX_DELAY_MS", v)?;
        }
        if let Some(v) = var("LOG_FORMAT") {
            self.log.format = match v.trim().to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(ViewMatError::InvalidConfig(format!(
                        "{ENV_PREFIX}LOG_FORMAT must be 'text' or 'json', got '{other}'"
                    )));
                }
            };
        }
        if let Some(v) = var("LOG_FILTER") {
            self.log.filter = v;
        }
        Ok(())
    }

    /// Check schema names and the schedule string.
    pub fn validate(&self) -> Result<(), ViewMatError> {
        validate_schema_name("view_schema", &self.view_schema)?;
        validate_schema_name("materialized_schema", &self.materialized_schema)?;
        validate_schema_name("work_schema", &self.work_schema)?;

        if self.materialized_schema == self.view_schema {
            return Err(ViewMatError::InvalidConfig(format!(
                "materialized_schema must differ from view_schema (both '{}')",
                self.view_schema
            )));
        }
        if self.work_schema == self.view_schema || self.work_schema == self.materialized_schema {
            return Err(ViewMatError::InvalidConfig(format!(
                "work_schema '{}' must differ from view_schema and materialized_schema",
                self.work_schema
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ViewMatError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }

        self.schedule_policy().map(|_| ())
    }

    pub fn schedule_policy(&self) -> Result<SchedulePolicy, ViewMatError> {
        SchedulePolicy::parse(&self.schedule)
    }
}

fn validate_schema_name(field: &str, value: &str) -> Result<(), ViewMatError> {
    if value.trim().is_empty() {
        return Err(ViewMatError::InvalidConfig(format!("{field} cannot be empty")));
    }
    if value.len() > MAX_IDENT_LEN {
        return Err(ViewMatError::InvalidConfig(format!(
            "{field} '{value}' exceeds {MAX_IDENT_LEN} bytes"
        )));
    }
    if value.contains('\0') {
        return Err(ViewMatError::InvalidConfig(format!(
            "{field} contains a NUL byte"
        )));
    }
    Ok(())
}

//! Local builder configuration
//!
//! [`LocalBuilderConfig`] is the programmatic form; [`BuilderSettings`] is the
//! YAML (v1 schema) form used by the CLI. Every value is explicit: nothing is
//! read from the environment.

use crate::callbacks::{BuildFn, ExportFn, FnRef, Initializer};
use crate::error::{BuilderError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

const SETTINGS_VERSION: u32 = 1;

/// Configuration of a [`LocalBuilder`](crate::LocalBuilder)
#[derive(Clone)]
pub struct LocalBuilderConfig {
    /// Size of the worker pool
    pub num_workers: usize,
    /// Wall-clock budget of one build+export task
    pub timeout: Duration,
    /// Budget for one worker to run its initializer and report ready
    pub startup_timeout: Duration,
    pub build_fn: FnRef<BuildFn>,
    pub export_fn: FnRef<ExportFn>,
    /// Runs once in each worker before its first task
    pub initializer: Option<Arc<Initializer>>,
}

impl Default for LocalBuilderConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            timeout: DEFAULT_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            build_fn: FnRef::Default,
            export_fn: FnRef::Default,
            initializer: None,
        }
    }
}

impl LocalBuilderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn with_build_fn(mut self, build_fn: FnRef<BuildFn>) -> Self {
        self.build_fn = build_fn;
        self
    }

    pub fn with_export_fn(mut self, export_fn: FnRef<ExportFn>) -> Self {
        self.export_fn = export_fn;
        self
    }

    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Check value ranges
    ///
    /// Callback references are not checked here: named callbacks may be
    /// registered by the initializer, so they are resolved inside each worker.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(BuilderError::config("num_workers must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(BuilderError::config("timeout must be positive"));
        }
        if self.startup_timeout.is_zero() {
            return Err(BuilderError::config("startup_timeout must be positive"));
        }
        Ok(())
    }
}

impl fmt::Debug for LocalBuilderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBuilderConfig")
            .field("num_workers", &self.num_workers)
            .field("timeout", &self.timeout)
            .field("startup_timeout", &self.startup_timeout)
            .field("build_fn", &self.build_fn)
            .field("export_fn", &self.export_fn)
            .field("initializer", &self.initializer.is_some())
            .finish()
    }
}

/// Declarative builder settings
///
/// ```yaml
/// version: 1
/// num_workers: 4
/// timeout_sec: 10
/// build_fn: my.registered.build
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuilderSettings {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_sec: Option<f64>,
    /// Registered build function name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_fn: Option<String>,
    /// Registered export function name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_fn: Option<String>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            num_workers: None,
            timeout_sec: None,
            startup_timeout_sec: None,
            build_fn: None,
            export_fn: None,
        }
    }
}

impl BuilderSettings {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(content)?;
        if settings.version != SETTINGS_VERSION {
            return Err(BuilderError::Config(format!(
                "unsupported settings version {} (supported: {})",
                settings.version, SETTINGS_VERSION
            )));
        }
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Overlay these settings on the defaults and validate
    pub fn into_config(self) -> Result<LocalBuilderConfig> {
        self.apply(LocalBuilderConfig::default())
    }

    /// Overlay these settings on `config` and validate
    pub fn apply(self, mut config: LocalBuilderConfig) -> Result<LocalBuilderConfig> {
        if let Some(num_workers) = self.num_workers {
            config.num_workers = num_workers;
        }
        if let Some(secs) = self.timeout_sec {
            config.timeout = seconds("timeout_sec", secs)?;
        }
        if let Some(secs) = self.startup_timeout_sec {
            config.startup_timeout = seconds("startup_timeout_sec", secs)?;
        }
        if let Some(name) = self.build_fn {
            config.build_fn = FnRef::Named(name);
        }
        if let Some(name) = self.export_fn {
            config.export_fn = FnRef::Named(name);
        }
        config.validate()?;
        Ok(config)
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| BuilderError::Config(format!("{}: invalid duration {}: {}", field, secs, e)))
}

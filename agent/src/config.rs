//! Configuration module for the Sitepulse agent.
//!
//! Every setting has a sensible default, so [`Config::default`] is enough for
//! most hosts. [`Config::from_env`] overrides individual values from
//! environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SITEPULSE_DUTY_CYCLE_SECS` | 30 | Seconds between duty-cycle ticks |
//! | `SITEPULSE_SESSION_LENGTH_SECS` | 1800 | Inactivity window before a session expires |
//! | `SITEPULSE_IDLE_THRESHOLD_SECS` | 60 | Gap between user actions that counts as idle |
//! | `SITEPULSE_RAGE_MIN_CLICKS` | 5 | Clicks in one burst that make a rage click |
//! | `SITEPULSE_RAGE_COOLDOWN_MS` | 300 | Maximum gap between clicks of one burst |
//! | `SITEPULSE_TRACKED_SELECTORS` | (none) | Comma-separated selectors whose clicks are always reported |
//! | `SITEPULSE_STORAGE_PATH` | `~/.sitepulse/storage.json` | File backing [`FileStorage`](crate::storage::FileStorage) |
//!
//! # Example
//!
//! ```no_run
//! use sitepulse_agent::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Duty cycle: {:?}", config.duty_cycle);
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

/// Default duty-cycle period (30 seconds).
pub const DEFAULT_DUTY_CYCLE_SECS: u64 = 30;

/// Default session inactivity window (30 minutes).
pub const DEFAULT_SESSION_LENGTH_SECS: u64 = 30 * 60;

/// Default idle threshold (1 minute).
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 60;

/// Default number of clicks that makes a burst a rage click.
pub const DEFAULT_RAGE_MIN_CLICKS: u32 = 5;

/// Default maximum gap between two clicks of the same burst.
pub const DEFAULT_RAGE_COOLDOWN_MS: u64 = 300;

/// Default storage directory name relative to home.
const DEFAULT_STORAGE_DIR: &str = ".sitepulse";

/// Default storage file name.
const DEFAULT_STORAGE_FILE: &str = "storage.json";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Tuning for the session, engagement and click trackers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Period of the duty-cycle tick (session expiry check, engagement ping).
    pub duty_cycle: Duration,

    /// A session expires once this long has passed since its last activity.
    pub session_length: Duration,

    /// Gaps between user actions at or above this count as idle time.
    pub idle_threshold: Duration,

    /// Consecutive clicks on one target needed to report a rage click.
    pub rage_min_clicks: u32,

    /// Clicks further apart than this start a new burst.
    pub rage_cooldown: Duration,

    /// Selectors whose clicks are reported even without rage.
    pub tracked_selectors: Vec<String>,

    /// File used by [`FileStorage`](crate::storage::FileStorage).
    /// `None` means "use the default under the home directory".
    pub storage_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duty_cycle: Duration::from_secs(DEFAULT_DUTY_CYCLE_SECS),
            session_length: Duration::from_secs(DEFAULT_SESSION_LENGTH_SECS),
            idle_threshold: Duration::from_secs(DEFAULT_IDLE_THRESHOLD_SECS),
            rage_min_clicks: DEFAULT_RAGE_MIN_CLICKS,
            rage_cooldown: Duration::from_millis(DEFAULT_RAGE_COOLDOWN_MS),
            tracked_selectors: Vec::new(),
            storage_path: None,
        }
    }
}

impl Config {
    /// Creates a new `Config` by overlaying environment variables on the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be
    /// parsed, or falls below its minimum.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let duty_cycle = Duration::from_secs(parse_var(
            "SITEPULSE_DUTY_CYCLE_SECS",
            DEFAULT_DUTY_CYCLE_SECS,
            1,
        )?);
        let session_length = Duration::from_secs(parse_var(
            "SITEPULSE_SESSION_LENGTH_SECS",
            DEFAULT_SESSION_LENGTH_SECS,
            1,
        )?);
        let idle_threshold = Duration::from_secs(parse_var(
            "SITEPULSE_IDLE_THRESHOLD_SECS",
            DEFAULT_IDLE_THRESHOLD_SECS,
            0,
        )?);
        let rage_min_clicks = parse_var("SITEPULSE_RAGE_MIN_CLICKS", DEFAULT_RAGE_MIN_CLICKS, 2)?;
        let rage_cooldown = Duration::from_millis(parse_var(
            "SITEPULSE_RAGE_COOLDOWN_MS",
            DEFAULT_RAGE_COOLDOWN_MS,
            1,
        )?);

        let tracked_selectors = env::var("SITEPULSE_TRACKED_SELECTORS")
            .map(|val| {
                val.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.tracked_selectors);

        let storage_path = env::var("SITEPULSE_STORAGE_PATH").ok().map(PathBuf::from);

        Ok(Self {
            duty_cycle,
            session_length,
            idle_threshold,
            rage_min_clicks,
            rage_cooldown,
            tracked_selectors,
            storage_path,
        })
    }

    /// Resolves the storage file, falling back to `~/.sitepulse/storage.json`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoHomeDirectory` when no explicit path is set and
    /// the home directory cannot be determined.
    pub fn resolve_storage_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.storage_path {
            return Ok(path.clone());
        }
        let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(base_dirs
            .home_dir()
            .join(DEFAULT_STORAGE_DIR)
            .join(DEFAULT_STORAGE_FILE))
    }
}

/// Parses an optional numeric variable, enforcing a lower bound.
fn parse_var<T>(key: &str, default: T, min: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let Ok(val) = env::var(key) else {
        return Ok(default);
    };
    let parsed = val.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected non-negative integer, got '{val}'"),
    })?;
    if parsed < min {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at least {min}, got {parsed}"),
        });
    }
    Ok(parsed)
}

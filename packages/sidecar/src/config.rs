use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::capture::CaptureConfig;

/// Timing and versioning knobs shared by the dispatcher and executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    /// Time from job creation until the watchdog may declare a timeout
    pub watchdog_delay: Duration,
    /// How long the dispatcher waits for the executor to acknowledge
    pub request_timeout: Duration,
    pub new_unit_timeout: Duration,
    pub stabilization_timeout: Duration,
    pub quiet_window: Duration,
    pub prompt_version: i32,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            watchdog_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            new_unit_timeout: Duration::from_secs(30),
            stabilization_timeout: Duration::from_secs(90),
            quiet_window: Duration::from_millis(1200),
            prompt_version: 1,
        }
    }
}

impl SidecarConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset ones keep their defaults. Durations
    /// are given in milliseconds.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(value) => {
                    let ms: u64 = value
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a number of milliseconds"))?;
                    Ok(Duration::from_millis(ms))
                }
                None => Ok(default),
            }
        };

        Ok(Self {
            watchdog_delay: millis("SIDECAR_WATCHDOG_DELAY_MS", defaults.watchdog_delay)?,
            request_timeout: millis("SIDECAR_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            new_unit_timeout: millis("SIDECAR_NEW_UNIT_TIMEOUT_MS", defaults.new_unit_timeout)?,
            stabilization_timeout: millis(
                "SIDECAR_STABILIZATION_TIMEOUT_MS",
                defaults.stabilization_timeout,
            )?,
            quiet_window: millis("SIDECAR_QUIET_WINDOW_MS", defaults.quiet_window)?,
            prompt_version: match lookup("SIDECAR_PROMPT_VERSION") {
                Some(value) => value
                    .trim()
                    .parse()
                    .context("SIDECAR_PROMPT_VERSION must be a valid number")?,
                None => defaults.prompt_version,
            },
        })
    }

    pub fn with_watchdog_delay(mut self, delay: Duration) -> Self {
        self.watchdog_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_new_unit_timeout(mut self, timeout: Duration) -> Self {
        self.new_unit_timeout = timeout;
        self
    }

    pub fn with_stabilization_timeout(mut self, timeout: Duration) -> Self {
        self.stabilization_timeout = timeout;
        self
    }

    pub fn with_quiet_window(mut self, window: Duration) -> Self {
        self.quiet_window = window;
        self
    }

    pub fn with_prompt_version(mut self, version: i32) -> Self {
        self.prompt_version = version;
        self
    }

    /// The executor-side capture budgets.
    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            new_unit_timeout: self.new_unit_timeout,
            stabilization_timeout: self.stabilization_timeout,
            quiet_window: self.quiet_window,
        }
    }
}

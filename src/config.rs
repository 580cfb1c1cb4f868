//! Controller configuration
//!
//! Provides typed settings with defaults, loading from the dotted property
//! keys recognised by the controller, and environment-based overrides.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Property key for the floor applied to scheduling periods.
pub const PROP_MINIMUM_NANOSECONDS: &str = "flowcontroller.minimum.nanoseconds";
/// Property key for the shutdown drain budget.
pub const PROP_GRACEFUL_SHUTDOWN_SECONDS: &str = "graceful.shutdown.seconds";
/// Property key for the heartbeat generator cadence.
pub const PROP_HEARTBEAT_INTERVAL: &str = "node.heartbeat.interval";
/// Property key for the inbound site-to-site listener port.
pub const PROP_REMOTE_INPUT_PORT: &str = "remote.input.socket.port";
/// Property key for secure site-to-site.
pub const PROP_SITE_TO_SITE_SECURE: &str = "site.to.site.secure";
/// Property key for the status aggregation cadence.
pub const PROP_STATUS_SNAPSHOT_FREQUENCY: &str = "component.status.snapshot.frequency";
/// Property key for the flow-file expiration sweep cadence.
pub const PROP_EXPIRATION_SWEEP_MILLIS: &str = "flowfile.expiration.sweep.millis";
/// Property key for the remote-group refresh cadence.
pub const PROP_REMOTE_REFRESH_MILLIS: &str = "remote.group.refresh.millis";
/// Property key for the timer-driven pool size.
pub const PROP_TIMER_POOL_SIZE: &str = "timer.driven.thread.count";
/// Property key for the event-driven pool size.
pub const PROP_EVENT_POOL_SIZE: &str = "event.driven.thread.count";

const DEFAULT_GRACEFUL_SHUTDOWN_SECONDS: u64 = 10;

/// Controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Floor on scheduling periods, in nanoseconds
    pub schedule_minimum_nanos: u64,
    /// Shutdown drain budget, in seconds
    pub graceful_shutdown_seconds: u64,
    /// Heartbeat generator cadence, in seconds
    pub heartbeat_delay_seconds: u64,
    /// Inbound site-to-site listener port; `None` disables the listener
    pub remote_input_port: Option<u16>,
    /// Whether site-to-site communications require TLS
    pub site_to_site_secure: bool,
    /// Status aggregation cadence, in milliseconds
    pub status_snapshot_millis: u64,
    /// Bounded history kept per component by the status repository
    pub status_history_samples: usize,
    /// Flow-file expiration sweep cadence, in milliseconds
    pub expiration_sweep_millis: u64,
    /// Remote-group refresh cadence, in milliseconds
    pub remote_refresh_millis: u64,
    /// Concurrency bound of the timer-driven pool
    pub timer_pool_size: usize,
    /// Concurrency bound of the event-driven pool
    pub event_pool_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            schedule_minimum_nanos: 10_000,
            graceful_shutdown_seconds: DEFAULT_GRACEFUL_SHUTDOWN_SECONDS,
            heartbeat_delay_seconds: 5,
            remote_input_port: None,
            site_to_site_secure: false,
            status_snapshot_millis: 300_000,
            status_history_samples: 288,
            expiration_sweep_millis: 30_000,
            remote_refresh_millis: 60_000,
            timer_pool_size: 10,
            event_pool_size: 5,
        }
    }
}

impl EngineSettings {
    /// Load settings from a string property map. Unknown keys are ignored so
    /// that a full properties file can be passed through unchanged.
    pub fn from_properties(props: &HashMap<String, String>) -> EngineResult<Self> {
        let mut settings = Self::default();

        if let Some(val) = props.get(PROP_MINIMUM_NANOSECONDS) {
            settings.schedule_minimum_nanos = parse_u64(PROP_MINIMUM_NANOSECONDS, val)?;
        }
        if let Some(val) = props.get(PROP_GRACEFUL_SHUTDOWN_SECONDS) {
            settings.graceful_shutdown_seconds = parse_u64(PROP_GRACEFUL_SHUTDOWN_SECONDS, val)?;
        }
        if let Some(val) = props.get(PROP_HEARTBEAT_INTERVAL) {
            settings.heartbeat_delay_seconds = parse_u64(PROP_HEARTBEAT_INTERVAL, val)?;
        }
        if let Some(val) = props.get(PROP_REMOTE_INPUT_PORT) {
            if val.trim().is_empty() {
                settings.remote_input_port = None;
            } else {
                let port = val.trim().parse::<u16>().map_err(|e| {
                    EngineError::Configuration(format!(
                        "Invalid value for {}: {}",
                        PROP_REMOTE_INPUT_PORT, e
                    ))
                })?;
                settings.remote_input_port = Some(port);
            }
        }
        if let Some(val) = props.get(PROP_SITE_TO_SITE_SECURE) {
            settings.site_to_site_secure = val.trim().eq_ignore_ascii_case("true");
        }
        if let Some(val) = props.get(PROP_STATUS_SNAPSHOT_FREQUENCY) {
            settings.status_snapshot_millis = parse_u64(PROP_STATUS_SNAPSHOT_FREQUENCY, val)?;
        }
        if let Some(val) = props.get(PROP_EXPIRATION_SWEEP_MILLIS) {
            settings.expiration_sweep_millis = parse_u64(PROP_EXPIRATION_SWEEP_MILLIS, val)?;
        }
        if let Some(val) = props.get(PROP_REMOTE_REFRESH_MILLIS) {
            settings.remote_refresh_millis = parse_u64(PROP_REMOTE_REFRESH_MILLIS, val)?;
        }
        if let Some(val) = props.get(PROP_TIMER_POOL_SIZE) {
            settings.timer_pool_size = parse_u64(PROP_TIMER_POOL_SIZE, val)? as usize;
        }
        if let Some(val) = props.get(PROP_EVENT_POOL_SIZE) {
            settings.event_pool_size = parse_u64(PROP_EVENT_POOL_SIZE, val)? as usize;
        }

        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `FLOWGRID_*` environment variables, on top of the
    /// defaults.
    pub fn from_env() -> EngineResult<Self> {
        let mut props = HashMap::new();
        for (key, prop) in [
            ("FLOWGRID_MINIMUM_NANOSECONDS", PROP_MINIMUM_NANOSECONDS),
            ("FLOWGRID_GRACEFUL_SHUTDOWN_SECONDS", PROP_GRACEFUL_SHUTDOWN_SECONDS),
            ("FLOWGRID_HEARTBEAT_INTERVAL", PROP_HEARTBEAT_INTERVAL),
            ("FLOWGRID_REMOTE_INPUT_PORT", PROP_REMOTE_INPUT_PORT),
            ("FLOWGRID_SITE_TO_SITE_SECURE", PROP_SITE_TO_SITE_SECURE),
            ("FLOWGRID_STATUS_SNAPSHOT_FREQUENCY", PROP_STATUS_SNAPSHOT_FREQUENCY),
        ] {
            if let Ok(val) = std::env::var(key) {
                props.insert(prop.to_string(), val);
            }
        }
        Self::from_properties(&props)
    }

    /// Apply documented fallbacks for out-of-range values.
    fn normalize(&mut self) {
        if self.graceful_shutdown_seconds < 1 {
            tracing::warn!(
                configured = self.graceful_shutdown_seconds,
                fallback = DEFAULT_GRACEFUL_SHUTDOWN_SECONDS,
                "Graceful shutdown budget below minimum; using default"
            );
            self.graceful_shutdown_seconds = DEFAULT_GRACEFUL_SHUTDOWN_SECONDS;
        }
    }

    /// Validate settings
    pub fn validate(&self) -> EngineResult<()> {
        if self.timer_pool_size == 0 {
            return Err(EngineError::Configuration(
                "Timer-driven pool size must be at least 1".to_string(),
            ));
        }
        if self.event_pool_size == 0 {
            return Err(EngineError::Configuration(
                "Event-driven pool size must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_delay_seconds == 0 {
            return Err(EngineError::Configuration(
                "Heartbeat interval must be at least 1 second".to_string(),
            ));
        }
        if self.status_snapshot_millis == 0 {
            return Err(EngineError::Configuration(
                "Status snapshot frequency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Floor a scheduling period at the configured minimum.
    pub fn clamp_period(&self, period: Duration) -> Duration {
        let min = Duration::from_nanos(self.schedule_minimum_nanos);
        if period < min {
            min
        } else {
            period
        }
    }
}

fn parse_u64(key: &str, val: &str) -> EngineResult<u64> {
    val.trim().parse::<u64>().map_err(|e| {
        EngineError::Configuration(format!("Invalid value for {}: {}", key, e))
    })
}

/// Parse a human-readable time period such as `100 millis`, `10 secs` or
/// `1 hr` into a [`Duration`]. Scheduling periods for timer-driven components
/// use this format.
pub fn parse_time_period(value: &str) -> EngineResult<Duration> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| {
            EngineError::InvalidArgument(format!("Missing time unit in period '{}'", value))
        })?;
    let (num, unit) = trimmed.split_at(split);
    let amount: f64 = num.trim().parse().map_err(|_| {
        EngineError::InvalidArgument(format!("Invalid time period '{}'", value))
    })?;

    let nanos_per_unit: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "ns" | "nano" | "nanos" | "nanosecond" | "nanoseconds" => 1.0,
        "us" | "micro" | "micros" | "microsecond" | "microseconds" => 1_000.0,
        "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => 1_000_000.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000_000_000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0 * 1_000_000_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600.0 * 1_000_000_000.0,
        "d" | "day" | "days" => 86_400.0 * 1_000_000_000.0,
        other => {
            return Err(EngineError::InvalidArgument(format!(
                "Unknown time unit '{}' in period '{}'",
                other, value
            )))
        }
    };

    Ok(Duration::from_nanos((amount * nanos_per_unit) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.graceful_shutdown_seconds, 10);
        assert_eq!(settings.heartbeat_delay_seconds, 5);
        assert!(settings.remote_input_port.is_none());
    }

    #[test]
    fn test_graceful_shutdown_fallback() {
        let mut props = HashMap::new();
        props.insert(PROP_GRACEFUL_SHUTDOWN_SECONDS.to_string(), "0".to_string());
        let settings = EngineSettings::from_properties(&props).expect("load should succeed");
        assert_eq!(settings.graceful_shutdown_seconds, 10);
    }

    #[test]
    fn test_invalid_pool_size_rejected() {
        let mut props = HashMap::new();
        props.insert(PROP_TIMER_POOL_SIZE.to_string(), "0".to_string());
        assert!(EngineSettings::from_properties(&props).is_err());
    }

    #[test]
    fn test_parse_time_period() {
        assert_eq!(
            parse_time_period("100 millis").expect("parse"),
            Duration::from_millis(100)
        );
        assert_eq!(parse_time_period("1 sec").expect("parse"), Duration::from_secs(1));
        assert_eq!(
            parse_time_period("5 mins").expect("parse"),
            Duration::from_secs(300)
        );
        assert_eq!(parse_time_period("250ms").expect("parse"), Duration::from_millis(250));
        assert!(parse_time_period("oops").is_err());
        assert!(parse_time_period("10 lightyears").is_err());
    }

    #[test]
    fn test_clamp_period() {
        let settings = EngineSettings::default();
        let clamped = settings.clamp_period(Duration::from_nanos(1));
        assert_eq!(clamped, Duration::from_nanos(settings.schedule_minimum_nanos));
    }
}

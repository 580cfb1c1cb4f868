//! Scheduling engine
//!
//! Binds graph components to the two worker pools and drives their triggers
//! according to the configured strategy:
//! - Timer-driven: fixed-period triggers
//! - CRON-driven: wall-clock cron expression
//! - Event-driven: triggered by inbound queue activity
//! - Primary-node-only: timer-driven, gated on primary-node election

pub mod agents;
pub mod event_queue;
pub mod pool;
pub mod state;

pub use agents::ProcessScheduler;
pub use event_queue::EventDrivenWorkerQueue;
pub use pool::WorkerPool;
pub use state::{ScheduleCell, ScheduledState};

use crate::config::parse_time_period;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a component's triggers are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    /// Trigger every scheduling period
    TimerDriven,
    /// Trigger on wall-clock ticks matching a cron expression
    CronDriven,
    /// Trigger when an inbound queue becomes non-empty
    EventDriven,
    /// Timer-driven, but only while this node is the elected primary
    PrimaryNodeOnly,
}

impl SchedulingStrategy {
    /// Whether this strategy's triggers are gated on the primary flag.
    pub fn is_primary_only(&self) -> bool {
        matches!(self, SchedulingStrategy::PrimaryNodeOnly)
    }
}

/// Scheduling configuration of one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Trigger strategy
    pub strategy: SchedulingStrategy,
    /// Period string, interpreted per strategy: a time period for
    /// timer-driven and primary-only, a cron expression for cron-driven,
    /// ignored for event-driven
    pub period: String,
    /// Maximum worker threads simultaneously inside the component
    pub max_concurrent_tasks: usize,
    /// Self-imposed pause applied when back-pressure is observed
    pub yield_period: Duration,
    /// Cooldown applied after a failed processing attempt
    pub penalization_period: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::TimerDriven,
            period: "1 sec".to_string(),
            max_concurrent_tasks: 1,
            yield_period: Duration::from_secs(1),
            penalization_period: Duration::from_secs(30),
        }
    }
}

impl SchedulingConfig {
    /// Resolve the period string for timer-style strategies.
    pub fn timer_period(&self) -> EngineResult<Duration> {
        parse_time_period(&self.period)
    }

    /// Resolve the period string as a cron schedule.
    pub fn cron_schedule(&self) -> EngineResult<cron::Schedule> {
        self.period.parse::<cron::Schedule>().map_err(|e| {
            EngineError::InvalidArgument(format!("Invalid cron expression '{}': {}", self.period, e))
        })
    }

    /// Validate the configuration for registration.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(EngineError::InvalidArgument(
                "Max concurrent tasks must be at least 1".to_string(),
            ));
        }
        match self.strategy {
            SchedulingStrategy::TimerDriven | SchedulingStrategy::PrimaryNodeOnly => {
                self.timer_period().map(|_| ())
            }
            SchedulingStrategy::CronDriven => self.cron_schedule().map(|_| ()),
            SchedulingStrategy::EventDriven => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_expression_validated_up_front() {
        let mut config = SchedulingConfig {
            strategy: SchedulingStrategy::CronDriven,
            period: "0 0 * * * *".to_string(),
            ..SchedulingConfig::default()
        };
        config.validate().expect("hourly cron is valid");

        config.period = "definitely not cron".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timer_period_validated_up_front() {
        let mut config = SchedulingConfig::default();
        config.validate().expect("default period is valid");
        config.period = "sideways".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrent_tasks_rejected() {
        let config = SchedulingConfig {
            max_concurrent_tasks: 0,
            ..SchedulingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Reporting task nodes
//!
//! Reporting tasks are controller-level plug-ins scheduled like processors
//! (timer or cron) but with no queues attached; they observe counters,
//! status, and bulletins rather than flow files.

use crate::processor::ReportingTask;
use crate::scheduling::{ScheduleCell, SchedulingConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered reporting task.
pub struct ReportingTaskNode {
    id: String,
    name: RwLock<String>,
    type_name: String,
    task: Arc<dyn ReportingTask>,
    scheduling: RwLock<SchedulingConfig>,
    schedule: ScheduleCell,
    properties: RwLock<HashMap<String, String>>,
}

impl ReportingTaskNode {
    /// Create a reporting task node around its plug-in.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
        task: Arc<dyn ReportingTask>,
        scheduling: SchedulingConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: RwLock::new(name.into()),
            type_name: type_name.into(),
            task,
            scheduling: RwLock::new(scheduling),
            schedule: ScheduleCell::default(),
            properties: RwLock::new(HashMap::new()),
        }
    }

    /// Stable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Rename the task.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Registered plug-in type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The plug-in.
    pub fn task(&self) -> &Arc<dyn ReportingTask> {
        &self.task
    }

    /// Scheduling configuration snapshot.
    pub fn scheduling(&self) -> SchedulingConfig {
        self.scheduling.read().clone()
    }

    /// Replace the scheduling configuration.
    pub fn set_scheduling(&self, config: SchedulingConfig) {
        *self.scheduling.write() = config;
    }

    /// Scheduled-state cell.
    pub fn schedule(&self) -> &ScheduleCell {
        &self.schedule
    }

    /// Configuration properties snapshot.
    pub fn properties(&self) -> HashMap<String, String> {
        self.properties.read().clone()
    }

    /// Replace configuration properties.
    pub fn set_properties(&self, properties: HashMap<String, String>) {
        *self.properties.write() = properties;
    }
}

impl std::fmt::Debug for ReportingTaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportingTaskNode")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("state", &self.schedule.state())
            .finish()
    }
}

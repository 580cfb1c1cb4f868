//! Strategy drivers and trigger dispatch
//!
//! One driver per running component: timer-driven and primary-only
//! components tick on an interval, cron-driven components sleep until the
//! next wall-clock match, and event-driven components are pulled off the
//! worker queue by the event pool. All strategies share one per-trigger
//! policy: skip and yield under back-pressure, skip while yielded or
//! penalised, bound concurrency with the component's trigger slots, and
//! catch every trigger error (log, bulletin, penalise) so nothing
//! propagates into a pool worker.

use super::event_queue::EventDrivenWorkerQueue;
use super::pool::WorkerPool;
use super::{ScheduledState, SchedulingStrategy};
use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::extension::{with_extension_scope, ExtensionScope};
use crate::graph::{ConnectableKind, ConnectableNode, QueueActivityListener};
use crate::processor::{relay_trigger, ProcessSession, ReportingContext};
use crate::repo::{Bulletin, BulletinSeverity};
use crate::reporting::ReportingTaskNode;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Anything the agents can drive: a graph component or a reporting task.
#[derive(Clone)]
pub(crate) enum ScheduledEntity {
    /// A graph vertex
    Component(Arc<ConnectableNode>),
    /// A controller-level reporting task
    Reporting(Arc<ReportingTaskNode>),
}

impl ScheduledEntity {
    fn id(&self) -> String {
        match self {
            ScheduledEntity::Component(node) => node.id().to_string(),
            ScheduledEntity::Reporting(task) => task.id().to_string(),
        }
    }

    fn scheduling(&self) -> super::SchedulingConfig {
        match self {
            ScheduledEntity::Component(node) => node.scheduling(),
            ScheduledEntity::Reporting(task) => task.scheduling(),
        }
    }

    fn schedule(&self) -> &super::ScheduleCell {
        match self {
            ScheduledEntity::Component(node) => node.schedule(),
            ScheduledEntity::Reporting(task) => task.schedule(),
        }
    }
}

/// Releases the component's trigger slot even if the trigger future is
/// dropped before running or panics mid-flight.
struct TriggerSlot {
    entity: ScheduledEntity,
}

impl TriggerSlot {
    fn new(entity: ScheduledEntity) -> Self {
        Self { entity }
    }
}

impl Drop for TriggerSlot {
    fn drop(&mut self) {
        self.entity.schedule().release_trigger();
    }
}

struct DriverHandle {
    cancel: CancellationToken,
    entity: ScheduledEntity,
}

/// The scheduling engine: owns both worker pools, the event-driven work
/// queue, and the per-component strategy drivers.
pub struct ProcessScheduler {
    context: Arc<EngineContext>,
    timer_pool: Arc<WorkerPool>,
    event_pool: Arc<WorkerPool>,
    event_queue: Arc<EventDrivenWorkerQueue>,
    drivers: DashMap<String, DriverHandle>,
    primary: AtomicBool,
    weak_self: Weak<ProcessScheduler>,
}

impl ProcessScheduler {
    /// Create the scheduler with pools sized from the settings.
    pub fn new(context: Arc<EngineContext>) -> Arc<Self> {
        let settings = context.settings.clone();
        Arc::new_cyclic(|weak| Self {
            timer_pool: Arc::new(WorkerPool::new("timer-driven", settings.timer_pool_size)),
            event_pool: Arc::new(WorkerPool::new("event-driven", settings.event_pool_size)),
            event_queue: Arc::new(EventDrivenWorkerQueue::new()),
            drivers: DashMap::new(),
            primary: AtomicBool::new(false),
            weak_self: weak.clone(),
            context,
        })
    }

    /// The event-driven work queue.
    pub fn event_queue(&self) -> &Arc<EventDrivenWorkerQueue> {
        &self.event_queue
    }

    /// The timer-driven pool.
    pub fn timer_pool(&self) -> &Arc<WorkerPool> {
        &self.timer_pool
    }

    /// The event-driven pool.
    pub fn event_pool(&self) -> &Arc<WorkerPool> {
        &self.event_pool
    }

    /// Whether this node is currently the elected primary.
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Flip the primary flag. Primary-only drivers observe the flag on
    /// every tick, so flipping it off stops new triggers immediately.
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
        self.event_queue.set_primary(primary);
    }

    /// Inform the scheduler whether the node is clustered.
    pub fn set_clustered(&self, clustered: bool) {
        self.event_queue.set_clustered(clustered);
    }

    /// Number of components currently scheduled.
    pub fn running_count(&self) -> usize {
        self.drivers.len()
    }

    /// Spawn the event-pool worker loops. Invoked once at controller
    /// construction.
    pub(crate) fn start_event_workers(&self) {
        for _ in 0..self.context.settings.event_pool_size {
            let Some(scheduler) = self.weak_self.upgrade() else {
                return;
            };
            self.event_pool.spawn_worker(move |cancel| async move {
                scheduler.event_worker_loop(cancel).await;
            });
        }
    }

    /// Start driving a component. The caller has already verified the state
    /// transition and validity.
    pub(crate) fn start(&self, entity: ScheduledEntity) -> EngineResult<()> {
        let config = entity.scheduling();
        config.validate()?;
        if let ScheduledEntity::Reporting(_) = entity {
            if config.strategy == SchedulingStrategy::EventDriven {
                return Err(EngineError::InvalidArgument(
                    "Reporting tasks cannot be event-driven".to_string(),
                ));
            }
        }

        enum DriverPlan {
            Timer(Duration, bool),
            Cron(Box<cron::Schedule>),
            Event,
        }
        let plan = match config.strategy {
            SchedulingStrategy::TimerDriven | SchedulingStrategy::PrimaryNodeOnly => {
                DriverPlan::Timer(
                    self.context.settings.clamp_period(config.timer_period()?),
                    config.strategy.is_primary_only(),
                )
            }
            SchedulingStrategy::CronDriven => DriverPlan::Cron(Box::new(config.cron_schedule()?)),
            SchedulingStrategy::EventDriven => DriverPlan::Event,
        };
        let scheduler = self.weak_self.upgrade().ok_or_else(|| {
            EngineError::IllegalState("Scheduler is no longer available".to_string())
        })?;

        entity.schedule().start()?;

        if let Err(e) = self.invoke_on_scheduled(&entity) {
            // The component never actually ran; put it back.
            let _ = entity.schedule().stop();
            return Err(e);
        }

        let id = entity.id();
        let cancel = CancellationToken::new();
        match plan {
            DriverPlan::Timer(period, gate_primary) => {
                let driver_entity = entity.clone();
                let driver_cancel = cancel.clone();
                tokio::spawn(async move {
                    timer_driver(scheduler, driver_entity, period, gate_primary, driver_cancel)
                        .await;
                });
            }
            DriverPlan::Cron(schedule) => {
                let driver_entity = entity.clone();
                let driver_cancel = cancel.clone();
                tokio::spawn(async move {
                    cron_driver(scheduler, driver_entity, *schedule, driver_cancel).await;
                });
            }
            DriverPlan::Event => {
                // No clock: readiness comes from queue activity. Pick up any
                // work that accumulated while stopped.
                if let ScheduledEntity::Component(node) = &entity {
                    if node.incoming().iter().any(|c| !c.queue().is_empty()) {
                        self.event_queue
                            .offer(node.id(), config.strategy.is_primary_only());
                    }
                }
            }
        }

        self.drivers.insert(id.clone(), DriverHandle { cancel, entity });
        tracing::info!(component = %id, strategy = ?config.strategy, "Scheduled component");
        Ok(())
    }

    /// Stop driving a component. In-flight triggers complete on their own;
    /// their slots drain through the schedule cell.
    pub(crate) fn stop(&self, entity: &ScheduledEntity) -> EngineResult<()> {
        entity.schedule().stop()?;
        let id = entity.id();
        if let Some((_, handle)) = self.drivers.remove(&id) {
            handle.cancel.cancel();
        }
        self.event_queue.remove(&id);
        self.invoke_on_unscheduled(entity);
        tracing::info!(component = %id, "Unscheduled component");
        Ok(())
    }

    /// Cancel every driver and shut both pools down.
    ///
    /// Each pool gets half of the drain budget and the pools drain
    /// concurrently. Returns true when both pools drained cleanly.
    pub(crate) async fn shutdown(&self, drain_budget: Duration, kill: bool) -> bool {
        for entry in self.drivers.iter() {
            entry.value().cancel.cancel();
        }
        self.drivers.clear();
        let per_pool = drain_budget / 2;
        let (timer_clean, event_clean) = futures::join!(
            self.timer_pool.shutdown(per_pool, kill),
            self.event_pool.shutdown(per_pool, kill)
        );
        timer_clean && event_clean
    }

    fn invoke_on_scheduled(&self, entity: &ScheduledEntity) -> EngineResult<()> {
        match entity {
            ScheduledEntity::Component(node) => {
                if let Some(plugin) = node.plugin() {
                    let _scope = ExtensionScope::enter(node.type_name().unwrap_or_default());
                    plugin.on_scheduled()?;
                }
                Ok(())
            }
            ScheduledEntity::Reporting(task) => {
                let _scope = ExtensionScope::enter(task.type_name());
                task.task().on_scheduled()
            }
        }
    }

    fn invoke_on_unscheduled(&self, entity: &ScheduledEntity) {
        let result = match entity {
            ScheduledEntity::Component(node) => match node.plugin() {
                Some(plugin) => {
                    let _scope = ExtensionScope::enter(node.type_name().unwrap_or_default());
                    plugin.on_unscheduled()
                }
                None => Ok(()),
            },
            ScheduledEntity::Reporting(task) => {
                let _scope = ExtensionScope::enter(task.type_name());
                task.task().on_unscheduled()
            }
        };
        if let Err(e) = result {
            tracing::warn!(component = %entity.id(), error = %e, "on_unscheduled hook failed");
        }
    }

    /// One scheduling tick: dispatch up to `max_concurrent_tasks` triggers,
    /// applying the shared trigger policy.
    async fn dispatch_tick(&self, entity: &ScheduledEntity) {
        let config = entity.scheduling();
        if entity.schedule().state() != ScheduledState::Running {
            return;
        }
        if entity.schedule().is_suppressed() {
            return;
        }
        if let ScheduledEntity::Component(node) = entity {
            if node.outgoing().iter().any(|c| c.queue().is_full()) {
                entity.schedule().yield_for(config.yield_period);
                metrics::counter!("flowgrid_backpressure_yields_total").increment(1);
                tracing::trace!(component = %node.id(), "Back-pressure observed; yielding");
                return;
            }
        }
        for _ in 0..config.max_concurrent_tasks {
            if !entity
                .schedule()
                .try_acquire_trigger(config.max_concurrent_tasks)
            {
                break;
            }
            let slot = TriggerSlot::new(entity.clone());
            let context = self.context.clone();
            let trigger_entity = entity.clone();
            let dispatched = self
                .timer_pool
                .execute(async move {
                    run_trigger(trigger_entity, context, slot).await;
                })
                .await;
            if !dispatched {
                break;
            }
        }
    }

    async fn event_worker_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => break,
                entry = self.event_queue.poll(Duration::from_millis(250)) => entry,
            };
            let Some(entry) = entry else {
                continue;
            };
            let Some(handle) = self.drivers.get(&entry.component_id) else {
                continue;
            };
            let entity = handle.entity.clone();
            drop(handle);
            let ScheduledEntity::Component(node) = &entity else {
                continue;
            };

            let config = node.scheduling();
            if node.schedule().state() != ScheduledState::Running {
                continue;
            }
            if node.schedule().is_suppressed() {
                // Still has work; check back after a short pause.
                self.event_queue.offer(node.id(), entry.primary_only);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            if node.outgoing().iter().any(|c| c.queue().is_full()) {
                node.schedule().yield_for(config.yield_period);
                self.event_queue.offer(node.id(), entry.primary_only);
                metrics::counter!("flowgrid_backpressure_yields_total").increment(1);
                continue;
            }
            if !node.schedule().try_acquire_trigger(config.max_concurrent_tasks) {
                continue;
            }
            let slot = TriggerSlot::new(entity.clone());
            let Some(permit) = self.event_pool.acquire().await else {
                break;
            };
            run_trigger(entity.clone(), self.context.clone(), slot).await;
            drop(permit);

            if node.schedule().state() == ScheduledState::Running
                && node.incoming().iter().any(|c| !c.queue().is_empty())
            {
                self.event_queue.offer(node.id(), entry.primary_only);
            }
        }
    }
}

impl QueueActivityListener for ProcessScheduler {
    fn queue_activated(&self, destination_id: &str) {
        let Some(handle) = self.drivers.get(destination_id) else {
            return;
        };
        if let ScheduledEntity::Component(node) = &handle.entity {
            let config = node.scheduling();
            if config.strategy == SchedulingStrategy::EventDriven {
                self.event_queue
                    .offer(destination_id, config.strategy.is_primary_only());
            }
        }
    }
}

async fn timer_driver(
    scheduler: Arc<ProcessScheduler>,
    entity: ScheduledEntity,
    period: Duration,
    gate_primary: bool,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if gate_primary && !scheduler.is_primary() {
                    continue;
                }
                scheduler.dispatch_tick(&entity).await;
            }
        }
    }
}

async fn cron_driver(
    scheduler: Arc<ProcessScheduler>,
    entity: ScheduledEntity,
    schedule: cron::Schedule,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::warn!(component = %entity.id(), "No more upcoming cron firings");
            break;
        };
        let until = (next - now).to_std().unwrap_or(Duration::from_secs(1));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(until) => {
                scheduler.dispatch_tick(&entity).await;
            }
        }
    }
}

/// Run one trigger. Errors are caught here; they penalise the component and
/// surface as bulletins, never to the pool.
async fn run_trigger(entity: ScheduledEntity, context: Arc<EngineContext>, _slot: TriggerSlot) {
    let started = Instant::now();
    metrics::counter!("flowgrid_triggers_total").increment(1);
    match &entity {
        ScheduledEntity::Component(node) => {
            let mut session = ProcessSession::new(node.clone(), context.clone());
            let result = match node.kind() {
                ConnectableKind::Processor => match node.plugin() {
                    Some(plugin) => {
                        let namespace = node.type_name().unwrap_or_default().to_string();
                        with_extension_scope(namespace, plugin.on_trigger(&mut session)).await
                    }
                    None => Ok(()),
                },
                kind => {
                    relay_trigger(&mut session, kind == ConnectableKind::RemoteInputPort);
                    Ok(())
                }
            };
            match result {
                Ok(()) => {
                    if let Err(e) = session.commit() {
                        penalize_component(node, &context, &e);
                    }
                }
                Err(e) => {
                    session.rollback();
                    penalize_component(node, &context, &e);
                }
            }
            node.totals().add_invocation(started.elapsed().as_nanos() as u64);
        }
        ScheduledEntity::Reporting(task) => {
            let reporting = ReportingContext::new(context.clone());
            let result = with_extension_scope(
                task.type_name().to_string(),
                task.task().on_trigger(&reporting),
            )
            .await;
            if let Err(e) = result {
                let config = task.scheduling();
                task.schedule().penalize_for(config.penalization_period);
                metrics::counter!("flowgrid_trigger_failures_total").increment(1);
                tracing::warn!(task = %task.id(), error = %e, "Reporting task failed");
            }
        }
    }
}

fn penalize_component(node: &Arc<ConnectableNode>, context: &Arc<EngineContext>, error: &EngineError) {
    let config = node.scheduling();
    node.schedule().penalize_for(config.penalization_period);
    metrics::counter!("flowgrid_trigger_failures_total").increment(1);
    tracing::warn!(component = %node.id(), error = %error, "Trigger failed; penalizing component");
    context.repositories.bulletins.add(Bulletin {
        id: 0,
        category: "Processing Failure".to_string(),
        severity: BulletinSeverity::Error,
        source_id: Some(node.id().to_string()),
        message: error.to_string(),
        timestamp: Utc::now(),
    });
}

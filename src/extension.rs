//! Extension registry and the scoped extension context
//!
//! Plug-in types (processors, reporting tasks, prioritisers) are registered
//! by type name and constructed through factories. Every plug-in entry point
//! runs with the plug-in's resource namespace installed on the current
//! thread; the previous namespace is restored on every exit path, including
//! unwinds, via the RAII guard.

use crate::error::{EngineError, EngineResult};
use crate::graph::FlowFilePrioritizer;
use crate::processor::{Processor, ReportingTask};
use dashmap::DashMap;
use std::cell::RefCell;
use std::sync::Arc;

/// Factory constructing a processor plug-in.
pub type ProcessorFactory = Arc<dyn Fn() -> Arc<dyn Processor> + Send + Sync>;
/// Factory constructing a reporting-task plug-in.
pub type ReportingTaskFactory = Arc<dyn Fn() -> Arc<dyn ReportingTask> + Send + Sync>;
/// Factory constructing a prioritiser plug-in.
pub type PrioritizerFactory = Arc<dyn Fn() -> Arc<dyn FlowFilePrioritizer> + Send + Sync>;

thread_local! {
    static CURRENT_NAMESPACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

tokio::task_local! {
    static TASK_NAMESPACE: String;
}

/// Run an async plug-in entry point with `namespace` installed for the
/// duration of the future. The namespace travels with the task, so it is in
/// force across awaits and is released when the future completes or is
/// dropped, regardless of the exit path.
pub async fn with_extension_scope<F>(namespace: impl Into<String>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    TASK_NAMESPACE.scope(namespace.into(), fut).await
}

/// Scoped installation of a plug-in's resource namespace on the current
/// thread. Dropping the guard restores whatever was installed before, so the
/// restore is unconditional across success, error, and panic paths.
pub struct ExtensionScope {
    previous: Option<String>,
}

impl ExtensionScope {
    /// Install `namespace` on the current thread until the guard drops.
    pub fn enter(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let previous = CURRENT_NAMESPACE.with(|current| current.replace(Some(namespace)));
        Self { previous }
    }

    /// The namespace currently in force: the task-scoped namespace when
    /// called from inside [`with_extension_scope`], the thread-scoped one
    /// otherwise.
    pub fn current() -> Option<String> {
        if let Ok(namespace) = TASK_NAMESPACE.try_with(|ns| ns.clone()) {
            return Some(namespace);
        }
        CURRENT_NAMESPACE.with(|current| current.borrow().clone())
    }
}

impl Drop for ExtensionScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_NAMESPACE.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

/// Registry of plug-in factories keyed by type name.
#[derive(Default)]
pub struct ExtensionRegistry {
    processors: DashMap<String, ProcessorFactory>,
    reporting_tasks: DashMap<String, ReportingTaskFactory>,
    prioritizers: DashMap<String, PrioritizerFactory>,
}

impl ExtensionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor type.
    pub fn register_processor(&self, type_name: impl Into<String>, factory: ProcessorFactory) {
        self.processors.insert(type_name.into(), factory);
    }

    /// Register a reporting-task type.
    pub fn register_reporting_task(
        &self,
        type_name: impl Into<String>,
        factory: ReportingTaskFactory,
    ) {
        self.reporting_tasks.insert(type_name.into(), factory);
    }

    /// Register a prioritiser type.
    pub fn register_prioritizer(&self, type_name: impl Into<String>, factory: PrioritizerFactory) {
        self.prioritizers.insert(type_name.into(), factory);
    }

    /// Whether a processor type is known.
    pub fn has_processor(&self, type_name: &str) -> bool {
        self.processors.contains_key(type_name)
    }

    /// Whether a prioritiser type is known.
    pub fn has_prioritizer(&self, type_name: &str) -> bool {
        self.prioritizers.contains_key(type_name)
    }

    /// Whether a reporting-task type is known.
    pub fn has_reporting_task(&self, type_name: &str) -> bool {
        self.reporting_tasks.contains_key(type_name)
    }

    /// Construct a processor, inside its extension scope.
    pub fn create_processor(&self, type_name: &str) -> EngineResult<Arc<dyn Processor>> {
        let factory = self
            .processors
            .get(type_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::Instantiation {
                type_name: type_name.to_string(),
                reason: "unknown processor type".to_string(),
            })?;
        let _scope = ExtensionScope::enter(type_name);
        Ok(factory())
    }

    /// Construct a reporting task, inside its extension scope.
    pub fn create_reporting_task(&self, type_name: &str) -> EngineResult<Arc<dyn ReportingTask>> {
        let factory = self
            .reporting_tasks
            .get(type_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::Instantiation {
                type_name: type_name.to_string(),
                reason: "unknown reporting task type".to_string(),
            })?;
        let _scope = ExtensionScope::enter(type_name);
        Ok(factory())
    }

    /// Construct a prioritiser, inside its extension scope.
    pub fn create_prioritizer(&self, type_name: &str) -> EngineResult<Arc<dyn FlowFilePrioritizer>> {
        let factory = self
            .prioritizers
            .get(type_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::Instantiation {
                type_name: type_name.to_string(),
                reason: "unknown prioritizer type".to_string(),
            })?;
        let _scope = ExtensionScope::enter(type_name);
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_restores_on_drop() {
        assert!(ExtensionScope::current().is_none());
        {
            let _outer = ExtensionScope::enter("org.example.Outer");
            assert_eq!(ExtensionScope::current().as_deref(), Some("org.example.Outer"));
            {
                let _inner = ExtensionScope::enter("org.example.Inner");
                assert_eq!(ExtensionScope::current().as_deref(), Some("org.example.Inner"));
            }
            assert_eq!(ExtensionScope::current().as_deref(), Some("org.example.Outer"));
        }
        assert!(ExtensionScope::current().is_none());
    }

    #[test]
    fn test_scope_restores_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _scope = ExtensionScope::enter("org.example.Panics");
            panic!("constructor failure");
        });
        assert!(result.is_err());
        assert!(ExtensionScope::current().is_none());
    }

    #[test]
    fn test_unknown_processor_type() {
        let registry = ExtensionRegistry::new();
        assert!(matches!(
            registry.create_processor("org.example.Missing"),
            Err(EngineError::Instantiation { .. })
        ));
    }

    #[tokio::test]
    async fn test_async_scope_travels_with_the_task() {
        let namespace = with_extension_scope("org.example.Async", async {
            tokio::task::yield_now().await;
            ExtensionScope::current()
        })
        .await;
        assert_eq!(namespace.as_deref(), Some("org.example.Async"));
        assert!(ExtensionScope::current().is_none());
    }
}

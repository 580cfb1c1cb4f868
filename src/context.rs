//! Shared engine services
//!
//! Bundles the delegated repositories, the claim manager, and the counter
//! repository so that triggers and periodic tasks can run without touching
//! the controller lock.

use crate::claim::ContentClaimManager;
use crate::config::EngineSettings;
use crate::repo::RepositorySet;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Named monotonically adjusted counters, queryable through the façade.
#[derive(Debug, Default)]
pub struct CounterRepository {
    counters: DashMap<String, AtomicI64>,
}

impl CounterRepository {
    /// Create an empty counter repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust the named counter by `delta`, creating it at zero first.
    pub fn adjust(&self, name: &str, delta: i64) -> i64 {
        let counter = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0));
        counter.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// Current value of the named counter.
    pub fn get(&self, name: &str) -> i64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Reset the named counter to zero, returning the previous value.
    pub fn reset(&self, name: &str) -> i64 {
        self.counters
            .get(name)
            .map(|c| c.swap(0, Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::SeqCst)))
            .collect()
    }
}

/// Services shared by triggers, periodic tasks, and the façade.
pub struct EngineContext {
    /// Delegated repositories
    pub repositories: RepositorySet,
    /// Content-claim reference counter
    pub claims: Arc<ContentClaimManager>,
    /// Named counters
    pub counters: CounterRepository,
    /// Controller settings
    pub settings: EngineSettings,
}

impl EngineContext {
    /// Assemble a context around the given repositories.
    pub fn new(repositories: RepositorySet, settings: EngineSettings) -> Self {
        Self {
            repositories,
            claims: Arc::new(ContentClaimManager::new()),
            counters: CounterRepository::new(),
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_adjust_and_reset() {
        let counters = CounterRepository::new();
        assert_eq!(counters.adjust("files.processed", 3), 3);
        assert_eq!(counters.adjust("files.processed", 2), 5);
        assert_eq!(counters.get("files.processed"), 5);
        assert_eq!(counters.reset("files.processed"), 5);
        assert_eq!(counters.get("files.processed"), 0);
    }
}

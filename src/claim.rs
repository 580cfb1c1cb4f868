//! Content claims and the claimant reference counter
//!
//! A content claim identifies an immutable blob in the content repository by
//! `(container, section, id)`. The claim manager tracks how many live flow
//! files reference each claim; a residual count of zero signals that the
//! content repository may reclaim the storage.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Immutable identity of a blob in the content repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentClaim {
    /// Container holding the section
    pub container: String,
    /// Section within the container
    pub section: String,
    /// Identifier within the section
    pub id: String,
    /// Whether loss of this content is tolerable
    pub loss_tolerant: bool,
}

impl ContentClaim {
    /// Create a claim identity.
    pub fn new(
        container: impl Into<String>,
        section: impl Into<String>,
        id: impl Into<String>,
        loss_tolerant: bool,
    ) -> Self {
        Self {
            container: container.into(),
            section: section.into(),
            id: id.into(),
            loss_tolerant,
        }
    }

    /// Key used by the claim manager; loss tolerance is not part of identity.
    fn key(&self) -> (String, String, String) {
        (self.container.clone(), self.section.clone(), self.id.clone())
    }
}

impl std::fmt::Display for ContentClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.container, self.section, self.id)
    }
}

/// Reference counter over content-claim identities.
///
/// `new_claim` hands out the identity without incrementing; callers that
/// retain a reference must `increment` it. Counters never go below zero.
#[derive(Debug, Default)]
pub struct ContentClaimManager {
    counts: DashMap<(String, String, String), Arc<AtomicUsize>>,
}

impl ContentClaimManager {
    /// Create an empty claim manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a claim handle. Does not take a reference.
    pub fn new_claim(
        &self,
        container: impl Into<String>,
        section: impl Into<String>,
        id: impl Into<String>,
        loss_tolerant: bool,
    ) -> ContentClaim {
        let claim = ContentClaim::new(container, section, id, loss_tolerant);
        self.counts
            .entry(claim.key())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        claim
    }

    /// Take a reference on the claim, returning the new count.
    pub fn increment(&self, claim: &ContentClaim) -> usize {
        let counter = self
            .counts
            .entry(claim.key())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Release a reference, returning the residual count. Releasing a claim
    /// with no outstanding references leaves the count at zero.
    pub fn decrement(&self, claim: &ContentClaim) -> usize {
        let Some(counter) = self.counts.get(&claim.key()).map(|c| c.clone()) else {
            return 0;
        };
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match counter.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current claimant count of the claim.
    pub fn claimant_count(&self, claim: &ContentClaim) -> usize {
        self.counts
            .get(&claim.key())
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Drop zero-count entries from the table.
    pub fn purge_unclaimed(&self) {
        self.counts.retain(|_, counter| counter.load(Ordering::SeqCst) > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_claim_does_not_increment() {
        let manager = ContentClaimManager::new();
        let claim = manager.new_claim("c1", "s1", "id1", false);
        assert_eq!(manager.claimant_count(&claim), 0);
    }

    #[test]
    fn test_increment_decrement() {
        let manager = ContentClaimManager::new();
        let claim = manager.new_claim("c1", "s1", "id1", false);
        assert_eq!(manager.increment(&claim), 1);
        assert_eq!(manager.increment(&claim), 2);
        assert_eq!(manager.decrement(&claim), 1);
        assert_eq!(manager.decrement(&claim), 0);
    }

    #[test]
    fn test_decrement_never_underflows() {
        let manager = ContentClaimManager::new();
        let claim = manager.new_claim("c1", "s1", "id1", true);
        assert_eq!(manager.decrement(&claim), 0);
        assert_eq!(manager.claimant_count(&claim), 0);
    }

    #[test]
    fn test_purge_retains_claimed() {
        let manager = ContentClaimManager::new();
        let kept = manager.new_claim("c1", "s1", "kept", false);
        let dropped = manager.new_claim("c1", "s1", "dropped", false);
        manager.increment(&kept);
        manager.purge_unclaimed();
        assert_eq!(manager.claimant_count(&kept), 1);
        assert_eq!(manager.claimant_count(&dropped), 0);
    }
}

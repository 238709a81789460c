//! Content claims and the in-memory claimant counter.
//!
//! A claim identifies a blob in the external content repository by
//! `(container, section, id)`. The engine never touches the bytes; it only
//! tracks how many live flow files reference each claim so the repository
//! knows when storage may be reclaimed.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Immutable identity of a blob in the content repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentClaim {
    container: String,
    section: String,
    id: String,
    loss_tolerant: bool,
}

impl ContentClaim {
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    #[must_use]
    pub fn section(&self) -> &str {
        &self.section
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the referenced content may be lost without failing the flow.
    #[must_use]
    pub fn is_loss_tolerant(&self) -> bool {
        self.loss_tolerant
    }
}

impl fmt::Display for ContentClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.container, self.section, self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ClaimKey {
    container: String,
    section: String,
    id: String,
}

impl ClaimKey {
    fn of(claim: &ContentClaim) -> Self {
        Self {
            container: claim.container.clone(),
            section: claim.section.clone(),
            id: claim.id.clone(),
        }
    }
}

/// Reference counter over content-claim identities.
///
/// `new_claim` only mints the handle; callers increment explicitly when they
/// take a reference and decrement when they release one. The loss-tolerance
/// flag is part of the handle, not the identity: two claims naming the same
/// blob share one counter regardless of the flag.
///
/// Counters are per-claim atomics behind one short-lived map lock, so
/// concurrent increments on different claims never contend.
#[derive(Debug, Default)]
pub struct ContentClaimManager {
    counters: Mutex<FxHashMap<ClaimKey, Arc<AtomicUsize>>>,
}

impl ContentClaimManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a claim handle. Does not take a reference.
    #[must_use]
    pub fn new_claim(
        &self,
        container: impl Into<String>,
        section: impl Into<String>,
        id: impl Into<String>,
        loss_tolerant: bool,
    ) -> ContentClaim {
        ContentClaim {
            container: container.into(),
            section: section.into(),
            id: id.into(),
            loss_tolerant,
        }
    }

    /// Take a reference on the claim; returns the new count.
    pub fn increment(&self, claim: &ContentClaim) -> usize {
        let counter = self.counter_for(claim);
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Release a reference; returns the residual count. A residual of zero
    /// signals the content repository may reclaim the blob. Decrementing a
    /// claim with no references is a no-op that stays at zero.
    pub fn decrement(&self, claim: &ContentClaim) -> usize {
        let counter = self.counter_for(claim);
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

    /// Current reference count for the claim.
    #[must_use]
    pub fn claimant_count(&self, claim: &ContentClaim) -> usize {
        self.counter_for(claim).load(Ordering::SeqCst)
    }

    /// Drop zero-count entries from the map. Invoked by the expiration
    /// sweep so long-lived engines do not accumulate dead keys.
    pub fn purge_unclaimed(&self) {
        self.counters
            .lock()
            .retain(|_, counter| counter.load(Ordering::SeqCst) > 0);
    }

    fn counter_for(&self, claim: &ContentClaim) -> Arc<AtomicUsize> {
        let mut counters = self.counters.lock();
        counters
            .entry(ClaimKey::of(claim))
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }
}

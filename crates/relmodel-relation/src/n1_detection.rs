//! N+1 load detection for relmodel relations.
//!
//! Every relation value loads lazily, once per owner. Iterating N owners and
//! reading the same relation on each one therefore issues N storage fetches.
//! `N1QueryTracker` counts real fetches per `(owner class, relation)` and warns
//! once a threshold is reached.
//!
//! # Example
//!
//! ```ignore
//! let tracker = Arc::new(N1QueryTracker::new().with_threshold(3));
//!
//! for cart in &carts {
//!     let products = RelationAttributeValue::new(cart, PRODUCTS).with_tracker(tracker.clone());
//!     products.load(&cx, &store).await; // third call logs a warning
//! }
//! ```
//!
//! The tracker is shared between relation values, so all state sits behind
//! interior mutability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use relmodel_core::EntityId;

/// Tracks relation loads for N+1 detection.
#[derive(Debug)]
pub struct N1QueryTracker {
    /// (owner class, relation name) -> load count
    counts: Mutex<HashMap<(&'static str, &'static str), usize>>,
    /// Threshold for warning (loads per relation)
    threshold: AtomicUsize,
    enabled: AtomicBool,
    /// Recorded loads, oldest first
    records: Mutex<Vec<LoadRecord>>,
}

impl Default for N1QueryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded relation load.
#[derive(Debug, Clone)]
pub struct LoadRecord {
    /// Owner class name
    pub owner_class: &'static str,
    /// Relation name
    pub relation: &'static str,
    /// Id of the owner whose relation was loaded
    pub owner_id: Option<EntityId>,
    pub timestamp: Instant,
}

/// Statistics about N+1 detection.
#[derive(Debug, Clone, Default)]
pub struct N1Stats {
    /// Total number of loads recorded
    pub total_loads: usize,
    /// Number of distinct relations loaded
    pub relations_loaded: usize,
    /// Number of relations that reached the threshold
    pub potential_n1: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl N1QueryTracker {
    /// Create a new tracker with default threshold (3).
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            threshold: AtomicUsize::new(3),
            enabled: AtomicBool::new(true),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Set the threshold for N+1 warnings.
    #[must_use]
    pub fn with_threshold(self, threshold: usize) -> Self {
        self.threshold.store(threshold, Ordering::Relaxed);
        self
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Record one real fetch of `relation` for an owner of `owner_class`.
    ///
    /// Emits a warning when the count for the pair reaches the threshold.
    pub fn record_load(
        &self,
        owner_class: &'static str,
        relation: &'static str,
        owner_id: Option<EntityId>,
    ) {
        if !self.is_enabled() {
            return;
        }

        let count = {
            let mut counts = lock(&self.counts);
            let count = counts.entry((owner_class, relation)).or_insert(0);
            *count += 1;
            *count
        };

        lock(&self.records).push(LoadRecord {
            owner_class,
            relation,
            owner_id,
            timestamp: Instant::now(),
        });

        if count == self.threshold() {
            self.emit_warning(owner_class, relation, count);
        }
    }

    fn emit_warning(&self, owner_class: &'static str, relation: &'static str, count: usize) {
        tracing::warn!(
            target: "relmodel::n1",
            owner = owner_class,
            relation = relation,
            loads = count,
            threshold = self.threshold(),
            "N+1 LOAD PATTERN DETECTED! The same relation is being loaded owner by owner."
        );

        let records = lock(&self.records);
        for (i, record) in records
            .iter()
            .filter(|r| r.owner_class == owner_class && r.relation == relation)
            .take(5)
            .enumerate()
        {
            tracing::debug!(
                target: "relmodel::n1",
                index = i,
                owner_id = ?record.owner_id,
                "  [{}] {}#{:?}",
                i,
                record.owner_class,
                record.owner_id
            );
        }
    }

    /// Reset all counts and records.
    pub fn reset(&self) {
        lock(&self.counts).clear();
        lock(&self.records).clear();
    }

    #[must_use]
    pub fn count_for(&self, owner_class: &'static str, relation: &'static str) -> usize {
        lock(&self.counts)
            .get(&(owner_class, relation))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> N1Stats {
        let threshold = self.threshold();
        let counts = lock(&self.counts);
        N1Stats {
            total_loads: counts.values().sum(),
            relations_loaded: counts.len(),
            potential_n1: counts.values().filter(|c| **c >= threshold).count(),
        }
    }

    /// Copy of all recorded loads.
    #[must_use]
    pub fn records(&self) -> Vec<LoadRecord> {
        lock(&self.records).clone()
    }
}

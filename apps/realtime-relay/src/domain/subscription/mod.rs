//! Subscriber Registry
//!
//! Tracks which logical subscribers are attached to the event bus and which
//! event kinds each one listens to.
//!
//! # Design
//!
//! The registry keeps:
//! - The set of event kinds per consumer
//! - Reference counts per event kind
//! - The process-wide subscriber count
//!
//! Dropping to zero subscribers is reported to the caller as a teardown
//! signal. The registry never tears anything down itself; the bridge decides
//! whether to act on the signal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::domain::events::EventKind;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a logical subscriber.
pub type ConsumerId = u64;

/// Result of registering a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Kinds that had no listener before this registration.
    pub newly_active: HashSet<EventKind>,
    /// Whether this is the first subscriber in the process.
    pub first_subscriber: bool,
}

/// Result of unregistering a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unregistration {
    /// Kinds left without any listener.
    pub released: HashSet<EventKind>,
    /// Subscribers remaining after this call.
    pub remaining: usize,
}

impl Unregistration {
    /// Whether the subscriber count reached zero, signalling that the
    /// transport may be torn down.
    #[must_use]
    pub const fn teardown_signalled(&self) -> bool {
        self.remaining == 0
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    consumer_kinds: HashMap<ConsumerId, HashSet<EventKind>>,
    kind_refcount: HashMap<EventKind, usize>,
}

/// Thread-safe registry of bus subscribers.
///
/// # Example
///
/// ```rust
/// use realtime_relay::domain::events::EventKind;
/// use realtime_relay::domain::subscription::SubscriberRegistry;
///
/// let registry = SubscriberRegistry::new();
/// let a = registry.next_consumer_id();
/// let b = registry.next_consumer_id();
///
/// let reg = registry.register(a, &[EventKind::PairUpdated]);
/// assert!(reg.first_subscriber);
///
/// registry.register(b, &[EventKind::PairUpdated]);
/// assert!(!registry.unregister(a).teardown_signalled());
/// assert!(registry.unregister(b).teardown_signalled());
/// ```
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh consumer id.
    pub fn next_consumer_id(&self) -> ConsumerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a consumer for the given kinds.
    ///
    /// Registering an already known consumer adds kinds to its set.
    pub fn register(&self, consumer: ConsumerId, kinds: &[EventKind]) -> Registration {
        let mut state = self.state.write();
        let first_subscriber = state.consumer_kinds.is_empty();
        let RegistryState {
            consumer_kinds,
            kind_refcount,
        } = &mut *state;

        let consumer_set = consumer_kinds.entry(consumer).or_default();
        let mut newly_active = HashSet::new();

        for kind in kinds {
            if !consumer_set.insert(*kind) {
                continue;
            }

            let refcount = kind_refcount.entry(*kind).or_insert(0);
            *refcount += 1;
            if *refcount == 1 {
                newly_active.insert(*kind);
            }
        }

        Registration {
            newly_active,
            first_subscriber,
        }
    }

    /// Remove a consumer and all of its kinds.
    pub fn unregister(&self, consumer: ConsumerId) -> Unregistration {
        let mut state = self.state.write();

        let Some(kinds) = state.consumer_kinds.remove(&consumer) else {
            return Unregistration {
                released: HashSet::new(),
                remaining: state.consumer_kinds.len(),
            };
        };

        let mut released = HashSet::new();
        for kind in kinds {
            if let Some(refcount) = state.kind_refcount.get_mut(&kind) {
                *refcount = refcount.saturating_sub(1);
                if *refcount == 0 {
                    state.kind_refcount.remove(&kind);
                    released.insert(kind);
                }
            }
        }

        Unregistration {
            released,
            remaining: state.consumer_kinds.len(),
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.read().consumer_kinds.len()
    }

    /// Number of subscribers listening to a kind.
    #[must_use]
    pub fn listeners(&self, kind: EventKind) -> usize {
        self.state
            .read()
            .kind_refcount
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Kinds with at least one listener.
    #[must_use]
    pub fn active_kinds(&self) -> Vec<EventKind> {
        let state = self.state.read();
        EventKind::ALL
            .into_iter()
            .filter(|kind| state.kind_refcount.contains_key(kind))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

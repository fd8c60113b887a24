// Reference registry — learning mode of an original network and its live references
//
// An original network and every reference network created from it (directly
// or through other references) share one registry. The registry holds the
// original's learning flag and the number of live references:
//
//   0 → 1 reference:  remember the learning flag, then force it off
//   N → 0 references: restore the remembered flag
//
// so parameters are never updated while any reference may be reading them.
// Enabling learning while references are alive is a contract violation and
// panics.
//
// Each reference holds a `ReferenceLease`. Creating the lease registers the
// reference; dropping it (from any thread) releases it. All state changes
// happen under one mutex, so concurrent drops on pool workers are safe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
struct RegistryState {
    learning_enabled: bool,
    reference_count: usize,
    /// Learning flag at the 0 → 1 transition.
    saved_learning: bool,
}

/// Learning flag and live-reference counter of an original network.
#[derive(Debug)]
pub struct ReferenceRegistry {
    state: Mutex<RegistryState>,
}

impl ReferenceRegistry {
    pub(crate) fn new(learning_enabled: bool) -> Self {
        ReferenceRegistry {
            state: Mutex::new(RegistryState {
                learning_enabled,
                reference_count: 0,
                saved_learning: learning_enabled,
            }),
        }
    }

    /// Number of live reference networks.
    pub fn reference_count(&self) -> usize {
        self.state.lock().reference_count
    }

    pub fn is_learning_enabled(&self) -> bool {
        self.state.lock().learning_enabled
    }

    /// The flag the original will have once every live reference is gone.
    pub fn settled_learning(&self) -> bool {
        let state = self.state.lock();
        if state.reference_count > 0 {
            state.saved_learning
        } else {
            state.learning_enabled
        }
    }

    /// # Panics
    ///
    /// If any reference network is alive.
    pub(crate) fn enable_learning(&self) {
        let mut state = self.state.lock();
        assert!(
            state.reference_count == 0,
            "cannot enable learning: {} reference networks are alive",
            state.reference_count
        );
        if !state.learning_enabled {
            log::debug!("learning enabled");
        }
        state.learning_enabled = true;
    }

    /// Always allowed. While references are alive the remembered flag is
    /// kept, so learning is still restored when the last one is dropped.
    pub(crate) fn disable_learning(&self) {
        let mut state = self.state.lock();
        if state.learning_enabled {
            log::debug!("learning disabled");
        }
        state.learning_enabled = false;
    }

    fn register(&self) -> usize {
        let mut state = self.state.lock();
        if state.reference_count == 0 {
            state.saved_learning = state.learning_enabled;
            if state.learning_enabled {
                log::debug!("learning disabled while reference networks are alive");
            }
            state.learning_enabled = false;
        }
        state.reference_count += 1;
        state.reference_count
    }

    fn release(&self) -> usize {
        let mut state = self.state.lock();
        debug_assert!(state.reference_count > 0, "reference released twice");
        state.reference_count = state.reference_count.saturating_sub(1);
        if state.reference_count == 0 {
            state.learning_enabled = state.saved_learning;
            if state.saved_learning {
                log::debug!("last reference network released, learning restored");
            }
        }
        state.reference_count
    }
}

/// A reference network's registration with its original.
///
/// Dropping the lease releases the reference on the registry and on the
/// network it was created from.
#[derive(Debug)]
pub struct ReferenceLease {
    registry: Arc<ReferenceRegistry>,
    parent_children: Arc<AtomicUsize>,
}

impl ReferenceLease {
    pub(crate) fn acquire(
        registry: Arc<ReferenceRegistry>,
        parent_children: Arc<AtomicUsize>,
    ) -> Self {
        parent_children.fetch_add(1, Ordering::SeqCst);
        let live = registry.register();
        log::debug!("reference network created ({live} alive)");
        ReferenceLease {
            registry,
            parent_children,
        }
    }

    /// The registry of the original network.
    pub fn registry(&self) -> &Arc<ReferenceRegistry> {
        &self.registry
    }
}

impl Drop for ReferenceLease {
    fn drop(&mut self) {
        self.parent_children.fetch_sub(1, Ordering::SeqCst);
        let live = self.registry.release();
        log::debug!("reference network released ({live} alive)");
    }
}

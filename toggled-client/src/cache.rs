//! Concurrently readable flag state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{Error, FeatureChangeEvent, Result};

/// Flag name → value map shared between the connection task (writer) and
/// host threads (readers).
///
/// Clones share the same map. Entries are created on the first event for a
/// name, overwritten by later ones, and never removed.
#[derive(Debug, Clone, Default)]
pub struct FeatureStateCache {
    inner: Arc<RwLock<HashMap<String, bool>>>,
}

impl FeatureStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the event's value. Returns the value it replaced, if any.
    pub fn apply(&self, event: FeatureChangeEvent) -> Option<bool> {
        self.inner
            .write()
            .insert(event.feature_name, event.new_value)
    }

    /// Current value of `feature_name`.
    pub fn get(&self, feature_name: &str) -> Result<bool> {
        self.inner
            .read()
            .get(feature_name)
            .copied()
            .ok_or_else(|| Error::UnknownFeature(feature_name.to_string()))
    }

    /// Owned copy of every known flag.
    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.inner.read().clone()
    }
}

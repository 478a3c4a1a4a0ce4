//! Shared handle to the local gateway's endpoint spec.

use std::sync::{Arc, RwLock};

use crate::EndpointSpec;

/// Cloneable handle; readers get a snapshot, writers mutate in place.
#[derive(Clone, Debug)]
pub struct LocalEndpoint {
    inner: Arc<RwLock<EndpointSpec>>,
}

impl LocalEndpoint {
    pub fn new(spec: EndpointSpec) -> Self {
        Self {
            inner: Arc::new(RwLock::new(spec)),
        }
    }

    /// Snapshot of the current spec.
    pub fn spec(&self) -> EndpointSpec {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply `mutate` in place. Returns true when the identity-level fields
    /// changed; address-only updates return false.
    pub fn update<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut EndpointSpec),
    {
        let mut spec = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = spec.clone();
        mutate(&mut spec);
        let identity_changed = !before.equals(&spec);
        tracing::debug!(
            cluster = %spec.cluster_id,
            endpoint = %spec.cable_name,
            identity_changed,
            "local endpoint updated"
        );
        identity_changed
    }
}

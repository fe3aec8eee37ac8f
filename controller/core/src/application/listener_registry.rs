// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::domain::provisioning::ProvisioningListener;

/// Ordered set of provisioning listeners.
///
/// Registration order is delivery order. Notifications iterate over a
/// snapshot, so listeners may be added or removed concurrently with an
/// in-flight notification without affecting it.
#[derive(Default)]
pub struct ProvisioningListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn ProvisioningListener>>>,
}

impl ProvisioningListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ProvisioningListener>) {
        debug!(listener = listener.name(), "Registering provisioning listener");
        self.listeners.write().push(listener);
    }

    /// Remove every listener registered under `name`. Returns how many were removed.
    pub fn unregister(&self, name: &str) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.name() != name);
        before - listeners.len()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ProvisioningListener>> {
        self.listeners.read().clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl ProvisioningListener for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_snapshot_preserves_registration_order() {
        let registry = ProvisioningListenerRegistry::new();
        registry.register(Arc::new(Named("first")));
        registry.register(Arc::new(Named("second")));

        let names: Vec<_> = registry.snapshot().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_changes() {
        let registry = ProvisioningListenerRegistry::new();
        registry.register(Arc::new(Named("first")));
        let snapshot = registry.snapshot();

        registry.register(Arc::new(Named("second")));
        assert_eq!(registry.unregister("first"), 1);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), "first");
        assert_eq!(registry.len(), 1);
    }
}

//! Removal of the legacy aggregated ConfigMap

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::info;

use regcache_common::kube_utils::{delete_object, ObjectStore, OperationResult};
use regcache_common::Error;

use crate::resources::LEGACY_CONFIG_MAP_NAME;

/// Deletes the aggregated ConfigMap once a namespace is on the modern schema
pub struct LegacyCleaner {
    store: Arc<dyn ObjectStore>,
}

impl LegacyCleaner {
    /// Cleaner operating on `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Delete the legacy ConfigMap in `namespace`
    ///
    /// An already absent ConfigMap is success. Any other failure is returned
    /// as [`Error::LegacyCleanup`] and must stop the pass, otherwise both
    /// schemas would be served side by side.
    pub async fn cleanup(&self, namespace: &str) -> Result<OperationResult, Error> {
        let result =
            delete_object::<ConfigMap>(self.store.as_ref(), namespace, LEGACY_CONFIG_MAP_NAME)
                .await
                .map_err(|e| Error::legacy_cleanup(namespace, LEGACY_CONFIG_MAP_NAME, e))?;
        if result == OperationResult::Deleted {
            info!(namespace = %namespace, "removed legacy monitoring ConfigMap");
        }
        Ok(result)
    }
}

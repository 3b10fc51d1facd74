//! Monitoring schema detection
//!
//! Clusters migrate from one aggregated ConfigMap to one typed object per
//! artifact. Which layout a namespace expects is decided once per pass.
//!
//! The sentinel lookup below is a migration shim. It exists only until every
//! control plane has left the legacy layout; at that point
//! [`SentinelSchemaDetector`] and the legacy branch of the reconciler are
//! removed and nothing else changes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use regcache_common::kube_utils::{object_exists, ObjectStore};
use regcache_common::Error;

/// Default sentinel: the Prometheus StatefulSet of the legacy monitoring stack
pub const DEFAULT_SENTINEL_STATEFULSET: &str = "prometheus-shoot";

/// Monitoring object layout expected by a namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    /// Single aggregated ConfigMap
    Legacy,
    /// Dashboard ConfigMap, PrometheusRule and ScrapeConfig
    Modern,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Legacy => write!(f, "legacy"),
            SchemaVersion::Modern => write!(f, "modern"),
        }
    }
}

/// Decides which schema a namespace expects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaDetector: Send + Sync {
    /// Detect the schema for `namespace`
    async fn detect(&self, namespace: &str) -> Result<SchemaVersion, Error>;
}

/// Detects the schema by the presence of a sentinel StatefulSet
pub struct SentinelSchemaDetector {
    store: Arc<dyn ObjectStore>,
    statefulset: String,
}

impl SentinelSchemaDetector {
    /// Detector looking for the StatefulSet `statefulset`
    pub fn new(store: Arc<dyn ObjectStore>, statefulset: impl Into<String>) -> Self {
        Self {
            store,
            statefulset: statefulset.into(),
        }
    }
}

#[async_trait]
impl SchemaDetector for SentinelSchemaDetector {
    async fn detect(&self, namespace: &str) -> Result<SchemaVersion, Error> {
        let present =
            object_exists::<StatefulSet>(self.store.as_ref(), namespace, &self.statefulset)
                .await
                .map_err(|e| Error::schema_detection(namespace, &self.statefulset, e))?;
        let schema = if present {
            SchemaVersion::Legacy
        } else {
            SchemaVersion::Modern
        };
        debug!(
            namespace = %namespace,
            sentinel = %self.statefulset,
            present,
            schema = %schema,
            "detected monitoring schema"
        );
        Ok(schema)
    }
}

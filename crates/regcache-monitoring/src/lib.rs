//! Registry-cache monitoring configuration
//!
//! Keeps the alerting rules, the dashboard and the scrape configuration of
//! the registry caches deployed in a shoot control-plane namespace, in
//! whichever of the two monitoring schemas that namespace expects:
//!
//! - **legacy**: one aggregated ConfigMap read by the seed monitoring stack
//! - **modern**: a dashboard ConfigMap, a `PrometheusRule` and a `ScrapeConfig`
//!
//! [`MonitoringReconciler::reconcile`] runs one idempotent pass.

#![warn(missing_docs)]

pub mod cleanup;
pub mod content;
pub mod crd;
pub mod reconcile;
pub mod relabel;
pub mod resources;
pub mod schema;
pub mod upsert;

pub use cleanup::LegacyCleaner;
pub use content::MonitoringContent;
pub use reconcile::{MonitoringReconciler, ReconcileOutcome};
pub use resources::TargetResource;
pub use schema::{SchemaDetector, SchemaVersion, SentinelSchemaDetector, DEFAULT_SENTINEL_STATEFULSET};
pub use upsert::ResourceUpserter;

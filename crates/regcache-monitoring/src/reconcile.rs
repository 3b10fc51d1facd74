//! Monitoring reconcile pass
//!
//! One pass detects the schema, then either upserts the aggregated
//! ConfigMap (legacy) or removes it and upserts the three typed objects
//! (modern). Steps run sequentially and the first failure ends the pass.
//! Nothing is retried or rolled back here: every step is idempotent and the
//! caller simply runs the next pass.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::Value;
use tracing::{info, instrument};

use regcache_common::kube_utils::{delete_object, ObjectStore, OperationResult};
use regcache_common::Error;

use crate::cleanup::LegacyCleaner;
use crate::content::MonitoringContent;
use crate::crd::{PrometheusRule, ScrapeConfig};
use crate::resources::TargetResource;
use crate::schema::{SchemaDetector, SchemaVersion};
use crate::upsert::{desired_manifest, ResourceUpserter};

/// What a pass did, object by object, in the order the objects were touched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Schema the pass reconciled
    pub schema: SchemaVersion,
    /// Result per touched object
    pub results: Vec<(TargetResource, OperationResult)>,
}

impl ReconcileOutcome {
    /// Result recorded for `target`, if it was touched
    pub fn result(&self, target: TargetResource) -> Option<OperationResult> {
        self.results
            .iter()
            .find(|(t, _)| *t == target)
            .map(|(_, r)| *r)
    }

    /// Whether the pass issued no write
    pub fn is_noop(&self) -> bool {
        self.results
            .iter()
            .all(|(_, r)| matches!(r, OperationResult::Unchanged | OperationResult::Absent))
    }
}

/// Reconciles the registry-cache monitoring objects of a namespace
pub struct MonitoringReconciler {
    store: Arc<dyn ObjectStore>,
    detector: Arc<dyn SchemaDetector>,
    cleaner: LegacyCleaner,
    upserter: ResourceUpserter,
}

impl MonitoringReconciler {
    /// Create a reconciler
    pub fn new(
        store: Arc<dyn ObjectStore>,
        detector: Arc<dyn SchemaDetector>,
        content: MonitoringContent,
    ) -> Self {
        Self {
            cleaner: LegacyCleaner::new(store.clone()),
            upserter: ResourceUpserter::new(store.clone(), content),
            store,
            detector,
        }
    }

    /// Run one reconcile pass for `namespace`
    #[instrument(skip(self), fields(schema = tracing::field::Empty))]
    pub async fn reconcile(&self, namespace: &str) -> Result<ReconcileOutcome, Error> {
        let schema = self.detector.detect(namespace).await?;
        tracing::Span::current().record("schema", tracing::field::display(schema));

        let mut results = Vec::new();
        match schema {
            SchemaVersion::Legacy => {
                let target = TargetResource::AggregatedConfigMap;
                results.push((target, self.upserter.upsert(target, namespace).await?));
            }
            SchemaVersion::Modern => {
                let cleaned = self.cleaner.cleanup(namespace).await?;
                results.push((TargetResource::AggregatedConfigMap, cleaned));
                for target in TargetResource::MODERN {
                    results.push((target, self.upserter.upsert(target, namespace).await?));
                }
            }
        }

        let outcome = ReconcileOutcome { schema, results };
        info!(
            namespace = %namespace,
            schema = %schema,
            noop = outcome.is_noop(),
            "monitoring reconciled"
        );
        Ok(outcome)
    }

    /// Delete every object this reconciler may have created in `namespace`
    ///
    /// Absent objects count as deleted. Stops at the first other failure.
    #[instrument(skip(self))]
    pub async fn teardown(
        &self,
        namespace: &str,
    ) -> Result<Vec<(TargetResource, OperationResult)>, Error> {
        let store = self.store.as_ref();
        let mut results = Vec::with_capacity(4);

        for target in [
            TargetResource::AggregatedConfigMap,
            TargetResource::DashboardConfigMap,
        ] {
            let result = delete_object::<ConfigMap>(store, namespace, &target.name()).await?;
            results.push((target, result));
        }
        let target = TargetResource::AlertRuleSet;
        let result = delete_object::<PrometheusRule>(store, namespace, &target.name()).await?;
        results.push((target, result));
        let target = TargetResource::ScrapeConfigEntry;
        let result = delete_object::<ScrapeConfig>(store, namespace, &target.name()).await?;
        results.push((target, result));

        info!(namespace = %namespace, "monitoring objects removed");
        Ok(results)
    }

    /// Desired manifests of `schema` for `namespace`
    pub fn render(&self, namespace: &str, schema: SchemaVersion) -> Result<Vec<Value>, Error> {
        render(namespace, schema, self.upserter.content())
    }
}

/// Objects reconciled under `schema`, in reconcile order
pub fn targets(schema: SchemaVersion) -> &'static [TargetResource] {
    match schema {
        SchemaVersion::Legacy => &[TargetResource::AggregatedConfigMap],
        SchemaVersion::Modern => &TargetResource::MODERN,
    }
}

/// Desired manifests of `schema` for `namespace`, without contacting the cluster
pub fn render(
    namespace: &str,
    schema: SchemaVersion,
    content: &MonitoringContent,
) -> Result<Vec<Value>, Error> {
    targets(schema)
        .iter()
        .map(|target| desired_manifest(*target, namespace, content))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::resources::{
        aggregated_config_map, dashboard_config_map, DASHBOARDS_CONFIG_MAP_NAME, DASHBOARD_KEY,
        LABEL_COMPONENT, LABEL_DASHBOARD_SHOOT, LABEL_EXTENSION_CONFIGURATION, LABEL_PROMETHEUS,
        LEGACY_CONFIG_MAP_NAME, LEGACY_KEY_ALERTING_RULES, LEGACY_KEY_DASHBOARD,
        LEGACY_KEY_SCRAPE_CONFIG,
    };
    use crate::schema::MockSchemaDetector;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use regcache_common::kube_utils::set_label;
    use regcache_common::testing::{api_error, InMemoryStore, MockObjectStore};

    const NAMESPACE: &str = "shoot--garden--dev";
    const RULE_NAME: &str = "shoot-registry-cache";

    fn content() -> MonitoringContent {
        MonitoringContent::new(
            "groups:\n- name: registry-cache.rules\n  rules: []",
            r#"{"title":"Registry Cache"}"#,
            "- job_name: registry-cache-metrics\n",
        )
    }

    fn detector(schema: SchemaVersion) -> Arc<MockSchemaDetector> {
        let mut detector = MockSchemaDetector::new();
        detector
            .expect_detect()
            .returning(move |_| Ok(schema));
        Arc::new(detector)
    }

    fn reconciler(store: Arc<dyn ObjectStore>, schema: SchemaVersion) -> MonitoringReconciler {
        MonitoringReconciler::new(store, detector(schema), content())
    }

    fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
        meta.labels.clone().unwrap_or_default()
    }

    // =========================================================================
    // Legacy schema
    // =========================================================================

    /// Story: a legacy namespace gets exactly one aggregated ConfigMap
    #[tokio::test]
    async fn story_legacy_pass_writes_single_aggregated_config_map() {
        let store = Arc::new(InMemoryStore::new());
        let outcome = reconciler(store.clone(), SchemaVersion::Legacy)
            .reconcile(NAMESPACE)
            .await
            .expect("legacy pass should succeed");

        assert_eq!(outcome.schema, SchemaVersion::Legacy);
        assert_eq!(
            outcome.results,
            vec![(TargetResource::AggregatedConfigMap, OperationResult::Created)]
        );
        assert_eq!(store.len(), 1);

        let cm: ConfigMap = store.get_typed(NAMESPACE, LEGACY_CONFIG_MAP_NAME).unwrap();
        let data = cm.data.clone().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(
            data[LEGACY_KEY_ALERTING_RULES],
            "registry-cache.rules.yaml: |\n  groups:\n  - name: registry-cache.rules\n    rules: []\n"
        );
        assert_eq!(
            data[LEGACY_KEY_SCRAPE_CONFIG],
            "- job_name: registry-cache-metrics\n"
        );
        assert_eq!(
            data[LEGACY_KEY_DASHBOARD],
            r#"registry-cache.dashboard.json: '{"title":"Registry Cache"}'"#
        );
        assert_eq!(labels_of(&cm.metadata)[LABEL_EXTENSION_CONFIGURATION], "monitoring");
    }

    /// Story: the legacy path never touches modern objects
    #[tokio::test]
    async fn story_legacy_pass_leaves_modern_objects_alone() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&dashboard_config_map(NAMESPACE));

        reconciler(store.clone(), SchemaVersion::Legacy)
            .reconcile(NAMESPACE)
            .await
            .unwrap();

        let dashboard: ConfigMap = store
            .get_typed(NAMESPACE, DASHBOARDS_CONFIG_MAP_NAME)
            .unwrap();
        assert!(dashboard.data.is_none());
        assert!(!store.contains::<PrometheusRule>(NAMESPACE, RULE_NAME));
    }

    // =========================================================================
    // Modern schema
    // =========================================================================

    /// Story: migrating removes the aggregated ConfigMap and creates three objects
    #[tokio::test]
    async fn story_modern_pass_migrates_from_legacy() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(&aggregated_config_map(NAMESPACE));

        let outcome = reconciler(store.clone(), SchemaVersion::Modern)
            .reconcile(NAMESPACE)
            .await
            .expect("modern pass should succeed");

        assert_eq!(
            outcome.results,
            vec![
                (TargetResource::AggregatedConfigMap, OperationResult::Deleted),
                (TargetResource::DashboardConfigMap, OperationResult::Created),
                (TargetResource::AlertRuleSet, OperationResult::Created),
                (TargetResource::ScrapeConfigEntry, OperationResult::Created),
            ]
        );
        assert!(!store.contains::<ConfigMap>(NAMESPACE, LEGACY_CONFIG_MAP_NAME));
        assert_eq!(store.len(), 3);

        let dashboard: ConfigMap = store
            .get_typed(NAMESPACE, DASHBOARDS_CONFIG_MAP_NAME)
            .unwrap();
        let labels = labels_of(&dashboard.metadata);
        assert_eq!(labels[LABEL_COMPONENT], "registry-cache");
        assert_eq!(labels[LABEL_DASHBOARD_SHOOT], "true");
        assert_eq!(
            dashboard.data.unwrap()[DASHBOARD_KEY],
            r#"{"title":"Registry Cache"}"#
        );

        let rule: PrometheusRule = store.get_typed(NAMESPACE, RULE_NAME).unwrap();
        assert_eq!(labels_of(&rule.metadata)[LABEL_PROMETHEUS], "shoot");
        let alerts = rule.spec.groups[0].rules.iter().filter(|r| r.is_alert()).count();
        assert_eq!(alerts, 2);

        let scrape: ScrapeConfig = store.get_typed(NAMESPACE, RULE_NAME).unwrap();
        assert_eq!(labels_of(&scrape.metadata)[LABEL_COMPONENT], "registry-cache");
        assert_eq!(scrape.spec.kubernetes_sd_configs[0].role, "endpoints");
        assert_eq!(scrape.spec.scheme.as_deref(), Some("HTTPS"));
    }

    /// Story: a namespace that never had the legacy ConfigMap migrates cleanly
    #[tokio::test]
    async fn story_modern_pass_without_legacy_config_map() {
        let store = Arc::new(InMemoryStore::new());

        let outcome = reconciler(store.clone(), SchemaVersion::Modern)
            .reconcile(NAMESPACE)
            .await
            .unwrap();

        assert_eq!(
            outcome.result(TargetResource::AggregatedConfigMap),
            Some(OperationResult::Absent)
        );
        assert_eq!(store.len(), 3);
    }

    /// Story: a second pass with the same content writes nothing
    #[tokio::test]
    async fn story_second_pass_is_a_noop() {
        for schema in [SchemaVersion::Legacy, SchemaVersion::Modern] {
            let store = Arc::new(InMemoryStore::new());
            let reconciler = reconciler(store.clone(), schema);

            let first = reconciler.reconcile(NAMESPACE).await.unwrap();
            assert!(!first.is_noop());
            let state = store.snapshot();
            let writes = store.write_count();

            let second = reconciler.reconcile(NAMESPACE).await.unwrap();
            assert!(second.is_noop(), "{schema} pass should be a no-op: {second:?}");
            assert_eq!(store.write_count(), writes);
            assert_eq!(store.snapshot(), state);
        }
    }

    /// Story: labels added by another controller survive every pass
    #[tokio::test]
    async fn story_foreign_labels_are_preserved() {
        let store = Arc::new(InMemoryStore::new());
        let mut dashboard = dashboard_config_map(NAMESPACE);
        set_label(&mut dashboard.metadata, "observability.example/owner", "team-a");
        store.insert(&dashboard);

        let outcome = reconciler(store.clone(), SchemaVersion::Modern)
            .reconcile(NAMESPACE)
            .await
            .unwrap();
        assert_eq!(
            outcome.result(TargetResource::DashboardConfigMap),
            Some(OperationResult::Updated)
        );

        let stored: ConfigMap = store
            .get_typed(NAMESPACE, DASHBOARDS_CONFIG_MAP_NAME)
            .unwrap();
        let labels = labels_of(&stored.metadata);
        assert_eq!(labels["observability.example/owner"], "team-a");
        assert_eq!(labels[LABEL_COMPONENT], "registry-cache");
    }

    // =========================================================================
    // Failure ordering
    // =========================================================================

    /// Story: a failed cleanup stops the pass before any modern write
    #[tokio::test]
    async fn story_cleanup_failure_blocks_modern_objects() {
        let mut store = MockObjectStore::new();
        store
            .expect_delete()
            .times(1)
            .returning(|_, _, _| Err(api_error(500, "InternalError")));
        store.expect_get().never();
        store.expect_create().never();
        store.expect_merge_patch().never();

        let err = reconciler(Arc::new(store), SchemaVersion::Modern)
            .reconcile(NAMESPACE)
            .await
            .expect_err("cleanup failure should abort");
        assert!(matches!(err, Error::LegacyCleanup { .. }));
        assert!(err.is_retryable());
    }

    /// Story: the first failing upsert aborts the remaining ones
    #[tokio::test]
    async fn story_first_upsert_failure_aborts_remaining() {
        let mut store = MockObjectStore::new();
        store
            .expect_delete()
            .returning(|_, _, _| Err(api_error(404, "NotFound")));
        store
            .expect_get()
            .withf(|ar, _, name| ar.kind == "ConfigMap" && name == DASHBOARDS_CONFIG_MAP_NAME)
            .times(1)
            .returning(|_, _, _| Err(api_error(503, "ServiceUnavailable")));
        store.expect_create().never();
        store.expect_merge_patch().never();

        let err = reconciler(Arc::new(store), SchemaVersion::Modern)
            .reconcile(NAMESPACE)
            .await
            .expect_err("dashboard failure should abort");
        assert_eq!(
            err.object_ref(),
            Some(("ConfigMap", DASHBOARDS_CONFIG_MAP_NAME))
        );
        assert!(err.is_retryable());
    }

    /// Story: a detection failure touches nothing
    #[tokio::test]
    async fn story_detection_failure_touches_nothing() {
        let store = MockObjectStore::new();
        let mut detector = MockSchemaDetector::new();
        detector
            .expect_detect()
            .times(1)
            .returning(|_| Err(Error::internal_with_context("detect", "api unreachable")));

        let reconciler = MonitoringReconciler::new(Arc::new(store), Arc::new(detector), content());
        let err = reconciler
            .reconcile(NAMESPACE)
            .await
            .expect_err("detection failure should surface");
        assert!(err.to_string().contains("api unreachable"));
    }

    // =========================================================================
    // Teardown and render
    // =========================================================================

    #[tokio::test]
    async fn test_teardown_of_empty_namespace_reports_absent() {
        let store = Arc::new(InMemoryStore::new());
        let results = reconciler(store, SchemaVersion::Modern)
            .teardown(NAMESPACE)
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|(_, r)| *r == OperationResult::Absent));
    }

    #[tokio::test]
    async fn test_teardown_removes_reconciled_objects() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone(), SchemaVersion::Modern);
        reconciler.reconcile(NAMESPACE).await.unwrap();

        let results = reconciler.teardown(NAMESPACE).await.unwrap();
        assert_eq!(
            results,
            vec![
                (TargetResource::AggregatedConfigMap, OperationResult::Absent),
                (TargetResource::DashboardConfigMap, OperationResult::Deleted),
                (TargetResource::AlertRuleSet, OperationResult::Deleted),
                (TargetResource::ScrapeConfigEntry, OperationResult::Deleted),
            ]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_render_lists_objects_of_schema() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone(), SchemaVersion::Modern);

        let legacy = reconciler.render(NAMESPACE, SchemaVersion::Legacy).unwrap();
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0]["metadata"]["name"], LEGACY_CONFIG_MAP_NAME);

        let modern = reconciler.render(NAMESPACE, SchemaVersion::Modern).unwrap();
        let kinds: Vec<_> = modern.iter().map(|m| m["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "PrometheusRule", "ScrapeConfig"]);
        assert!(modern.iter().all(|m| m["metadata"]["namespace"] == NAMESPACE));
        assert_eq!(store.write_count(), 0);
    }
}

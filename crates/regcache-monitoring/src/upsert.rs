//! Per-target create-or-merge-patch

use std::sync::Arc;

use kube::Resource;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use regcache_common::kube_utils::{get_and_create_or_merge_patch, ObjectStore, OperationResult};
use regcache_common::Error;

use crate::content::MonitoringContent;
use crate::resources::{
    aggregated_config_map, dashboard_config_map, mutate_aggregated_config_map,
    mutate_dashboard_config_map, mutate_prometheus_rule, mutate_scrape_config, prometheus_rule,
    scrape_config, TargetResource,
};

/// Reconciles one [`TargetResource`] at a time towards its desired state
pub struct ResourceUpserter {
    store: Arc<dyn ObjectStore>,
    content: MonitoringContent,
}

impl ResourceUpserter {
    /// Upserter writing `content` through `store`
    pub fn new(store: Arc<dyn ObjectStore>, content: MonitoringContent) -> Self {
        Self { store, content }
    }

    /// Content stamped onto the ConfigMaps
    pub fn content(&self) -> &MonitoringContent {
        &self.content
    }

    /// Create `target` in `namespace` or merge-patch the fields it owns
    pub async fn upsert(
        &self,
        target: TargetResource,
        namespace: &str,
    ) -> Result<OperationResult, Error> {
        let store = self.store.as_ref();
        let content = &self.content;

        let result = match target {
            TargetResource::AggregatedConfigMap => {
                get_and_create_or_merge_patch(store, aggregated_config_map(namespace), |cm| {
                    mutate_aggregated_config_map(cm, content)
                })
                .await?
            }
            TargetResource::DashboardConfigMap => {
                get_and_create_or_merge_patch(store, dashboard_config_map(namespace), |cm| {
                    mutate_dashboard_config_map(cm, content)
                })
                .await?
            }
            TargetResource::AlertRuleSet => {
                get_and_create_or_merge_patch(
                    store,
                    prometheus_rule(namespace),
                    mutate_prometheus_rule,
                )
                .await?
            }
            TargetResource::ScrapeConfigEntry => {
                get_and_create_or_merge_patch(store, scrape_config(namespace), mutate_scrape_config)
                    .await?
            }
        };

        info!(
            namespace = %namespace,
            kind = %target.kind(),
            name = %target.name(),
            result = %result,
            "reconciled monitoring object"
        );
        Ok(result)
    }
}

/// Desired state of `target` in `namespace` as a full manifest
pub fn desired_manifest(
    target: TargetResource,
    namespace: &str,
    content: &MonitoringContent,
) -> Result<Value, Error> {
    match target {
        TargetResource::AggregatedConfigMap => {
            let mut cm = aggregated_config_map(namespace);
            mutate_aggregated_config_map(&mut cm, content);
            manifest(&cm)
        }
        TargetResource::DashboardConfigMap => {
            let mut cm = dashboard_config_map(namespace);
            mutate_dashboard_config_map(&mut cm, content);
            manifest(&cm)
        }
        TargetResource::AlertRuleSet => {
            let mut rule = prometheus_rule(namespace);
            mutate_prometheus_rule(&mut rule);
            manifest(&rule)
        }
        TargetResource::ScrapeConfigEntry => {
            let mut config = scrape_config(namespace);
            mutate_scrape_config(&mut config);
            manifest(&config)
        }
    }
}

fn manifest<K>(object: &K) -> Result<Value, Error>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let kind = K::kind(&());
    let mut value = serde_json::to_value(object).map_err(|e| {
        let meta = object.meta();
        Error::serialization(
            kind.as_ref(),
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default(),
            e.to_string(),
        )
    })?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "apiVersion".to_string(),
            Value::String(K::api_version(&()).to_string()),
        );
        obj.insert("kind".to_string(), Value::String(kind.to_string()));
    }
    Ok(value)
}

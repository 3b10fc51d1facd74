//! Desired state of every monitoring object
//!
//! Each target has an identity constructor (name, namespace and the labels
//! used when it has to be created) and a mutator that stamps the fields this
//! component owns onto a fetched or freshly initialized object. Mutators never
//! clear labels or annotations they do not set.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use regcache_common::kube_utils::set_label;
use regcache_common::NAMESPACE_SYSTEM;

use crate::content::MonitoringContent;
use crate::crd::{
    KubernetesSdConfig, NamespaceDiscovery, PrometheusRule, PrometheusRuleSpec, Rule, RuleGroup,
    SafeAuthorization, SafeTlsConfig, ScrapeConfig, ScrapeConfigSpec,
};
use crate::relabel::RelabelConfig;

/// Component name used in labels and scoped object names
pub const COMPONENT: &str = "registry-cache";
/// Prometheus instance that scrapes the shoot's control plane components
pub const PROMETHEUS_SHOOT: &str = "shoot";

/// Aggregated ConfigMap of the legacy schema
pub const LEGACY_CONFIG_MAP_NAME: &str = "extension-registry-cache-monitoring";
/// Dashboard ConfigMap of the modern schema
pub const DASHBOARDS_CONFIG_MAP_NAME: &str = "registry-cache-dashboards";

/// File name of the dashboard document
pub const DASHBOARD_KEY: &str = "registry-cache.dashboard.json";
/// File name of the alerting rules document
pub const RULES_KEY: &str = "registry-cache.rules.yaml";

/// Aggregated ConfigMap key holding the alerting rules
pub const LEGACY_KEY_ALERTING_RULES: &str = "alerting_rules";
/// Aggregated ConfigMap key holding the scrape config
pub const LEGACY_KEY_SCRAPE_CONFIG: &str = "scrape_config";
/// Aggregated ConfigMap key holding the operator dashboard
pub const LEGACY_KEY_DASHBOARD: &str = "dashboard_operators";

/// Component label
pub const LABEL_COMPONENT: &str = "component";
/// Prometheus instance selection label
pub const LABEL_PROMETHEUS: &str = "prometheus";
/// Marks a ConfigMap as a shoot dashboard
pub const LABEL_DASHBOARD_SHOOT: &str = "dashboard.monitoring.gardener.cloud/shoot";
/// Marks a ConfigMap as extension configuration
pub const LABEL_EXTENSION_CONFIGURATION: &str = "extensions.gardener.cloud/configuration";
/// Value of [`LABEL_EXTENSION_CONFIGURATION`] for monitoring configuration
pub const LABEL_MONITORING: &str = "monitoring";

/// Scrape job name
pub const SCRAPE_JOB_NAME: &str = "registry-cache-metrics";
/// Secret holding the token Prometheus uses against the shoot API server
pub const SHOOT_ACCESS_SECRET: &str = "shoot-access-prometheus-shoot";
const SHOOT_ACCESS_SECRET_KEY: &str = "token";

const KUBE_APISERVER_HOST: &str = "kube-apiserver";
const KUBE_APISERVER_PORT: u16 = 443;

const VOLUME_CLAIM_SELECTOR: &str = r#"persistentvolumeclaim=~"^cache-volume-registry-.+$""#;

/// `host:port` of the shoot API server as seen from the control plane
pub fn kube_apiserver_address() -> String {
    format!("{KUBE_APISERVER_HOST}:{KUBE_APISERVER_PORT}")
}

/// Objects managed by the reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetResource {
    /// Legacy single ConfigMap holding all three documents
    AggregatedConfigMap,
    /// Modern dashboard ConfigMap
    DashboardConfigMap,
    /// Modern PrometheusRule
    AlertRuleSet,
    /// Modern ScrapeConfig
    ScrapeConfigEntry,
}

impl TargetResource {
    /// Targets of the modern schema, in reconcile order
    pub const MODERN: [TargetResource; 3] = [
        TargetResource::DashboardConfigMap,
        TargetResource::AlertRuleSet,
        TargetResource::ScrapeConfigEntry,
    ];

    /// Kubernetes kind of the target
    pub fn kind(&self) -> String {
        match self {
            TargetResource::AggregatedConfigMap | TargetResource::DashboardConfigMap => {
                ConfigMap::kind(&()).to_string()
            }
            TargetResource::AlertRuleSet => PrometheusRule::kind(&()).to_string(),
            TargetResource::ScrapeConfigEntry => ScrapeConfig::kind(&()).to_string(),
        }
    }

    /// Object name of the target
    pub fn name(&self) -> String {
        match self {
            TargetResource::AggregatedConfigMap => LEGACY_CONFIG_MAP_NAME.to_string(),
            TargetResource::DashboardConfigMap => DASHBOARDS_CONFIG_MAP_NAME.to_string(),
            TargetResource::AlertRuleSet | TargetResource::ScrapeConfigEntry => {
                scoped_config_name(COMPONENT, PROMETHEUS_SHOOT)
            }
        }
    }
}

impl fmt::Display for TargetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.name())
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Name of a config object scoped to one Prometheus instance
pub fn scoped_config_name(name: &str, prometheus: &str) -> String {
    format!("{prometheus}-{name}")
}

/// Metadata of a config object scoped to one Prometheus instance
pub fn scoped_config_meta(name: &str, namespace: &str, prometheus: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(scoped_config_name(name, prometheus)),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            LABEL_PROMETHEUS.to_string(),
            prometheus.to_string(),
        )])),
        ..Default::default()
    }
}

fn config_map(name: &str, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Identity of the legacy aggregated ConfigMap
pub fn aggregated_config_map(namespace: &str) -> ConfigMap {
    config_map(LEGACY_CONFIG_MAP_NAME, namespace)
}

/// Identity of the dashboard ConfigMap
pub fn dashboard_config_map(namespace: &str) -> ConfigMap {
    config_map(DASHBOARDS_CONFIG_MAP_NAME, namespace)
}

/// Identity of the PrometheusRule
pub fn prometheus_rule(namespace: &str) -> PrometheusRule {
    PrometheusRule {
        metadata: scoped_config_meta(COMPONENT, namespace, PROMETHEUS_SHOOT),
        spec: PrometheusRuleSpec::default(),
    }
}

/// Identity of the ScrapeConfig
pub fn scrape_config(namespace: &str) -> ScrapeConfig {
    ScrapeConfig {
        metadata: scoped_config_meta(COMPONENT, namespace, PROMETHEUS_SHOOT),
        spec: ScrapeConfigSpec::default(),
    }
}

// =============================================================================
// Mutators
// =============================================================================

/// Stamp the legacy aggregated ConfigMap
pub fn mutate_aggregated_config_map(cm: &mut ConfigMap, content: &MonitoringContent) {
    set_label(
        &mut cm.metadata,
        LABEL_EXTENSION_CONFIGURATION,
        LABEL_MONITORING,
    );
    cm.data = Some(BTreeMap::from([
        (
            LEGACY_KEY_ALERTING_RULES.to_string(),
            content.legacy_alerting_rules(),
        ),
        (
            LEGACY_KEY_SCRAPE_CONFIG.to_string(),
            content.legacy_scrape_config(),
        ),
        (LEGACY_KEY_DASHBOARD.to_string(), content.legacy_dashboard()),
    ]));
}

/// Stamp the dashboard ConfigMap
pub fn mutate_dashboard_config_map(cm: &mut ConfigMap, content: &MonitoringContent) {
    set_label(&mut cm.metadata, LABEL_COMPONENT, COMPONENT);
    set_label(&mut cm.metadata, LABEL_DASHBOARD_SHOOT, "true");
    cm.data = Some(BTreeMap::from([(
        DASHBOARD_KEY.to_string(),
        content.dashboard().to_string(),
    )]));
}

/// Stamp the PrometheusRule
pub fn mutate_prometheus_rule(rule: &mut PrometheusRule) {
    set_label(&mut rule.metadata, LABEL_COMPONENT, COMPONENT);
    set_label(&mut rule.metadata, LABEL_PROMETHEUS, PROMETHEUS_SHOOT);
    rule.spec = prometheus_rule_spec();
}

/// Stamp the ScrapeConfig
pub fn mutate_scrape_config(config: &mut ScrapeConfig) {
    set_label(&mut config.metadata, LABEL_COMPONENT, COMPONENT);
    set_label(&mut config.metadata, LABEL_PROMETHEUS, PROMETHEUS_SHOOT);
    config.spec = scrape_config_spec();
}

// =============================================================================
// Specs
// =============================================================================

fn volume_free_percent() -> String {
    let selector = VOLUME_CLAIM_SELECTOR;
    [
        "100 * (".to_string(),
        format!("  kubelet_volume_stats_available_bytes{{{selector}}}"),
        "    /".to_string(),
        format!("  kubelet_volume_stats_capacity_bytes{{{selector}}}"),
        ")".to_string(),
    ]
    .join("\n")
}

fn alert_labels() -> BTreeMap<String, String> {
    [
        ("service", "registry-cache-extension"),
        ("severity", "warning"),
        ("type", "shoot"),
        ("visibility", "owner"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn annotations(summary: &str, description: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("description".to_string(), description.to_string()),
        ("summary".to_string(), summary.to_string()),
    ])
}

/// Alerting and recording rules for the registry caches
pub fn prometheus_rule_spec() -> PrometheusRuleSpec {
    let usage_critical = Rule {
        labels: alert_labels(),
        annotations: annotations(
            "Registry cache PersistentVolume almost full.",
            "The registry-cache PersistentVolume claimed by {{ $labels.persistentvolumeclaim }} \
             is only {{ printf \"%0.2f\" $value }}% free. When there is no available disk space, \
             no new images will be cached. However, image pull operations are not affected.",
        ),
        ..Rule::alert(
            "RegistryCachePersistentVolumeUsageCritical",
            &format!("{} < 5", volume_free_percent()),
            "1h",
        )
    };

    let full_in_four_days = Rule {
        labels: alert_labels(),
        annotations: annotations(
            "Registry cache PersistentVolume will be full in four days.",
            "Based on recent sampling, the registry cache PersistentVolume claimed by \
             {{ $labels.persistentvolumeclaim }} is expected to fill up within four days. \
             Currently {{ printf \"%0.2f\" $value }}% is available.",
        ),
        ..Rule::alert(
            "RegistryCachePersistentVolumeFullInFourDays",
            &format!(
                "{} < 15\nand\npredict_linear(kubelet_volume_stats_available_bytes{{{VOLUME_CLAIM_SELECTOR}}}[30m], 4 * 24 * 3600) <= 0",
                volume_free_percent()
            ),
            "1h",
        )
    };

    // Series named shoot:<metric>:<aggregation> are federated to the aggregate Prometheus.
    let recorded = ["pushed", "pulled"].map(|direction| {
        let metric = format!("registry_proxy_{direction}_bytes_total");
        Rule::record(
            &format!("shoot:{metric}:sum"),
            &format!("sum by (upstream_host) (rate({metric}[5m]))"),
        )
    });

    let mut rules = vec![usage_critical, full_in_four_days];
    rules.extend(recorded);

    PrometheusRuleSpec {
        groups: vec![RuleGroup {
            name: format!("{COMPONENT}.rules"),
            interval: None,
            rules,
        }],
    }
}

/// Target relabeling for the registry cache debug endpoints
pub fn scrape_relabelings() -> Vec<RelabelConfig> {
    vec![
        RelabelConfig::set("job", SCRAPE_JOB_NAME),
        RelabelConfig::keep(
            &[
                "__meta_kubernetes_pod_label_upstream_host",
                "__meta_kubernetes_pod_container_port_name",
            ],
            "(.+);debug",
        ),
        RelabelConfig::labelmap("__meta_kubernetes_pod_label_(.+)"),
        RelabelConfig::set("__address__", &kube_apiserver_address()),
        RelabelConfig::replace(
            &[
                "__meta_kubernetes_pod_name",
                "__meta_kubernetes_pod_container_port_number",
            ],
            "(.+);(.+)",
            "__metrics_path__",
            &format!("/api/v1/namespaces/{NAMESPACE_SYSTEM}/pods/${{1}}:${{2}}/proxy/metrics"),
        ),
    ]
}

/// Scrape of the registry cache pods through the shoot API server proxy
pub fn scrape_config_spec() -> ScrapeConfigSpec {
    let authorization = SafeAuthorization::from_secret(SHOOT_ACCESS_SECRET, SHOOT_ACCESS_SECRET_KEY);
    // Kubelet serving certificates are not issued for pod IPs, and the
    // cluster CA bundle is not fetched for discovery.
    let insecure = SafeTlsConfig {
        insecure_skip_verify: Some(true),
    };

    ScrapeConfigSpec {
        honor_labels: Some(false),
        scrape_timeout: Some("10s".to_string()),
        scheme: Some("HTTPS".to_string()),
        tls_config: Some(insecure.clone()),
        authorization: Some(authorization.clone()),
        kubernetes_sd_configs: vec![KubernetesSdConfig {
            api_server: Some(format!("https://{}", kube_apiserver_address())),
            role: "endpoints".to_string(),
            namespaces: Some(NamespaceDiscovery {
                names: vec![NAMESPACE_SYSTEM.to_string()],
            }),
            authorization: Some(authorization),
            tls_config: Some(insecure),
            follow_redirects: Some(true),
        }],
        relabelings: scrape_relabelings(),
        metric_relabelings: vec![RelabelConfig::keep_metrics(&["registry_proxy_.+"])],
    }
}

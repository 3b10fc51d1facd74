//! Static monitoring content: alerting rules, dashboard, scrape config
//!
//! The documents are plain text owned by the dashboard and alerting authors.
//! [`MonitoringContent::embedded`] returns the copies compiled into the
//! binary; tests construct their own with [`MonitoringContent::new`].

use crate::resources::{kube_apiserver_address, DASHBOARD_KEY, RULES_KEY, SCRAPE_JOB_NAME};
use regcache_common::NAMESPACE_SYSTEM;

const EMBEDDED_ALERTING_RULES: &str = include_str!("../content/registry-cache.rules.yaml");
const EMBEDDED_DASHBOARD: &str = include_str!("../content/dashboard.json");

/// CA bundle and token mounted into the seed Prometheus for the shoot
const SEED_CA_FILE: &str = "/etc/prometheus/seed/ca.crt";
const SHOOT_TOKEN_FILE: &str = "/var/run/secrets/gardener.cloud/shoot/token/token";

/// The three documents reconciled in one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitoringContent {
    alerting_rules: String,
    dashboard: String,
    scrape_config: String,
}

impl MonitoringContent {
    /// Content from explicit documents
    pub fn new(
        alerting_rules: impl Into<String>,
        dashboard: impl Into<String>,
        scrape_config: impl Into<String>,
    ) -> Self {
        Self {
            alerting_rules: alerting_rules.into(),
            dashboard: dashboard.into(),
            scrape_config: scrape_config.into(),
        }
    }

    /// Content shipped with the binary
    pub fn embedded() -> Self {
        Self::new(
            EMBEDDED_ALERTING_RULES,
            EMBEDDED_DASHBOARD,
            legacy_scrape_config_yaml(),
        )
    }

    /// Prometheus rule file document
    pub fn alerting_rules(&self) -> &str {
        &self.alerting_rules
    }

    /// Dashboard JSON document
    pub fn dashboard(&self) -> &str {
        &self.dashboard
    }

    /// Prometheus `scrape_configs` entry document
    pub fn scrape_config(&self) -> &str {
        &self.scrape_config
    }

    /// Alerting rules as a value of the aggregated ConfigMap
    ///
    /// The rule file is nested under its file name as a YAML block scalar.
    pub fn legacy_alerting_rules(&self) -> String {
        format!("{RULES_KEY}: |\n  {}\n", indent(&self.alerting_rules, 2))
    }

    /// Dashboard as a value of the aggregated ConfigMap
    pub fn legacy_dashboard(&self) -> String {
        format!("{DASHBOARD_KEY}: '{}'", self.dashboard)
    }

    /// Scrape config as a value of the aggregated ConfigMap
    pub fn legacy_scrape_config(&self) -> String {
        self.scrape_config.clone()
    }
}

impl Default for MonitoringContent {
    fn default() -> Self {
        Self::embedded()
    }
}

/// Indent every line but the first by `spaces` spaces
pub fn indent(text: &str, spaces: usize) -> String {
    text.replace('\n', &format!("\n{}", " ".repeat(spaces)))
}

/// Scrape job for the aggregated ConfigMap, read by the seed Prometheus
fn legacy_scrape_config_yaml() -> String {
    let api_server = kube_apiserver_address();
    format!(
        r#"- job_name: {SCRAPE_JOB_NAME}
  scheme: https
  tls_config:
    ca_file: {SEED_CA_FILE}
  authorization:
    type: Bearer
    credentials_file: {SHOOT_TOKEN_FILE}
  honor_labels: false
  kubernetes_sd_configs:
  - role: pod
    api_server: https://{api_server}
    namespaces:
      names: [ {NAMESPACE_SYSTEM} ]
    tls_config:
      ca_file: {SEED_CA_FILE}
    authorization:
      type: Bearer
      credentials_file: {SHOOT_TOKEN_FILE}
  relabel_configs:
  - source_labels: [__meta_kubernetes_pod_label_upstream_host, __meta_kubernetes_pod_container_port_name]
    action: keep
    regex: (.+);debug
  - action: labelmap
    regex: __meta_kubernetes_pod_label_(.+)
  - target_label: __address__
    action: replace
    replacement: {api_server}
  - source_labels: [__meta_kubernetes_pod_name, __meta_kubernetes_pod_container_port_number]
    action: replace
    target_label: __metrics_path__
    regex: (.+);(.+)
    replacement: /api/v1/namespaces/{NAMESPACE_SYSTEM}/pods/${{1}}:${{2}}/proxy/metrics
  metric_relabel_configs:
  - source_labels: [ __name__ ]
    regex: registry_proxy_.+
    action: keep
"#
    )
}

//! prometheus-operator resource types
//!
//! Only the fields the reconciler sets are modelled. Fields added by other
//! actors are dropped on read and, since they never appear in the computed
//! merge patch, left untouched on the server.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::relabel::RelabelConfig;

// =============================================================================
// PrometheusRule (monitoring.coreos.com/v1)
// =============================================================================

/// Spec for a PrometheusRule
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    plural = "prometheusrules",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusRuleSpec {
    /// Rule groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<RuleGroup>,
}

/// A named group of rules evaluated together
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    /// Group name
    pub name: String,
    /// Evaluation interval override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Alerting and recording rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

/// An alerting rule (`alert` set) or a recording rule (`record` set)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Name of the recorded series
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    /// Name of the alert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    /// PromQL expression; the CRD also admits a bare integer
    pub expr: IntOrString,
    /// How long the expression must hold before the alert fires
    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    /// Labels attached to the alert or series
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Alert annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    /// Alerting rule firing after `for_` has elapsed
    pub fn alert(name: &str, expr: &str, for_: &str) -> Self {
        Self {
            record: None,
            alert: Some(name.to_string()),
            expr: IntOrString::String(expr.to_string()),
            for_: Some(for_.to_string()),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Recording rule storing `expr` as `name`
    pub fn record(name: &str, expr: &str) -> Self {
        Self {
            record: Some(name.to_string()),
            alert: None,
            expr: IntOrString::String(expr.to_string()),
            for_: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Expression as PromQL text
    pub fn expression(&self) -> String {
        match &self.expr {
            IntOrString::String(expr) => expr.clone(),
            IntOrString::Int(value) => value.to_string(),
        }
    }

    /// Whether this is an alerting rule
    pub fn is_alert(&self) -> bool {
        self.alert.is_some()
    }
}

// =============================================================================
// ScrapeConfig (monitoring.coreos.com/v1alpha1)
// =============================================================================

/// Spec for a ScrapeConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1alpha1",
    kind = "ScrapeConfig",
    plural = "scrapeconfigs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeConfigSpec {
    /// Keep labels from the scraped data on conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub honor_labels: Option<bool>,
    /// Per-scrape timeout (e.g., "10s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_timeout: Option<String>,
    /// HTTP or HTTPS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// TLS settings for the scrape requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<SafeTlsConfig>,
    /// Credentials for the scrape requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<SafeAuthorization>,
    /// Kubernetes service discovery
    #[serde(
        default,
        rename = "kubernetesSDConfigs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub kubernetes_sd_configs: Vec<KubernetesSdConfig>,
    /// Target relabeling, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relabelings: Vec<RelabelConfig>,
    /// Sample relabeling, applied in order after the scrape
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_relabelings: Vec<RelabelConfig>,
}

/// TLS settings that reference no files
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafeTlsConfig {
    /// Disable certificate verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_skip_verify: Option<bool>,
}

/// Authorization header credentials taken from a Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafeAuthorization {
    /// Authorization type (defaults to Bearer)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Secret key holding the credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<SecretKeySelector>,
}

impl SafeAuthorization {
    /// Bearer credentials from `key` of the Secret `name`
    pub fn from_secret(name: &str, key: &str) -> Self {
        Self {
            type_: None,
            credentials: Some(SecretKeySelector {
                name: name.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

/// Reference to a key of a Secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretKeySelector {
    /// Secret name
    pub name: String,
    /// Key within the Secret
    pub key: String,
}

/// Kubernetes service discovery settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSdConfig {
    /// API server to discover against (defaults to in-cluster)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
    /// Discovery role (pod, service, endpoints, ...)
    pub role: String,
    /// Namespaces to discover in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceDiscovery>,
    /// Credentials for the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<SafeAuthorization>,
    /// TLS settings for the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<SafeTlsConfig>,
    /// Follow HTTP redirects from the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_redirects: Option<bool>,
}

/// Namespace selection for service discovery
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceDiscovery {
    /// Explicit namespace names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_api_identity() {
        assert_eq!(PrometheusRule::api_version(&()), "monitoring.coreos.com/v1");
        assert_eq!(PrometheusRule::plural(&()), "prometheusrules");
        assert_eq!(ScrapeConfig::api_version(&()), "monitoring.coreos.com/v1alpha1");
        assert_eq!(ScrapeConfig::kind(&()), "ScrapeConfig");
    }

    #[test]
    fn test_rule_serializes_for_keyword() {
        let rule = Rule::alert("Foo", "up == 0", "1h");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["for"], "1h");
        assert!(json.get("record").is_none());
        assert!(json.get("labels").is_none());
    }

    #[test]
    fn test_scrape_config_field_names_match_operator_schema() {
        let spec = ScrapeConfigSpec {
            kubernetes_sd_configs: vec![KubernetesSdConfig {
                role: "endpoints".to_string(),
                ..Default::default()
            }],
            authorization: Some(SafeAuthorization::from_secret("s", "token")),
            tls_config: Some(SafeTlsConfig {
                insecure_skip_verify: Some(true),
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kubernetesSDConfigs"][0]["role"], "endpoints");
        assert_eq!(json["authorization"]["credentials"]["key"], "token");
        assert_eq!(json["tlsConfig"]["insecureSkipVerify"], true);
    }
}

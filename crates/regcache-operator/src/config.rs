//! Command-line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use regcache_common::telemetry::LogFormat;
use regcache_common::Error;
use regcache_monitoring::{SchemaVersion, DEFAULT_SENTINEL_STATEFULSET};

/// Longest namespace name (a DNS label)
const MAX_LABEL_LENGTH: usize = 63;

/// Longest StatefulSet name (a DNS subdomain)
const MAX_SUBDOMAIN_LENGTH: usize = 253;

/// Registry-cache monitoring - deploys and migrates alert rules, dashboards
/// and scrape configuration for the registry caches of a shoot
#[derive(Parser, Debug)]
#[command(name = "regcache-monitoring", version, about, long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (default: in-cluster config or ~/.kube/config)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Shoot control-plane namespace holding the registry caches
    #[arg(short, long, env = "REGCACHE_NAMESPACE")]
    pub namespace: String,

    /// StatefulSet whose presence marks a namespace as still on the legacy
    /// monitoring schema
    #[arg(long, env = "REGCACHE_SENTINEL", default_value = DEFAULT_SENTINEL_STATEFULSET)]
    pub sentinel_statefulset: String,

    /// Log output format (json or text)
    #[arg(long, env = "REGCACHE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do with the namespace
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a single reconcile pass and exit
    Reconcile,

    /// Reconcile on a fixed interval until interrupted
    ///
    /// Failed passes are logged and retried on the next tick.
    Run {
        /// Seconds between passes
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },

    /// Delete every monitoring object managed for the namespace
    Teardown,

    /// Print the desired manifests of a schema as YAML without contacting the cluster
    Render {
        /// Schema to render
        #[arg(long, value_enum, default_value_t = SchemaArg::Modern)]
        schema: SchemaArg,
    },
}

/// Schema selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SchemaArg {
    /// Single aggregated ConfigMap
    Legacy,
    /// Dashboard ConfigMap, PrometheusRule and ScrapeConfig
    Modern,
}

impl From<SchemaArg> for SchemaVersion {
    fn from(arg: SchemaArg) -> Self {
        match arg {
            SchemaArg::Legacy => SchemaVersion::Legacy,
            SchemaArg::Modern => SchemaVersion::Modern,
        }
    }
}

/// Validated settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Explicit kubeconfig, if any
    pub kubeconfig: Option<PathBuf>,
    /// Namespace to reconcile
    pub namespace: String,
    /// Sentinel StatefulSet name
    pub sentinel_statefulset: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Action to perform
    pub action: Action,
}

/// Validated subcommand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// One pass
    Reconcile,
    /// Periodic passes
    Run {
        /// Time between passes
        interval: Duration,
    },
    /// Delete managed objects
    Teardown,
    /// Print manifests
    Render {
        /// Schema to print
        schema: SchemaVersion,
    },
}

impl Cli {
    /// Check the parsed arguments and turn them into [`Settings`]
    pub fn validate(self) -> Result<Settings, Error> {
        let namespace = self.namespace.trim().to_string();
        validate_name("namespace", &namespace, NameKind::Label)?;
        let sentinel_statefulset = self.sentinel_statefulset.trim().to_string();
        validate_name(
            "sentinel-statefulset",
            &sentinel_statefulset,
            NameKind::Subdomain,
        )?;

        let action = match self.command {
            Command::Reconcile => Action::Reconcile,
            Command::Run { interval: 0 } => {
                return Err(Error::config_for_field(
                    "interval",
                    "interval must be at least one second",
                ))
            }
            Command::Run { interval } => Action::Run {
                interval: Duration::from_secs(interval),
            },
            Command::Teardown => Action::Teardown,
            Command::Render { schema } => Action::Render {
                schema: schema.into(),
            },
        };

        Ok(Settings {
            kubeconfig: self.kubeconfig,
            namespace,
            sentinel_statefulset,
            log_format: self.log_format,
            action,
        })
    }
}

/// Kubernetes naming rule a value must follow
#[derive(Clone, Copy)]
enum NameKind {
    /// RFC 1123 label, e.g. namespaces
    Label,
    /// RFC 1123 subdomain, e.g. StatefulSets
    Subdomain,
}

fn validate_name(field: &str, value: &str, kind: NameKind) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::config_for_field(field, format!("{field} must not be empty")));
    }
    let (max, valid, rule) = match kind {
        NameKind::Label => (MAX_LABEL_LENGTH, is_dns_label(value), "DNS label"),
        NameKind::Subdomain => (
            MAX_SUBDOMAIN_LENGTH,
            value.split('.').all(is_dns_label),
            "DNS subdomain",
        ),
    };
    if value.len() > max {
        return Err(Error::config_for_field(
            field,
            format!("{field} '{value}' exceeds {max} characters"),
        ));
    }
    if !valid {
        return Err(Error::config_for_field(
            field,
            format!("{field} '{value}' is not a valid {rule}"),
        ));
    }
    Ok(())
}

/// DNS labels: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`
fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_LABEL_LENGTH
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("regcache-monitoring").chain(args.iter().copied());
        Cli::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&["--namespace", "shoot--garden--dev", "reconcile"])
            .validate()
            .unwrap();
        assert_eq!(settings.namespace, "shoot--garden--dev");
        assert_eq!(settings.sentinel_statefulset, "prometheus-shoot");
        assert_eq!(settings.action, Action::Reconcile);
    }

    #[test]
    fn test_run_interval_and_render_schema() {
        let run = parse(&["-n", "ns", "run", "--interval", "30"])
            .validate()
            .unwrap();
        assert_eq!(
            run.action,
            Action::Run {
                interval: Duration::from_secs(30)
            }
        );

        let render = parse(&["-n", "ns", "render", "--schema", "legacy"])
            .validate()
            .unwrap();
        assert_eq!(
            render.action,
            Action::Render {
                schema: SchemaVersion::Legacy
            }
        );
    }

    #[test]
    fn test_log_format_flag() {
        let settings = parse(&["-n", "ns", "--log-format", "text", "teardown"])
            .validate()
            .unwrap();
        assert_eq!(settings.log_format, LogFormat::Text);
        assert_eq!(settings.action, Action::Teardown);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = parse(&["-n", "ns", "run", "--interval", "0"])
            .validate()
            .expect_err("zero interval should fail");
        assert!(matches!(err, Error::Config { field: Some(ref f), .. } if f == "interval"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_namespaces_are_rejected() {
        let too_long = "a".repeat(64);
        for namespace in ["  ", "Shoot--Dev", "trailing-", "under_score", too_long.as_str()] {
            let err = parse(&["-n", namespace, "reconcile"])
                .validate()
                .expect_err("namespace should be rejected");
            assert!(
                matches!(err, Error::Config { field: Some(ref f), .. } if f == "namespace"),
                "unexpected error for {namespace:?}: {err}"
            );
        }
    }

    #[test]
    fn test_sentinel_accepts_subdomains_and_is_trimmed() {
        let settings = parse(&[
            "-n",
            "ns",
            "--sentinel-statefulset",
            " prometheus.shoot ",
            "reconcile",
        ])
        .validate()
        .unwrap();
        assert_eq!(settings.sentinel_statefulset, "prometheus.shoot");

        let long_subdomain = ["a".repeat(63), "b".repeat(63)].join(".");
        let settings = parse(&[
            "-n",
            "ns",
            "--sentinel-statefulset",
            &long_subdomain,
            "reconcile",
        ])
        .validate()
        .unwrap();
        assert_eq!(settings.sentinel_statefulset, long_subdomain);
    }

    #[test]
    fn test_invalid_sentinels_are_rejected() {
        let too_long = vec!["a".repeat(63); 4].join(".");
        for sentinel in ["prometheus..shoot", ".prometheus", "Prometheus", too_long.as_str()] {
            let err = parse(&["-n", "ns", "--sentinel-statefulset", sentinel, "reconcile"])
                .validate()
                .expect_err("sentinel should be rejected");
            assert!(
                matches!(err, Error::Config { field: Some(ref f), .. } if f == "sentinel-statefulset"),
                "unexpected error for {sentinel:?}: {err}"
            );
        }
    }

    #[test]
    fn test_dotted_namespace_is_rejected() {
        let err = parse(&["-n", "shoot.dev", "reconcile"])
            .validate()
            .expect_err("namespaces are DNS labels");
        assert!(err.to_string().contains("not a valid DNS label"));
    }

    #[test]
    fn test_empty_sentinel_is_rejected() {
        let err = parse(&["-n", "ns", "--sentinel-statefulset", "", "reconcile"])
            .validate()
            .expect_err("empty sentinel should fail");
        assert!(err.to_string().contains("sentinel-statefulset must not be empty"));
    }
}

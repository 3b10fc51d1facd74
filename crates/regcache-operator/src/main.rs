//! Registry-cache monitoring - reconciles the monitoring configuration of the
//! registry caches in a shoot control-plane namespace

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use regcache_common::kube_utils::{create_client, KubeObjectStore, ObjectStore};
use regcache_common::telemetry::{init_telemetry, TelemetryConfig};
use regcache_monitoring::reconcile::render;
use regcache_monitoring::{
    MonitoringContent, MonitoringReconciler, SchemaVersion, SentinelSchemaDetector,
};

use crate::config::{Action, Cli, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs every TLS connection to the API server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The application cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let settings = Cli::parse().validate()?;

    let telemetry = init_telemetry(TelemetryConfig {
        format: settings.log_format,
        ..Default::default()
    })?;

    let result = run(&settings).await;

    // The batch exporter blocks on flush, keep it off the runtime workers
    match tokio::task::spawn_blocking(move || telemetry.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => eprintln!("failed to flush traces: {e}"),
        Err(e) => eprintln!("telemetry shutdown task failed: {e}"),
    }

    result
}

async fn run(settings: &Settings) -> anyhow::Result<()> {
    let content = MonitoringContent::embedded();

    match settings.action {
        Action::Render { schema } => print_manifests(&settings.namespace, schema, &content),
        Action::Reconcile => {
            let reconciler = connect(settings, content).await?;
            reconcile_once(&reconciler, settings).await
        }
        Action::Run { interval } => {
            let reconciler = connect(settings, content).await?;
            run_loop(&reconciler, settings, interval).await
        }
        Action::Teardown => {
            let reconciler = connect(settings, content).await?;
            teardown(&reconciler, settings).await
        }
    }
}

/// Build a reconciler talking to the configured cluster
async fn connect(
    settings: &Settings,
    content: MonitoringContent,
) -> anyhow::Result<MonitoringReconciler> {
    let client = create_client(settings.kubeconfig.as_deref()).await?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client));
    let detector = Arc::new(SentinelSchemaDetector::new(
        store.clone(),
        settings.sentinel_statefulset.clone(),
    ));
    Ok(MonitoringReconciler::new(store, detector, content))
}

/// Print the desired manifests of `schema` as a multi-document YAML stream
fn print_manifests(
    namespace: &str,
    schema: SchemaVersion,
    content: &MonitoringContent,
) -> anyhow::Result<()> {
    let manifests = render(namespace, schema, content)?;
    for manifest in manifests {
        let yaml = serde_yaml::to_string(&manifest)
            .map_err(|e| anyhow::anyhow!("Failed to serialize manifest: {}", e))?;
        println!("---\n{}", yaml.trim_end());
    }
    Ok(())
}

async fn reconcile_once(
    reconciler: &MonitoringReconciler,
    settings: &Settings,
) -> anyhow::Result<()> {
    let outcome = reconciler
        .reconcile(&settings.namespace)
        .await
        .with_context(|| format!("reconcile of namespace {} failed", settings.namespace))?;
    for (target, result) in &outcome.results {
        info!(object = %target, result = %result, "object state");
    }
    Ok(())
}

/// Reconcile on every tick until Ctrl-C
///
/// A failed pass is logged and left to the next tick. Ctrl-C drops an
/// in-flight pass at its next await point.
async fn run_loop(
    reconciler: &MonitoringReconciler,
    settings: &Settings,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        namespace = %settings.namespace,
        interval_secs = interval.as_secs(),
        "reconcile loop started"
    );

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("shutdown requested, stopping reconcile loop");
                return Ok(());
            }
            result = async {
                ticker.tick().await;
                reconciler.reconcile(&settings.namespace).await
            } => {
                if let Err(e) = result {
                    error!(
                        namespace = %settings.namespace,
                        error = %e,
                        retryable = e.is_retryable(),
                        "reconcile pass failed"
                    );
                }
            }
        }
    }
}

async fn teardown(reconciler: &MonitoringReconciler, settings: &Settings) -> anyhow::Result<()> {
    let results = reconciler
        .teardown(&settings.namespace)
        .await
        .with_context(|| format!("teardown of namespace {} failed", settings.namespace))?;
    for (target, result) in results {
        info!(object = %target, result = %result, "object removed");
    }
    Ok(())
}

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use kubesync_config::{KubeSyncConfig, StorageDefinition};
use kubesync_controller::{PersisterSet, Reconciler, WorkerOptions};
use kubesync_core::{gvk_string, BasicTransformer};
use kubesync_kubehub::{KubeResourceClient, WatchTarget};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kubesync", version, about = "Mirrors Kubernetes resources into filesystem and git storages")]
struct Cli {
    /// Path to the configuration file
    #[arg(long = "config", env = "KUBESYNC_CONFIG")]
    config: PathBuf,

    /// Kubeconfig file (default: KUBECONFIG, ~/.kube/config or in-cluster)
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,

    /// Concurrent reconciles per sync config
    #[arg(long = "workers", env = "KUBESYNC_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Validate the configuration and exit
    #[arg(long = "check", action = ArgAction::SetTrue)]
    check: bool,
}

fn init_tracing() {
    let env = std::env::var("KUBESYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBESYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KUBESYNC_METRICS_ADDR; expected host:port");
        }
    }
}

/// Builds every storage's persister chain. Git storages clone or open their repository here.
fn build_persisters(defs: &[StorageDefinition]) -> Result<PersisterSet> {
    let mut out = PersisterSet::default();
    for def in defs {
        let persister = kubesync_persist::build_persister(def).with_context(|| format!("building storage '{}'", def.name))?;
        info!(storage = %def.name, kind = %def.storage_type, chain = ?kubesync_persist::chain(persister.as_ref()), "storage ready");
        out.insert(def.name.clone(), persister);
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cfg = match KubeSyncConfig::load_validated(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %cli.config.display(), "configuration rejected");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    info!(path = %cli.config.display(), sync_configs = cfg.sync_configs.len(), storages = cfg.storage_definitions.len(), "configuration loaded");
    if cli.check {
        println!("configuration is valid");
        return Ok(());
    }
    init_metrics();

    let defs = cfg.storage_definitions.clone();
    let persisters = tokio::task::spawn_blocking(move || build_persisters(&defs)).await??;
    let client = kubesync_kubehub::client_from(cli.kubeconfig.as_deref()).await?;
    let cap = std::env::var("KUBESYNC_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1024);
    let opts = WorkerOptions::from_env(cli.workers);

    let mut tasks = JoinSet::new();
    for sync in &cfg.sync_configs {
        let gvk = sync.gvk().ok_or_else(|| anyhow!("sync config '{}' has no resource", sync.id))?;
        let resources = KubeResourceClient::discover(client.clone(), &gvk)
            .await
            .with_context(|| format!("resolving resource of sync config '{}'", sync.id))?;
        let target = WatchTarget {
            ar: resources.api_resource().clone(),
            namespaced: resources.namespaced(),
            namespace: sync.namespace().map(str::to_string),
            finalize: sync.finalize(),
        };
        let reconciler = Reconciler::new(&cfg, sync, &persisters, Arc::new(resources), Arc::new(BasicTransformer::new()))?;
        info!(
            id = %sync.id,
            gvk = %gvk_string(&gvk),
            ns = ?target.namespace,
            state_display = ?reconciler.state_display().map(|d| d.kind()),
            verbosity = ?reconciler.state_display().map(|d| d.verbosity()),
            storages = %reconciler.describe_storages(),
            "sync configured"
        );

        let (tx, rx) = mpsc::channel(cap);
        let watch_client = client.clone();
        let id = sync.id.clone();
        tasks.spawn(async move {
            if let Err(e) = kubesync_kubehub::watch_resources(watch_client, target, tx).await {
                error!(id = %id, error = ?e, "watcher failed");
            }
        });
        tasks.spawn(kubesync_controller::run(Arc::new(reconciler), rx, opts));
    }

    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                info!("shutdown requested");
                break;
            }
            next = tasks.join_next() => match next {
                Some(Ok(())) => warn!("controller task ended"),
                Some(Err(e)) => error!(error = %e, "controller task failed"),
                None => break,
            },
        }
    }
    tasks.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_with_defaults() {
        let cli = Cli::try_parse_from(["kubesync", "--config", "/etc/kubesync/config.yaml", "--check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/kubesync/config.yaml"));
        assert!(cli.check);
        assert!(cli.kubeconfig.is_none());
        assert!(cli.workers >= 1);
    }

    #[test]
    fn config_is_required() {
        std::env::remove_var("KUBESYNC_CONFIG");
        assert!(Cli::try_parse_from(["kubesync"]).is_err());
    }
}

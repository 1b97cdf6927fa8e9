//! skala binary: load config, wire the pipeline, run the ticker and the
//! REST server until a shutdown signal.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use skala_core::Config;
use skala_engine::AutoscalePipeline;
use skala_exec::{CombinedExecuter, Executer};
use skala_kubehub::{KubeHub, KubernetesMetricsGatherer};

#[derive(Parser, Debug)]
#[command(name = "skala", version, about = "Custom horizontal autoscaler framework")]
struct Cli {
    /// Path to the autoscaler config file
    #[arg(long = "config", env = "configpath", default_value = "/config.yaml")]
    config: std::path::PathBuf,
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = std::env::var("SKALA_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(config.log_verbosity);
    let target = config.scale_target_ref.clone().context("scaleTargetRef missing")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        kind = %target.kind,
        name = %target.name,
        namespace = %config.namespace,
        run_mode = %config.run_mode,
        "skala starting"
    );

    let config = Arc::new(config);
    let hub = Arc::new(
        KubeHub::connect().await.context("failed to construct Kubernetes client")?,
    );
    let executer: Arc<dyn Executer> = Arc::new(CombinedExecuter::default_stack());
    let k8s_metrics: Option<Arc<dyn KubernetesMetricsGatherer>> =
        if config.kubernetes_metric_specs.is_empty() {
            None
        } else {
            Some(Arc::new(hub.metrics_gatherer()))
        };
    let pipeline = Arc::new(AutoscalePipeline::new(config.clone(), hub, executer, k8s_metrics));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = tokio::spawn(skala_engine::run_ticker(pipeline.clone(), shutdown_rx.clone()));
    let mut server = tokio::spawn({
        let config = config.clone();
        async move { skala_api::serve(pipeline, &config.host, config.port, shutdown_rx).await }
    });

    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutdown signal received");
        }
        // The server exiting on its own means it failed to bind or died.
        res = &mut server => {
            let _ = shutdown_tx.send(true);
            let _ = ticker.await;
            return match res {
                Ok(Ok(())) => Err(anyhow!("REST server exited unexpectedly")),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(anyhow!("REST server task panicked: {err}")),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = ticker.await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = ?err, "REST server failed during shutdown"),
        Err(err) => error!(error = %err, "REST server task panicked"),
    }
    info!("skala stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

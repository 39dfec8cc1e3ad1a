//! Caravel backend entry point: pick a backend, wire the pipeline, run.
mod cli;

use caravel::cache::StatusCache;
use caravel::config::load_config;
use caravel::docker::{CodeSync, DockerObserver};
use caravel::error::CaravelError;
use caravel::events::{
    run_camel_poller, run_camel_trigger, run_sse_bridge, FanOut, LifecycleEvent,
};
use caravel::health::Health;
use caravel::kubernetes::KubernetesObserver;
use caravel::reconcile::{Observation, Reconciler};
use env_logger::Env;
use log::{error, info, warn};
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::cli::configure_cli;

/// Wiring point for the project file service, which owns the sources to copy
/// into a devmode container. Until that service is attached the request is
/// only recorded; the engine side of the contract is [`CodeSync`].
struct PendingCodeSync;

impl CodeSync for PendingCodeSync {
    async fn sync(&self, container_name: &str) -> Result<(), CaravelError> {
        info!("code sync requested for {container_name}, no file service attached");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let options = configure_cli();
    let config = load_config(&options.config)?;
    info!("Starting caravel for environment `{}`", config.environment);

    ctrlc::set_handler(move || {
        info!("Received shutdown signal, gracefully shutting down...");
        process::exit(0);
    })
    .expect("Error setting Ctrl-C handler");

    let cache = StatusCache::new();
    let health = Health::new();

    // fan-out consumers
    let mut fanout = FanOut::new();
    let rx_sse = fanout.subscribe(256);
    let rx_trigger = fanout.subscribe(256);
    let (sse_clients, _) = broadcast::channel::<String>(100);
    tokio::spawn(run_sse_bridge(rx_sse, sse_clients.clone()));

    let (tx_targets, rx_targets) = mpsc::channel(64);
    tokio::spawn(run_camel_trigger(rx_trigger, tx_targets));
    tokio::spawn(run_camel_poller(
        rx_targets,
        cache.clone(),
        config.camel.health_port,
    ));

    // single reconciler task keeps per-key ordering
    let (tx_observations, rx_observations) = mpsc::channel::<Observation>(256);
    let reconciler = Reconciler::new(cache.clone(), fanout.clone());
    tokio::spawn(reconciler.run(rx_observations));

    let kubernetes = match options.backend.as_deref() {
        Some("kubernetes") => true,
        Some(_) => false,
        None => env::var("KUBERNETES_SERVICE_HOST").is_ok(),
    };

    if kubernetes {
        info!("running against the Kubernetes API");
        let observer = match KubernetesObserver::connect(&config, tx_observations, health.clone()).await
        {
            Ok(observer) => Arc::new(observer),
            Err(e) => {
                error!("cannot reach the Kubernetes API: {e}");
                process::exit(1);
            }
        };
        let pods = observer.clone();
        tokio::spawn(async move { pods.watch_pods().await });
        let deployments = observer.clone();
        tokio::spawn(async move { deployments.watch_deployments().await });
        let services = observer.clone();
        tokio::spawn(async move { services.watch_services().await });
        let resync = observer.clone();
        tokio::spawn(async move { resync.run_resync_loop().await });
    } else {
        info!("running against the Docker engine");
        let observer = match DockerObserver::connect(&config, tx_observations, cache.clone(), health.clone())
        {
            Ok(observer) => observer,
            Err(e) => {
                error!("cannot create the Docker client: {e}");
                process::exit(1);
            }
        };
        if let Err(e) = observer.ping().await {
            error!("Docker engine unreachable: {e}");
            process::exit(1);
        }

        let (tx_side_effects, rx_side_effects) = mpsc::channel::<LifecycleEvent>(64);
        tokio::spawn(
            observer
                .clone()
                .run_lifecycle_effects(rx_side_effects, PendingCodeSync),
        );
        tokio::spawn(observer.clone().run_status_loop());
        tokio::spawn(observer.clone().run_stats_loop());
        tokio::spawn(observer.run_event_loop(tx_side_effects));
    }

    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if !health.ready(kubernetes) {
            warn!("degraded: backend unreachable or watches not yet established");
        }
    }
}

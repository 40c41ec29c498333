// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::ControllerConfig;
use crate::engine::{Context, Dispatcher, ReconcileEngine};
use crate::error::{Error, Result};
use crate::lock_request::LockRequestHandler;
use crate::memory::{MemoryPressureController, ProcessSampler};
use crate::scanner::PeriodicScanner;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::types::*;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shared state handed to the LockRequest controller's reconcile function.
pub struct Data {
    pub handler: LockRequestHandler,
}

/// Starts every loop of the controller and returns once they have all
/// stopped after SIGINT or SIGTERM.
pub async fn run(config: ControllerConfig) -> Result<()> {
    config.validate()?;
    let client = Client::try_default()
        .await
        .map_err(|e| Error::from_kube("client", e))?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));
    let ctx = Context::new(cluster, config);
    let (trigger, shutdown) = shutdown::channel();

    let engine = Arc::new(ReconcileEngine::new(ctx.clone()));
    let dispatcher = Dispatcher::new(engine.clone(), shutdown.clone());
    let scanner = Arc::new(PeriodicScanner::new(engine));

    // The event path drops everything until the filter has been filled once.
    match scanner.refresh_filter().await {
        Ok(size) => info!(size, "Relevance filter loaded"),
        Err(e) => warn!("Initial filter refresh failed: {}, relying on scans", e),
    }

    let memory = MemoryPressureController::new(ctx.clone(), Box::new(ProcessSampler::new()));
    let data = Arc::new(Data {
        handler: LockRequestHandler::new(dispatcher.clone()),
    });

    let tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(scanner.clone().run_fast(shutdown.clone())),
        tokio::spawn(scanner.clone().run_slow(shutdown.clone())),
        tokio::spawn(scanner.run_filter_refresh(shutdown.clone())),
        tokio::spawn(memory.run(shutdown.clone())),
        tokio::spawn(report_metrics(ctx.clone(), shutdown.clone())),
        tokio::spawn(watch_namespaces(client.clone(), dispatcher, shutdown.clone())),
        tokio::spawn(run_lock_requests(client, data)),
    ];
    info!("nslock controller started");

    wait_for_signal().await;
    info!("Shutdown signal received, stopping");
    trigger_and_join(trigger, tasks).await;
    info!("controller terminated");
    Ok(())
}

async fn trigger_and_join(trigger: ShutdownTrigger, tasks: Vec<JoinHandle<()>>) {
    trigger.trigger();
    for res in future::join_all(tasks).await {
        if let Err(e) = res {
            error!("Controller task ended abnormally: {}", e);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Feeds one namespace watch event to the dispatcher.
pub fn observe_namespace_event(dispatcher: &Dispatcher, event: watcher::Event<Namespace>) {
    match event {
        watcher::Event::Applied(ns) => observe_namespace(dispatcher, &ns),
        watcher::Event::Restarted(list) => {
            for ns in list.iter() {
                observe_namespace(dispatcher, ns);
            }
        }
        watcher::Event::Deleted(ns) => {
            if let Some(name) = ns.metadata.name.as_deref() {
                dispatcher.forget(name);
            }
        }
    }
}

fn observe_namespace(dispatcher: &Dispatcher, ns: &Namespace) {
    let state = NamespaceState::from(ns);
    if state.name.is_empty() {
        return;
    }
    if state.carries_lock_markers() {
        let ctx = dispatcher.engine().context();
        ctx.filter.insert(ctx.interner.intern(&state.name));
    }
    dispatcher.submit(&state.name);
}

async fn watch_namespaces(client: Client, dispatcher: Dispatcher, shutdown: Shutdown) {
    let error_requeue = dispatcher.engine().context().config.error_requeue;
    let api = Api::<Namespace>::all(client);
    let mut events = watcher(api, ListParams::default()).boxed();
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            event = events.next() => match event {
                Some(Ok(event)) => observe_namespace_event(&dispatcher, event),
                Some(Err(e)) => {
                    warn!("Namespace watch failed: {}, will retry", e);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(error_requeue) => {}
                    }
                }
                None => {
                    warn!("Namespace watch stream ended");
                    break;
                }
            }
        }
    }
    info!("namespace watcher terminated");
}

// Stops on the same SIGINT/SIGTERM that fires the shared shutdown signal.
async fn run_lock_requests(client: Client, data: Arc<Data>) {
    let requests = Api::<LockRequest>::all(client);
    Controller::new(requests, ListParams::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, data)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("reconciled {:?}", o),
                Err(e) => warn!("reconcile failed: {}", e),
            }
        })
        .await;
    info!("lock request controller terminated");
}

/// Reconcile function registered with the LockRequest controller.
pub async fn reconcile(request: Arc<LockRequest>, data: Arc<Data>) -> Result<Action> {
    let outcome = data.handler.handle(&request).await?;
    let config = &data.handler.dispatcher().engine().context().config;
    if outcome.converged() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(config.error_requeue))
    }
}

pub fn error_policy(_request: Arc<LockRequest>, _error: &Error, data: Arc<Data>) -> Action {
    Action::requeue(data.handler.dispatcher().engine().context().config.error_requeue)
}

async fn report_metrics(ctx: Arc<Context>, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(ctx.config.metrics_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let snapshot = ctx.metrics.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(counters) => info!(
                        %counters,
                        filter = ctx.filter.len(),
                        index = ctx.index.len(),
                        interned = ctx.interner.len(),
                        resident_bytes = ctx.pressure.resident_bytes(),
                        "Metrics"
                    ),
                    Err(e) => warn!("Cannot encode metrics: {}", e),
                }
            }
        }
    }
    info!("metrics reporter terminated");
}

// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::cluster::for_each_namespace_page;
use crate::engine::{ReconcileEngine, ReconcileOutcome};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use crate::types::*;
use futures::{stream, Future, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub listed: usize,
    pub converged: usize,
    pub deleted: usize,
    pub retry: usize,
    /// The sweep stopped early because memory was over the defer threshold.
    pub deferred: bool,
}

impl ScanSummary {
    fn tally(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Converged(_) => self.converged += 1,
            ReconcileOutcome::Deleted => self.deleted += 1,
            ReconcileOutcome::Requeue { .. } => self.retry += 1,
            _ => {}
        }
    }
}

/// Re-asserts every namespace's state on two cadences, independent of events.
///
/// The fast scan walks namespaces labelled locked and active, which also
/// catches lock expiry. The slow scan walks every namespace in bounded pages
/// and treats unlabelled ones as active. Both run the engine's convergence
/// logic directly, bypassing the relevance filter.
pub struct PeriodicScanner {
    engine: Arc<ReconcileEngine>,
}

impl PeriodicScanner {
    pub fn new(engine: Arc<ReconcileEngine>) -> PeriodicScanner {
        PeriodicScanner { engine }
    }

    pub async fn fast_scan(&self) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        for value in [STATUS_LOCKED, STATUS_ACTIVE] {
            let selector = format!("{}={}", STATUS_LABEL, value);
            self.sweep(Some(&selector), &mut summary)
                .await
                .map_err(|e| self.record_failure(e))?;
        }
        Metrics::inc(&self.engine.context().metrics.fast_scans);
        Ok(summary)
    }

    pub async fn slow_scan(&self) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        self.sweep(None, &mut summary)
            .await
            .map_err(|e| self.record_failure(e))?;
        Metrics::inc(&self.engine.context().metrics.slow_scans);
        Ok(summary)
    }

    async fn sweep(&self, selector: Option<&str>, summary: &mut ScanSummary) -> Result<()> {
        let ctx = self.engine.context();
        let mut continue_token = None;
        loop {
            if self.engine.under_pressure() {
                info!("Memory over defer threshold, cutting scan short");
                summary.deferred = true;
                return Ok(());
            }
            ctx.metrics.api_call();
            let page = ctx
                .cluster
                .list_namespaces(selector, ctx.config.scan_batch, continue_token.take())
                .await?;
            summary.listed += page.items.len();
            let engine = &self.engine;
            let outcomes: Vec<ReconcileOutcome> = stream::iter(page.items)
                .map(|ns| async move { engine.converge(&ns).await })
                .buffer_unordered(ctx.config.workers)
                .collect()
                .await;
            for outcome in outcomes.iter() {
                summary.tally(outcome);
            }
            match page.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => return Ok(()),
            }
        }
    }

    /// Rebuilds the relevance filter from LockRequest targets and namespaces
    /// carrying the status label or an expiry annotation. Annotations cannot
    /// be selected server-side, so every namespace page is visited.
    pub async fn refresh_filter(&self) -> Result<usize> {
        let ctx = self.engine.context();
        ctx.metrics.api_call();
        let requests = ctx
            .cluster
            .list_lock_requests()
            .await
            .map_err(|e| self.record_failure(e))?;
        let mut names: Vec<Arc<str>> = requests
            .iter()
            .flat_map(|r| r.spec.namespace_names.iter())
            .map(|name| ctx.interner.intern(name))
            .collect();
        let pages = for_each_namespace_page(
            ctx.cluster.as_ref(),
            None,
            ctx.config.scan_batch,
            |items| {
                ctx.metrics.api_call();
                names.extend(
                    items
                        .iter()
                        .filter(|ns| ns.carries_lock_markers())
                        .map(|ns| ctx.interner.intern(&ns.name)),
                );
            },
        )
        .await
        .map_err(|e| self.record_failure(e))?;
        debug!(lock_requests = requests.len(), namespaces = pages, "Collected relevant names");
        ctx.filter.refresh(names);
        Ok(ctx.filter.len())
    }

    pub async fn run_fast(self: Arc<Self>, shutdown: Shutdown) {
        let scanner = &*self;
        let period = scanner.engine.context().config.fast_scan_interval;
        run_every("fast scan", period, Duration::ZERO, shutdown, move || async move {
            scanner.fast_scan().await.map(|s| {
                debug!(
                    listed = s.listed,
                    converged = s.converged,
                    deleted = s.deleted,
                    retry = s.retry,
                    deferred = s.deferred,
                    "Fast scan finished"
                )
            })
        })
        .await;
        info!("fast scan loop terminated");
    }

    pub async fn run_slow(self: Arc<Self>, shutdown: Shutdown) {
        let scanner = &*self;
        let period = scanner.engine.context().config.slow_scan_interval;
        run_every("slow scan", period, period, shutdown, move || async move {
            scanner.slow_scan().await.map(|s| {
                info!(
                    listed = s.listed,
                    converged = s.converged,
                    deleted = s.deleted,
                    retry = s.retry,
                    deferred = s.deferred,
                    "Slow scan finished"
                )
            })
        })
        .await;
        info!("slow scan loop terminated");
    }

    pub async fn run_filter_refresh(self: Arc<Self>, shutdown: Shutdown) {
        let scanner = &*self;
        let period = scanner.engine.context().config.filter_refresh_interval;
        run_every("filter refresh", period, period, shutdown, move || async move {
            scanner.refresh_filter().await.map(|_| ())
        })
        .await;
        info!("filter refresh loop terminated");
    }

    fn record_failure(&self, e: crate::Error) -> crate::Error {
        Metrics::inc(&self.engine.context().metrics.scan_failures);
        e
    }
}

// A failed pass is logged and retried at the next tick.
async fn run_every<F, Fut>(
    task: &str,
    period: Duration,
    first_delay: Duration,
    shutdown: Shutdown,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut ticker = interval_at(Instant::now() + first_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => {
                if let Err(e) = pass().await {
                    warn!("{} failed: {}, will retry at the next tick", task, e);
                }
            }
        }
    }
}

// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::cache::{CompactStateIndex, InternPool, RelevanceFilter};
use crate::cluster::ClusterApi;
use crate::config::{ControllerConfig, ExpiryPolicy};
use crate::memory::PressureGauge;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use crate::types::*;
use crate::worker::{TransitionReport, TransitionWorker, WorkerSettings};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Everything shared by the dispatcher, the scanners and the memory monitor.
/// Built once at startup; the caches in here are hints, never the truth.
pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub config: ControllerConfig,
    pub filter: RelevanceFilter,
    pub index: CompactStateIndex,
    pub interner: InternPool,
    pub metrics: Arc<Metrics>,
    pub pressure: PressureGauge,
}

impl Context {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ControllerConfig) -> Arc<Context> {
        Arc::new(Context {
            cluster,
            filter: RelevanceFilter::new(config.filter_max_entries),
            index: CompactStateIndex::new(config.index_capacity),
            interner: InternPool::new(config.intern_max_entries),
            metrics: Arc::new(Metrics::default()),
            pressure: PressureGauge::default(),
            config,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    MemoryPressure,
    Busy,
    Retry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Rejected by the relevance filter.
    Filtered,
    /// The namespace no longer exists.
    NotFound,
    /// The namespace is already being deleted.
    Terminating,
    Converged(LockStatus),
    /// The lock expired and the namespace was deleted.
    Deleted,
    Requeue {
        after: Duration,
        reason: RequeueReason,
    },
}

/// Runs one namespace through filter, memory check, admission, fetch and the
/// status-specific transition.
pub struct ReconcileEngine {
    ctx: Arc<Context>,
    permits: Arc<Semaphore>,
    worker: TransitionWorker,
}

impl ReconcileEngine {
    pub fn new(ctx: Arc<Context>) -> ReconcileEngine {
        let worker = TransitionWorker::new(
            ctx.cluster.clone(),
            ctx.metrics.clone(),
            WorkerSettings::from(&ctx.config),
        );
        ReconcileEngine {
            permits: Arc::new(Semaphore::new(ctx.config.workers)),
            worker,
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn worker(&self) -> &TransitionWorker {
        &self.worker
    }

    pub fn is_relevant(&self, name: &str) -> bool {
        self.ctx.filter.should_process(name)
    }

    pub fn under_pressure(&self) -> bool {
        self.ctx.pressure.resident_bytes() >= self.ctx.config.defer_bytes()
    }

    /// Takes a worker permit without waiting.
    pub fn admit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    fn requeue(&self, reason: RequeueReason) -> ReconcileOutcome {
        let config = &self.ctx.config;
        let after = match reason {
            RequeueReason::MemoryPressure => {
                Metrics::inc(&self.ctx.metrics.requeued_pressure);
                config.pressure_requeue
            }
            RequeueReason::Busy => {
                Metrics::inc(&self.ctx.metrics.requeued_busy);
                config.busy_requeue
            }
            RequeueReason::Retry => config.error_requeue,
        };
        ReconcileOutcome::Requeue { after, reason }
    }

    /// Event-path entry point for a namespace name.
    pub async fn reconcile(&self, name: &str) -> ReconcileOutcome {
        if !self.is_relevant(name) {
            Metrics::inc(&self.ctx.metrics.filtered);
            return ReconcileOutcome::Filtered;
        }
        if self.under_pressure() {
            debug!(namespace = %name, "Deferring reconcile under memory pressure");
            return self.requeue(RequeueReason::MemoryPressure);
        }
        let _permit = match self.admit() {
            Some(permit) => permit,
            None => return self.requeue(RequeueReason::Busy),
        };
        self.ctx.metrics.api_call();
        match self.ctx.cluster.get_namespace(name).await {
            Ok(None) => {
                debug!(namespace = %name, "Namespace not found, end reconcile");
                self.ctx.index.remove(name);
                ReconcileOutcome::NotFound
            }
            Ok(Some(ns)) => self.converge(&ns).await,
            Err(e) => {
                warn!(namespace = %name, "Get namespace failed with error: {}, will retry", e);
                Metrics::inc(&self.ctx.metrics.errors);
                self.requeue(RequeueReason::Retry)
            }
        }
    }

    /// Drives an already fetched namespace toward its declared status.
    /// Shared by the event path and the periodic scans.
    pub async fn converge(&self, ns: &NamespaceState) -> ReconcileOutcome {
        if ns.terminating {
            return ReconcileOutcome::Terminating;
        }
        Metrics::inc(&self.ctx.metrics.namespaces_processed);
        let status = ns.lock_status(Utc::now());
        let result = match status {
            LockStatus::PendingDeletion => return self.expire(ns).await,
            LockStatus::Locked => self.worker.lock(ns).await,
            LockStatus::Active | LockStatus::Unset | LockStatus::Unknown => {
                self.worker.unlock(ns).await
            }
        };
        self.settle(ns, status, result)
    }

    fn settle(
        &self,
        ns: &NamespaceState,
        status: LockStatus,
        result: crate::Result<TransitionReport>,
    ) -> ReconcileOutcome {
        self.ctx
            .index
            .update(self.ctx.interner.intern(&ns.name), status);
        match result {
            Ok(report) if !report.needs_retry() => ReconcileOutcome::Converged(status),
            Ok(report) => {
                debug!(
                    namespace = %ns.name,
                    conflicts = report.conflicts,
                    failures = report.failures.len(),
                    "Pass left work behind, will retry"
                );
                self.requeue(RequeueReason::Retry)
            }
            Err(e) if e.is_conflict() => {
                debug!(namespace = %ns.name, "Namespace changed during pass, will retry");
                self.requeue(RequeueReason::Retry)
            }
            Err(e) => {
                warn!(namespace = %ns.name, "Reconcile failed due to error: {}", e);
                Metrics::inc(&self.ctx.metrics.errors);
                self.requeue(RequeueReason::Retry)
            }
        }
    }

    async fn expire(&self, ns: &NamespaceState) -> ReconcileOutcome {
        match self.ctx.config.expiry_policy {
            ExpiryPolicy::Delete => {
                self.ctx.metrics.api_call();
                match self.ctx.cluster.delete_namespace(&ns.name).await {
                    Ok(()) => {
                        info!(namespace = %ns.name, "Lock expired, deleted namespace");
                        Metrics::inc(&self.ctx.metrics.namespaces_deleted);
                        self.ctx.index.remove(&ns.name);
                        ReconcileOutcome::Deleted
                    }
                    Err(e) if e.is_not_found() => {
                        self.ctx.index.remove(&ns.name);
                        ReconcileOutcome::NotFound
                    }
                    Err(e) => {
                        warn!(namespace = %ns.name, "Deleting expired namespace failed: {}", e);
                        Metrics::inc(&self.ctx.metrics.errors);
                        self.requeue(RequeueReason::Retry)
                    }
                }
            }
            ExpiryPolicy::Unlock => {
                let patch = MergePatch::guarded_by(&ns.resource_version)
                    .set_label(STATUS_LABEL, STATUS_ACTIVE)
                    .remove_annotation(LOCK_EXPIRY_ANNOTATION)
                    .remove_annotation(LOCK_REASON_ANNOTATION)
                    .remove_annotation(LOCK_OPERATOR_ANNOTATION);
                self.ctx.metrics.api_call();
                if let Err(e) = self.ctx.cluster.patch_namespace(&ns.name, &patch).await {
                    if !e.is_conflict() {
                        warn!(namespace = %ns.name, "Reverting expired lock failed: {}", e);
                        Metrics::inc(&self.ctx.metrics.errors);
                    }
                    return self.requeue(RequeueReason::Retry);
                }
                info!(namespace = %ns.name, "Lock expired, reverting to active");
                let mut reverted = ns.clone();
                reverted
                    .labels
                    .insert(STATUS_LABEL.to_string(), STATUS_ACTIVE.to_string());
                reverted.annotations.remove(LOCK_EXPIRY_ANNOTATION);
                reverted.annotations.remove(LOCK_REASON_ANNOTATION);
                reverted.annotations.remove(LOCK_OPERATOR_ANNOTATION);
                let result = self.worker.unlock(&reverted).await;
                self.settle(&reverted, LockStatus::Active, result)
            }
        }
    }
}

/// Turns "something about namespace X changed" into reconcile passes.
///
/// At most one pass per namespace runs at a time; a submission that arrives
/// while one is running marks it to run again once it finishes. Requeued
/// passes sleep for the delay the engine asked for and are not rescheduled
/// after shutdown.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<ReconcileEngine>,
    shutdown: Shutdown,
    in_flight: Arc<Mutex<HashMap<Arc<str>, bool>>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<ReconcileEngine>, shutdown: Shutdown) -> Dispatcher {
        Dispatcher {
            engine,
            shutdown,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Arc<ReconcileEngine> {
        &self.engine
    }

    /// Returns whether a task was started for the namespace.
    pub fn submit(&self, name: &str) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        if !self.engine.is_relevant(name) {
            Metrics::inc(&self.engine.context().metrics.filtered);
            return false;
        }
        let name = self.engine.context().interner.intern(name);
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(rerun) = in_flight.get_mut(&name) {
                *rerun = true;
                return false;
            }
            in_flight.insert(name.clone(), false);
        }
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.drive(name).await });
        true
    }

    /// Drops cached state for a namespace that was observed deleted.
    pub fn forget(&self, name: &str) {
        self.engine.context().index.remove(name);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn drive(&self, name: Arc<str>) -> ReconcileOutcome {
        loop {
            let outcome = self.engine.reconcile(&name).await;
            if let ReconcileOutcome::Requeue { after, .. } = outcome {
                tokio::select! {
                    _ = self.shutdown.wait() => {
                        self.in_flight.lock().remove(&name);
                        return outcome;
                    }
                    _ = tokio::time::sleep(after) => continue,
                }
            }
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(&name) {
                Some(rerun) if *rerun && !self.shutdown.is_triggered() => {
                    *rerun = false;
                }
                _ => {
                    in_flight.remove(&name);
                    return outcome;
                }
            }
        }
    }
}

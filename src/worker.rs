// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::cluster::ClusterApi;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::quota::make_deny_all_quota;
use crate::types::*;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What one lock or unlock pass changed, and what it left for a later pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionReport {
    pub workloads_changed: u32,
    pub cron_jobs_changed: u32,
    pub pods_deleted: u32,
    pub quota_changed: bool,
    pub conflicts: u32,
    pub failures: Vec<String>,
}

impl TransitionReport {
    pub fn needs_retry(&self) -> bool {
        self.conflicts > 0 || !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub default_lock_duration: Option<Duration>,
    pub quota_allow_config_objects: bool,
}

impl From<&ControllerConfig> for WorkerSettings {
    fn from(config: &ControllerConfig) -> WorkerSettings {
        WorkerSettings {
            default_lock_duration: config.default_lock_duration(),
            quota_allow_config_objects: config.quota_allow_config_objects,
        }
    }
}

/// Drives one namespace's workloads and quota to match its declared status.
///
/// Both directions are idempotent. Within a pass a failure on one workload
/// kind does not stop the others; it is recorded in the report so the caller
/// can retry later. Writes are guarded by resource version and a conflict is
/// never retried in place. The only failure that aborts a whole pass is one on
/// the namespace object itself.
pub struct TransitionWorker {
    cluster: Arc<dyn ClusterApi>,
    metrics: Arc<Metrics>,
    settings: WorkerSettings,
}

impl TransitionWorker {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        metrics: Arc<Metrics>,
        settings: WorkerSettings,
    ) -> TransitionWorker {
        TransitionWorker {
            cluster,
            metrics,
            settings,
        }
    }

    pub async fn lock(&self, ns: &NamespaceState) -> Result<TransitionReport> {
        let mut report = TransitionReport::default();
        self.ensure_lock_expiry(ns).await?;
        self.ensure_quota(&ns.name, &mut report).await;
        for kind in WorkloadKind::ALL {
            self.scale_down(&ns.name, kind, &mut report).await;
        }
        self.suspend_cron_jobs(&ns.name, &mut report).await;
        self.delete_standalone_pods(&ns.name, &mut report).await;
        if report.workloads_changed > 0 || report.cron_jobs_changed > 0 || report.pods_deleted > 0
        {
            info!(
                namespace = %ns.name,
                workloads = report.workloads_changed,
                cron_jobs = report.cron_jobs_changed,
                pods = report.pods_deleted,
                "Locked namespace"
            );
        }
        Ok(report)
    }

    pub async fn unlock(&self, ns: &NamespaceState) -> Result<TransitionReport> {
        let mut report = TransitionReport::default();
        self.remove_quota(&ns.name, &mut report).await;
        for kind in WorkloadKind::ALL {
            self.restore(&ns.name, kind, &mut report).await;
        }
        self.resume_cron_jobs(&ns.name, &mut report).await;
        self.clear_lock_annotations(ns).await?;
        if report.workloads_changed > 0 || report.cron_jobs_changed > 0 || report.quota_changed {
            info!(
                namespace = %ns.name,
                workloads = report.workloads_changed,
                cron_jobs = report.cron_jobs_changed,
                "Unlocked namespace"
            );
        }
        Ok(report)
    }

    fn record_failure(&self, report: &mut TransitionReport, what: String, err: Error) {
        if err.is_conflict() {
            debug!("{} changed concurrently, leaving it to the next pass", what);
            Metrics::inc(&self.metrics.conflicts);
            report.conflicts += 1;
        } else {
            warn!("{} failed: {}", what, err);
            Metrics::inc(&self.metrics.errors);
            report.failures.push(format!("{}: {}", what, err));
        }
    }

    // The expiry is written once; an existing value, even a malformed one, is never recomputed.
    async fn ensure_lock_expiry(&self, ns: &NamespaceState) -> Result<()> {
        if ns.has_expiry_annotation() {
            return Ok(());
        }
        let duration = match self.settings.default_lock_duration {
            Some(d) => d,
            None => return Ok(()),
        };
        let expiry = lock_expiry_after(duration)?;
        let patch =
            MergePatch::guarded_by(&ns.resource_version).set_annotation(LOCK_EXPIRY_ANNOTATION, expiry);
        self.metrics.api_call();
        self.cluster.patch_namespace(&ns.name, &patch).await.map_err(|e| {
            if e.is_conflict() {
                Metrics::inc(&self.metrics.conflicts);
            }
            e
        })?;
        info!(namespace = %ns.name, "Set default lock expiry");
        Ok(())
    }

    async fn ensure_quota(&self, namespace: &str, report: &mut TransitionReport) {
        let quota = make_deny_all_quota(namespace, self.settings.quota_allow_config_objects);
        self.metrics.api_call();
        match self.cluster.create_quota(namespace, &quota).await {
            Ok(()) => {
                info!(namespace = %namespace, "Created deny-all quota");
                report.quota_changed = true;
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => self.record_failure(report, format!("Create quota in {}", namespace), e),
        }
    }

    async fn remove_quota(&self, namespace: &str, report: &mut TransitionReport) {
        self.metrics.api_call();
        match self.cluster.delete_quota(namespace, DENY_ALL_QUOTA_NAME).await {
            Ok(()) => {
                info!(namespace = %namespace, "Deleted deny-all quota");
                report.quota_changed = true;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => self.record_failure(report, format!("Delete quota in {}", namespace), e),
        }
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        report: &mut TransitionReport,
    ) -> Option<Vec<Workload>> {
        self.metrics.api_call();
        match self.cluster.list_workloads(namespace, kind).await {
            Ok(workloads) => Some(workloads),
            Err(e) => {
                self.record_failure(report, format!("List {} in {}", kind, namespace), e);
                None
            }
        }
    }

    async fn scale_down(&self, namespace: &str, kind: WorkloadKind, report: &mut TransitionReport) {
        let workloads = match self.list_workloads(namespace, kind, report).await {
            Some(workloads) => workloads,
            None => return,
        };
        for workload in workloads {
            // A replica set owned by a deployment follows its owner's scale.
            if workload.replicas <= 0 || workload.controlled {
                continue;
            }
            let mut patch = MergePatch::guarded_by(&workload.resource_version)
                .with_spec(json!({ "replicas": 0 }));
            // Keep an earlier saved count: it is the pre-lock value.
            if workload.original_replicas().is_none() {
                patch = patch
                    .set_annotation(ORIGINAL_REPLICAS_ANNOTATION, workload.replicas.to_string());
            }
            self.metrics.api_call();
            match self
                .cluster
                .patch_workload(namespace, kind, &workload.name, &patch)
                .await
            {
                Ok(()) => {
                    debug!(
                        namespace = %namespace,
                        kind = %kind,
                        name = %workload.name,
                        replicas = workload.replicas,
                        "Scaled workload to zero"
                    );
                    Metrics::inc(&self.metrics.workloads_scaled);
                    report.workloads_changed += 1;
                }
                Err(e) => self.record_failure(
                    report,
                    format!("Scale down {}/{}/{}", kind, namespace, workload.name),
                    e,
                ),
            }
        }
    }

    async fn restore(&self, namespace: &str, kind: WorkloadKind, report: &mut TransitionReport) {
        let workloads = match self.list_workloads(namespace, kind, report).await {
            Some(workloads) => workloads,
            None => return,
        };
        for workload in workloads {
            let raw = match workload.original_replicas() {
                Some(raw) => raw,
                None => continue,
            };
            let patch = match raw.trim().parse::<i32>() {
                Ok(replicas) if replicas >= 0 => MergePatch::guarded_by(&workload.resource_version)
                    .with_spec(json!({ "replicas": replicas }))
                    .remove_annotation(ORIGINAL_REPLICAS_ANNOTATION),
                _ => {
                    // Nothing trustworthy to restore; drop the marker and leave the scale alone.
                    warn!(
                        namespace = %namespace,
                        kind = %kind,
                        name = %workload.name,
                        value = %raw,
                        "Discarding unparsable original replica annotation"
                    );
                    MergePatch::guarded_by(&workload.resource_version)
                        .remove_annotation(ORIGINAL_REPLICAS_ANNOTATION)
                }
            };
            self.metrics.api_call();
            match self
                .cluster
                .patch_workload(namespace, kind, &workload.name, &patch)
                .await
            {
                Ok(()) => {
                    debug!(
                        namespace = %namespace,
                        kind = %kind,
                        name = %workload.name,
                        "Restored workload replicas"
                    );
                    Metrics::inc(&self.metrics.workloads_restored);
                    report.workloads_changed += 1;
                }
                Err(e) => self.record_failure(
                    report,
                    format!("Restore {}/{}/{}", kind, namespace, workload.name),
                    e,
                ),
            }
        }
    }

    async fn list_cron_jobs(
        &self,
        namespace: &str,
        report: &mut TransitionReport,
    ) -> Option<Vec<CronJobState>> {
        self.metrics.api_call();
        match self.cluster.list_cron_jobs(namespace).await {
            Ok(cron_jobs) => Some(cron_jobs),
            Err(e) => {
                self.record_failure(report, format!("List CronJob in {}", namespace), e);
                None
            }
        }
    }

    async fn suspend_cron_jobs(&self, namespace: &str, report: &mut TransitionReport) {
        let cron_jobs = match self.list_cron_jobs(namespace, report).await {
            Some(cron_jobs) => cron_jobs,
            None => return,
        };
        for cron_job in cron_jobs.into_iter().filter(|cj| !cj.suspended) {
            let mut patch = MergePatch::guarded_by(&cron_job.resource_version)
                .with_spec(json!({ "suspend": true }));
            if cron_job.original_suspend().is_none() {
                patch = patch.set_annotation(ORIGINAL_SUSPEND_ANNOTATION, "false");
            }
            self.metrics.api_call();
            match self
                .cluster
                .patch_cron_job(namespace, &cron_job.name, &patch)
                .await
            {
                Ok(()) => {
                    Metrics::inc(&self.metrics.cron_jobs_suspended);
                    report.cron_jobs_changed += 1;
                }
                Err(e) => self.record_failure(
                    report,
                    format!("Suspend CronJob/{}/{}", namespace, cron_job.name),
                    e,
                ),
            }
        }
    }

    async fn resume_cron_jobs(&self, namespace: &str, report: &mut TransitionReport) {
        let cron_jobs = match self.list_cron_jobs(namespace, report).await {
            Some(cron_jobs) => cron_jobs,
            None => return,
        };
        for cron_job in cron_jobs {
            let raw = match cron_job.original_suspend() {
                Some(raw) => raw,
                None => continue,
            };
            let mut patch = MergePatch::guarded_by(&cron_job.resource_version)
                .remove_annotation(ORIGINAL_SUSPEND_ANNOTATION);
            match raw.trim().parse::<bool>() {
                Ok(suspend) => patch = patch.with_spec(json!({ "suspend": suspend })),
                Err(_) => warn!(
                    namespace = %namespace,
                    name = %cron_job.name,
                    value = %raw,
                    "Discarding unparsable original suspend annotation"
                ),
            }
            self.metrics.api_call();
            match self
                .cluster
                .patch_cron_job(namespace, &cron_job.name, &patch)
                .await
            {
                Ok(()) => {
                    Metrics::inc(&self.metrics.cron_jobs_resumed);
                    report.cron_jobs_changed += 1;
                }
                Err(e) => self.record_failure(
                    report,
                    format!("Resume CronJob/{}/{}", namespace, cron_job.name),
                    e,
                ),
            }
        }
    }

    async fn delete_standalone_pods(&self, namespace: &str, report: &mut TransitionReport) {
        self.metrics.api_call();
        let pods = match self.cluster.list_pods(namespace).await {
            Ok(pods) => pods,
            Err(e) => {
                self.record_failure(report, format!("List Pod in {}", namespace), e);
                return;
            }
        };
        for pod in pods.into_iter().filter(PodState::is_standalone) {
            self.metrics.api_call();
            match self.cluster.delete_pod(namespace, &pod.name).await {
                Ok(()) => {
                    info!(namespace = %namespace, pod = %pod.name, "Deleted standalone pod");
                    Metrics::inc(&self.metrics.pods_deleted);
                    report.pods_deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => self.record_failure(
                    report,
                    format!("Delete Pod/{}/{}", namespace, pod.name),
                    e,
                ),
            }
        }
    }

    async fn clear_lock_annotations(&self, ns: &NamespaceState) -> Result<()> {
        if !ns.has_lock_annotations() {
            return Ok(());
        }
        let patch = MergePatch::guarded_by(&ns.resource_version)
            .remove_annotation(LOCK_EXPIRY_ANNOTATION)
            .remove_annotation(LOCK_REASON_ANNOTATION)
            .remove_annotation(LOCK_OPERATOR_ANNOTATION);
        self.metrics.api_call();
        self.cluster.patch_namespace(&ns.name, &patch).await.map_err(|e| {
            if e.is_conflict() {
                Metrics::inc(&self.metrics.conflicts);
            }
            e
        })
    }
}

/// RFC3339 timestamp `duration` from now.
pub fn lock_expiry_after(duration: Duration) -> Result<String> {
    let duration = chrono::Duration::from_std(duration)
        .map_err(|e| Error::InvalidConfig(format!("lock duration out of range: {}", e)))?;
    let expiry = Utc::now()
        .checked_add_signed(duration)
        .ok_or_else(|| Error::InvalidConfig("lock duration out of range".to_string()))?;
    Ok(expiry.to_rfc3339_opts(SecondsFormat::Secs, true))
}

// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod kube_api;

#[cfg(test)]
pub mod in_memory;

use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ResourceQuota;

pub use kube_api::KubeCluster;

/// Every cluster call the reconciler makes goes through this trait.
///
/// Writes are merge patches guarded by `metadata.resourceVersion`; a stale
/// resource version must surface as [`crate::Error::Conflict`]. Missing objects
/// surface as [`crate::Error::NotFound`] and duplicate creates as
/// [`crate::Error::AlreadyExists`], so callers can decide which of those mean
/// "already converged".
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceState>>;

    async fn list_namespaces(
        &self,
        label_selector: Option<&str>,
        limit: u32,
        continue_token: Option<String>,
    ) -> Result<NamespacePage>;

    async fn patch_namespace(&self, name: &str, patch: &MergePatch) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn create_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<()>;

    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<()>;

    async fn quota_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn list_workloads(&self, namespace: &str, kind: WorkloadKind) -> Result<Vec<Workload>>;

    async fn patch_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        patch: &MergePatch,
    ) -> Result<()>;

    async fn list_cron_jobs(&self, namespace: &str) -> Result<Vec<CronJobState>>;

    async fn patch_cron_job(&self, namespace: &str, name: &str, patch: &MergePatch) -> Result<()>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodState>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_lock_requests(&self) -> Result<Vec<LockRequest>>;

    async fn patch_lock_request_status(&self, name: &str, status: &LockRequestStatus)
        -> Result<()>;
}

/// Walks every page of a namespace listing, handing each page to `visit`.
/// A listing failure aborts the walk; pages already visited stay visited.
pub async fn for_each_namespace_page<F>(
    cluster: &dyn ClusterApi,
    label_selector: Option<&str>,
    limit: u32,
    mut visit: F,
) -> Result<usize>
where
    F: FnMut(Vec<NamespaceState>),
{
    let mut continue_token = None;
    let mut seen = 0;
    loop {
        let page = cluster
            .list_namespaces(label_selector, limit, continue_token.take())
            .await?;
        seen += page.items.len();
        visit(page.items);
        match page.continue_token {
            Some(token) if !token.is_empty() => continue_token = Some(token),
            _ => return Ok(seen),
        }
    }
}

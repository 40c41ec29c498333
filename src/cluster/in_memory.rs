// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::types::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ResourceQuota;
use kube_core::ErrorResponse;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

// An in-process API server for tests. Every write bumps a global resource
// version counter and stale resource versions are rejected with Conflict, the
// same admission rule the real API server applies to guarded updates.
#[derive(Default)]
struct Store {
    resource_version_counter: u64,
    namespaces: BTreeMap<String, NamespaceState>,
    quotas: BTreeMap<(String, String), ResourceQuota>,
    workloads: BTreeMap<(String, WorkloadKind, String), Workload>,
    cron_jobs: BTreeMap<(String, String), CronJobState>,
    pods: BTreeMap<(String, String), PodState>,
    lock_requests: BTreeMap<String, LockRequest>,
    conflict_once: HashSet<String>,
    failing_lists: HashSet<String>,
    calls: u64,
}

impl Store {
    fn next_version(&mut self) -> String {
        self.resource_version_counter += 1;
        self.resource_version_counter.to_string()
    }
}

#[derive(Default)]
pub struct InMemoryCluster {
    store: Mutex<Store>,
}

fn check_version(key: &str, current: &str, patch: &MergePatch) -> Result<()> {
    if !patch.resource_version.is_empty() && patch.resource_version != current {
        return Err(Error::Conflict(key.to_string()));
    }
    Ok(())
}

fn selector_matches(selector: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
    let selector = match selector {
        Some(s) if !s.is_empty() => s,
        _ => return true,
    };
    selector.split(',').all(|term| match term.split_once('=') {
        Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
        None => labels.contains_key(term.trim()),
    })
}

impl InMemoryCluster {
    pub fn new() -> InMemoryCluster {
        InMemoryCluster::default()
    }

    pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) {
        let mut store = self.store.lock();
        let resource_version = store.next_version();
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        store.namespaces.insert(
            name.to_string(),
            NamespaceState {
                name: name.to_string(),
                resource_version,
                labels: to_map(labels),
                annotations: to_map(annotations),
                terminating: false,
            },
        );
    }

    pub fn add_workload(&self, namespace: &str, kind: WorkloadKind, name: &str, replicas: i32) {
        self.insert_workload(namespace, kind, name, replicas, false);
    }

    pub fn add_controlled_replica_set(&self, namespace: &str, name: &str, replicas: i32) {
        self.insert_workload(namespace, WorkloadKind::ReplicaSet, name, replicas, true);
    }

    fn insert_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        replicas: i32,
        controlled: bool,
    ) {
        let mut store = self.store.lock();
        let resource_version = store.next_version();
        store.workloads.insert(
            (namespace.to_string(), kind, name.to_string()),
            Workload {
                kind,
                name: name.to_string(),
                resource_version,
                replicas,
                annotations: BTreeMap::new(),
                controlled,
            },
        );
    }

    pub fn add_cron_job(&self, namespace: &str, name: &str, suspended: bool) {
        let mut store = self.store.lock();
        let resource_version = store.next_version();
        store.cron_jobs.insert(
            (namespace.to_string(), name.to_string()),
            CronJobState {
                name: name.to_string(),
                resource_version,
                suspended,
                annotations: BTreeMap::new(),
            },
        );
    }

    pub fn add_pod(&self, namespace: &str, name: &str, owner_kinds: &[&str]) {
        let mut store = self.store.lock();
        store.pods.insert(
            (namespace.to_string(), name.to_string()),
            PodState {
                name: name.to_string(),
                owner_kinds: owner_kinds.iter().map(|k| k.to_string()).collect(),
            },
        );
    }

    pub fn add_lock_request(&self, name: &str, spec: LockRequestSpec) {
        let mut store = self.store.lock();
        store
            .lock_requests
            .insert(name.to_string(), LockRequest::new(name, spec));
    }

    /// Simulates a concurrent writer touching the namespace.
    pub fn touch_namespace(&self, name: &str) {
        let mut store = self.store.lock();
        let resource_version = store.next_version();
        if let Some(ns) = store.namespaces.get_mut(name) {
            ns.resource_version = resource_version;
        }
    }

    pub fn mark_terminating(&self, name: &str) {
        if let Some(ns) = self.store.lock().namespaces.get_mut(name) {
            ns.terminating = true;
        }
    }

    /// Makes the next write to `key` (e.g. `Deployment/ns-1/web` or `Namespace/ns-1`) fail with Conflict.
    pub fn conflict_next_write(&self, key: &str) {
        self.store.lock().conflict_once.insert(key.to_string());
    }

    /// Makes every list of `what` (e.g. `Namespace`, `Deployment`, `Pod`) fail.
    pub fn fail_lists_of(&self, what: &str) {
        self.store.lock().failing_lists.insert(what.to_string());
    }

    pub fn heal_lists(&self) {
        self.store.lock().failing_lists.clear();
    }

    pub fn namespace(&self, name: &str) -> Option<NamespaceState> {
        self.store.lock().namespaces.get(name).cloned()
    }

    pub fn workload(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Option<Workload> {
        self.store
            .lock()
            .workloads
            .get(&(namespace.to_string(), kind, name.to_string()))
            .cloned()
    }

    pub fn cron_job(&self, namespace: &str, name: &str) -> Option<CronJobState> {
        self.store
            .lock()
            .cron_jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        self.store
            .lock()
            .pods
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn quota(&self, namespace: &str, name: &str) -> Option<ResourceQuota> {
        self.store
            .lock()
            .quotas
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn quota_count(&self, namespace: &str) -> usize {
        self.store
            .lock()
            .quotas
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    pub fn lock_request(&self, name: &str) -> Option<LockRequest> {
        self.store.lock().lock_requests.get(name).cloned()
    }

    pub fn calls(&self) -> u64 {
        self.store.lock().calls
    }

    fn enter(&self, list_of: Option<&str>) -> Result<parking_lot::MutexGuard<'_, Store>> {
        let mut store = self.store.lock();
        store.calls += 1;
        if let Some(what) = list_of {
            if store.failing_lists.contains(what) {
                return Err(Error::from_kube(
                    format!("{} list", what),
                    kube::Error::Api(ErrorResponse {
                        status: "Failure".to_string(),
                        message: "injected list failure".to_string(),
                        reason: "InternalError".to_string(),
                        code: 500,
                    }),
                ));
            }
        }
        Ok(store)
    }
}

fn take_conflict(store: &mut Store, key: &str) -> Result<()> {
    if store.conflict_once.remove(key) {
        return Err(Error::Conflict(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceState>> {
        let store = self.enter(None)?;
        Ok(store.namespaces.get(name).cloned())
    }

    async fn list_namespaces(
        &self,
        label_selector: Option<&str>,
        limit: u32,
        continue_token: Option<String>,
    ) -> Result<NamespacePage> {
        let store = self.enter(Some("Namespace"))?;
        let limit = if limit == 0 { usize::MAX } else { limit as usize };
        let mut items = Vec::new();
        let mut last = None;
        let mut more = false;
        for (name, ns) in store.namespaces.iter() {
            if let Some(token) = &continue_token {
                if name <= token {
                    continue;
                }
            }
            if !selector_matches(label_selector, &ns.labels) {
                continue;
            }
            if items.len() == limit {
                more = true;
                break;
            }
            last = Some(name.clone());
            items.push(ns.clone());
        }
        Ok(NamespacePage {
            items,
            continue_token: if more { last } else { None },
        })
    }

    async fn patch_namespace(&self, name: &str, patch: &MergePatch) -> Result<()> {
        let mut store = self.enter(None)?;
        let key = format!("Namespace/{}", name);
        take_conflict(&mut store, &key)?;
        let resource_version = store.next_version();
        let ns = store
            .namespaces
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        check_version(&key, &ns.resource_version, patch)?;
        apply_map_patch(&mut ns.labels, &patch.labels);
        apply_map_patch(&mut ns.annotations, &patch.annotations);
        ns.resource_version = resource_version;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut store = self.enter(None)?;
        if store.namespaces.remove(name).is_none() {
            return Err(Error::NotFound(format!("Namespace/{}", name)));
        }
        store.quotas.retain(|(ns, _), _| ns != name);
        store.workloads.retain(|(ns, _, _), _| ns != name);
        store.cron_jobs.retain(|(ns, _), _| ns != name);
        store.pods.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn create_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<()> {
        let mut store = self.enter(None)?;
        let name = quota
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let key = (namespace.to_string(), name.clone());
        if store.quotas.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "ResourceQuota/{}/{}",
                namespace, name
            )));
        }
        store.quotas.insert(key, quota.clone());
        Ok(())
    }

    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<()> {
        let mut store = self.enter(None)?;
        match store.quotas.remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("ResourceQuota/{}/{}", namespace, name))),
        }
    }

    async fn quota_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let store = self.enter(None)?;
        Ok(store
            .quotas
            .contains_key(&(namespace.to_string(), name.to_string())))
    }

    async fn list_workloads(&self, namespace: &str, kind: WorkloadKind) -> Result<Vec<Workload>> {
        let store = self.enter(Some(kind.to_string().as_str()))?;
        Ok(store
            .workloads
            .iter()
            .filter(|((ns, k, _), _)| ns == namespace && *k == kind)
            .map(|(_, w)| w.clone())
            .collect())
    }

    async fn patch_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        patch: &MergePatch,
    ) -> Result<()> {
        let mut store = self.enter(None)?;
        let key = format!("{}/{}/{}", kind, namespace, name);
        take_conflict(&mut store, &key)?;
        let resource_version = store.next_version();
        let workload = store
            .workloads
            .get_mut(&(namespace.to_string(), kind, name.to_string()))
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        check_version(&key, &workload.resource_version, patch)?;
        apply_map_patch(&mut workload.annotations, &patch.annotations);
        if let Some(replicas) = patch
            .spec
            .as_ref()
            .and_then(|spec| spec.get("replicas"))
            .and_then(|r| r.as_i64())
        {
            workload.replicas = replicas as i32;
        }
        workload.resource_version = resource_version;
        Ok(())
    }

    async fn list_cron_jobs(&self, namespace: &str) -> Result<Vec<CronJobState>> {
        let store = self.enter(Some("CronJob"))?;
        Ok(store
            .cron_jobs
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, cj)| cj.clone())
            .collect())
    }

    async fn patch_cron_job(&self, namespace: &str, name: &str, patch: &MergePatch) -> Result<()> {
        let mut store = self.enter(None)?;
        let key = format!("CronJob/{}/{}", namespace, name);
        take_conflict(&mut store, &key)?;
        let resource_version = store.next_version();
        let cron_job = store
            .cron_jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        check_version(&key, &cron_job.resource_version, patch)?;
        apply_map_patch(&mut cron_job.annotations, &patch.annotations);
        if let Some(suspend) = patch
            .spec
            .as_ref()
            .and_then(|spec| spec.get("suspend"))
            .and_then(|s| s.as_bool())
        {
            cron_job.suspended = suspend;
        }
        cron_job.resource_version = resource_version;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodState>> {
        let store = self.enter(Some("Pod"))?;
        Ok(store
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut store = self.enter(None)?;
        match store.pods.remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("Pod/{}/{}", namespace, name))),
        }
    }

    async fn list_lock_requests(&self) -> Result<Vec<LockRequest>> {
        let store = self.enter(Some("LockRequest"))?;
        Ok(store.lock_requests.values().cloned().collect())
    }

    async fn patch_lock_request_status(
        &self,
        name: &str,
        status: &LockRequestStatus,
    ) -> Result<()> {
        let mut store = self.enter(None)?;
        let request = store
            .lock_requests
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("LockRequest/{}", name)))?;
        request.status = Some(status.clone());
        Ok(())
    }
}

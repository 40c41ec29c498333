// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::types::*;
use async_trait::async_trait;
use core::fmt::Debug;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Pod, ReplicationController, ResourceQuota};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, Resource,
};
use kube_core::NamespaceResourceScope;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// [`ClusterApi`] backed by a live API server through kube-rs.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> KubeCluster {
        KubeCluster { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::<K>::namespaced(self.client.clone(), namespace)
    }

    async fn list_in<K>(&self, namespace: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let list = self
            .namespaced::<K>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(format!("{}/{}", kind, namespace), e))?;
        Ok(list.items)
    }

    async fn merge_patch_in<K>(&self, namespace: &str, name: &str, patch: &MergePatch) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let key = format!("{}/{}/{}", kind, namespace, name);
        debug!("Patch {} with {}", key, patch.to_json());
        self.namespaced::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch.to_json()))
            .await
            .map_err(|e| Error::from_kube(key, e))?;
        Ok(())
    }

    async fn delete_in<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(format!("{}/{}/{}", kind, namespace, name), e))?;
        Ok(())
    }
}

fn owned_map(map: &Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.clone().unwrap_or_default()
}

fn name_and_version(meta: &ObjectMeta) -> (String, String) {
    (
        meta.name.clone().unwrap_or_default(),
        meta.resource_version.clone().unwrap_or_default(),
    )
}

fn has_controller_owner(meta: &ObjectMeta) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.controller == Some(true)))
        .unwrap_or(false)
}

// The API server defaults an unset replica count to 1.
fn workload_from_meta(kind: WorkloadKind, meta: &ObjectMeta, replicas: Option<i32>) -> Workload {
    let (name, resource_version) = name_and_version(meta);
    Workload {
        kind,
        name,
        resource_version,
        replicas: replicas.unwrap_or(1),
        annotations: owned_map(&meta.annotations),
        controlled: has_controller_owner(meta),
    }
}

impl From<&Namespace> for NamespaceState {
    fn from(ns: &Namespace) -> NamespaceState {
        let (name, resource_version) = name_and_version(&ns.metadata);
        NamespaceState {
            name,
            resource_version,
            labels: owned_map(&ns.metadata.labels),
            annotations: owned_map(&ns.metadata.annotations),
            terminating: ns.metadata.deletion_timestamp.is_some(),
        }
    }
}

impl From<&Deployment> for Workload {
    fn from(d: &Deployment) -> Workload {
        let replicas = d.spec.as_ref().and_then(|s| s.replicas);
        workload_from_meta(WorkloadKind::Deployment, &d.metadata, replicas)
    }
}

impl From<&StatefulSet> for Workload {
    fn from(sts: &StatefulSet) -> Workload {
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas);
        workload_from_meta(WorkloadKind::StatefulSet, &sts.metadata, replicas)
    }
}

impl From<&ReplicaSet> for Workload {
    fn from(rs: &ReplicaSet) -> Workload {
        let replicas = rs.spec.as_ref().and_then(|s| s.replicas);
        workload_from_meta(WorkloadKind::ReplicaSet, &rs.metadata, replicas)
    }
}

impl From<&ReplicationController> for Workload {
    fn from(rc: &ReplicationController) -> Workload {
        let replicas = rc.spec.as_ref().and_then(|s| s.replicas);
        workload_from_meta(WorkloadKind::ReplicationController, &rc.metadata, replicas)
    }
}

impl From<&CronJob> for CronJobState {
    fn from(cj: &CronJob) -> CronJobState {
        let (name, resource_version) = name_and_version(&cj.metadata);
        CronJobState {
            name,
            resource_version,
            suspended: cj.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false),
            annotations: owned_map(&cj.metadata.annotations),
        }
    }
}

impl From<&Pod> for PodState {
    fn from(pod: &Pod) -> PodState {
        PodState {
            name: pod.metadata.name.clone().unwrap_or_default(),
            owner_kinds: pod
                .metadata
                .owner_references
                .as_ref()
                .map(|refs| refs.iter().map(|r| r.kind.clone()).collect())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceState>> {
        let api = Api::<Namespace>::all(self.client.clone());
        let ns = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(format!("Namespace/{}", name), e))?;
        Ok(ns.as_ref().map(NamespaceState::from))
    }

    async fn list_namespaces(
        &self,
        label_selector: Option<&str>,
        limit: u32,
        continue_token: Option<String>,
    ) -> Result<NamespacePage> {
        let api = Api::<Namespace>::all(self.client.clone());
        let mut lp = ListParams::default().limit(limit);
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        lp.continue_token = continue_token;
        let list = api
            .list(&lp)
            .await
            .map_err(|e| Error::from_kube("Namespace list", e))?;
        Ok(NamespacePage {
            items: list.items.iter().map(NamespaceState::from).collect(),
            continue_token: list.metadata.continue_,
        })
    }

    async fn patch_namespace(&self, name: &str, patch: &MergePatch) -> Result<()> {
        let api = Api::<Namespace>::all(self.client.clone());
        debug!("Patch Namespace/{} with {}", name, patch.to_json());
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch.to_json()))
            .await
            .map_err(|e| Error::from_kube(format!("Namespace/{}", name), e))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api = Api::<Namespace>::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(format!("Namespace/{}", name), e))?;
        Ok(())
    }

    async fn create_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<()> {
        let name = quota
            .metadata
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        self.namespaced::<ResourceQuota>(namespace)
            .create(&PostParams::default(), quota)
            .await
            .map_err(|e| Error::from_kube(format!("ResourceQuota/{}/{}", namespace, name), e))?;
        Ok(())
    }

    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_in::<ResourceQuota>(namespace, name).await
    }

    async fn quota_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let quota = self
            .namespaced::<ResourceQuota>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(format!("ResourceQuota/{}/{}", namespace, name), e))?;
        Ok(quota.is_some())
    }

    async fn list_workloads(&self, namespace: &str, kind: WorkloadKind) -> Result<Vec<Workload>> {
        let workloads = match kind {
            WorkloadKind::Deployment => self
                .list_in::<Deployment>(namespace)
                .await?
                .iter()
                .map(Workload::from)
                .collect(),
            WorkloadKind::StatefulSet => self
                .list_in::<StatefulSet>(namespace)
                .await?
                .iter()
                .map(Workload::from)
                .collect(),
            WorkloadKind::ReplicaSet => self
                .list_in::<ReplicaSet>(namespace)
                .await?
                .iter()
                .map(Workload::from)
                .collect(),
            WorkloadKind::ReplicationController => self
                .list_in::<ReplicationController>(namespace)
                .await?
                .iter()
                .map(Workload::from)
                .collect(),
        };
        Ok(workloads)
    }

    async fn patch_workload(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        patch: &MergePatch,
    ) -> Result<()> {
        match kind {
            WorkloadKind::Deployment => {
                self.merge_patch_in::<Deployment>(namespace, name, patch).await
            }
            WorkloadKind::StatefulSet => {
                self.merge_patch_in::<StatefulSet>(namespace, name, patch).await
            }
            WorkloadKind::ReplicaSet => {
                self.merge_patch_in::<ReplicaSet>(namespace, name, patch).await
            }
            WorkloadKind::ReplicationController => {
                self.merge_patch_in::<ReplicationController>(namespace, name, patch)
                    .await
            }
        }
    }

    async fn list_cron_jobs(&self, namespace: &str) -> Result<Vec<CronJobState>> {
        Ok(self
            .list_in::<CronJob>(namespace)
            .await?
            .iter()
            .map(CronJobState::from)
            .collect())
    }

    async fn patch_cron_job(&self, namespace: &str, name: &str, patch: &MergePatch) -> Result<()> {
        self.merge_patch_in::<CronJob>(namespace, name, patch).await
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodState>> {
        Ok(self
            .list_in::<Pod>(namespace)
            .await?
            .iter()
            .map(PodState::from)
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_in::<Pod>(namespace, name).await
    }

    async fn list_lock_requests(&self) -> Result<Vec<LockRequest>> {
        let api = Api::<LockRequest>::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube("LockRequest list", e))?;
        Ok(list.items)
    }

    async fn patch_lock_request_status(
        &self,
        name: &str,
        status: &LockRequestStatus,
    ) -> Result<()> {
        let api = Api::<LockRequest>::all(self.client.clone());
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(format!("LockRequest/{}", name), e))?;
        Ok(())
    }
}

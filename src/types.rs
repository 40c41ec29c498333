// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

pub const STATUS_LABEL: &str = "nslock.dev/status";
pub const LOCK_EXPIRY_ANNOTATION: &str = "nslock.dev/lock-expiry";
pub const LOCK_REASON_ANNOTATION: &str = "nslock.dev/lock-reason";
pub const LOCK_OPERATOR_ANNOTATION: &str = "nslock.dev/lock-operator";
pub const ORIGINAL_REPLICAS_ANNOTATION: &str = "nslock.dev/original-replicas";
pub const ORIGINAL_SUSPEND_ANNOTATION: &str = "nslock.dev/original-suspend";

pub const DENY_ALL_QUOTA_NAME: &str = "nslock-deny-all";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "nslock";

pub const STATUS_LOCKED: &str = "locked";
pub const STATUS_ACTIVE: &str = "active";

/// Owner kinds whose pods are removed by scaling their controller down.
/// Pods owned by anything else are deleted directly when a namespace locks.
pub const SCALABLE_POD_OWNERS: [&str; 4] = [
    "ReplicaSet",
    "StatefulSet",
    "ReplicationController",
    "Job",
];

/// Lock status of a namespace as derived from its status label and expiry annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LockStatus {
    Unset = 0,
    Active = 1,
    Locked = 2,
    PendingDeletion = 3,
    Unknown = 4,
}

impl LockStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> LockStatus {
        match code {
            0 => LockStatus::Unset,
            1 => LockStatus::Active,
            2 => LockStatus::Locked,
            3 => LockStatus::PendingDeletion,
            _ => LockStatus::Unknown,
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockStatus::Unset => "unset",
            LockStatus::Active => "active",
            LockStatus::Locked => "locked",
            LockStatus::PendingDeletion => "pending-deletion",
            LockStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum LockAction {
    #[serde(rename = "locked")]
    Lock,
    #[serde(rename = "active")]
    Unlock,
}

impl LockAction {
    pub fn label_value(self) -> &'static str {
        match self {
            LockAction::Lock => STATUS_LOCKED,
            LockAction::Unlock => STATUS_ACTIVE,
        }
    }
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "nslock.dev", version = "v1", kind = "LockRequest")]
#[kube(shortname = "lr", status = "LockRequestStatus")]
pub struct LockRequestSpec {
    #[serde(rename = "namespaceNames")]
    pub namespace_names: Vec<String>,
    pub action: LockAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(
        rename = "durationSeconds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LockRequestStatus {
    #[serde(default)]
    pub conditions: Vec<LockRequestCondition>,
    #[serde(rename = "observedTargets", default)]
    pub observed_targets: u32,
    #[serde(rename = "convergedTargets", default)]
    pub converged_targets: u32,
    #[serde(rename = "missingTargets", default)]
    pub missing_targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LockRequestCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// The parts of a Namespace object the reconciler reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceState {
    pub name: String,
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub terminating: bool,
}

impl NamespaceState {
    pub fn status_label(&self) -> Option<&str> {
        self.labels.get(STATUS_LABEL).map(String::as_str)
    }

    /// Label-derived status, without looking at the expiry.
    pub fn declared_status(&self) -> LockStatus {
        match self.status_label() {
            None => LockStatus::Unset,
            Some(STATUS_ACTIVE) => LockStatus::Active,
            Some(STATUS_LOCKED) => LockStatus::Locked,
            Some(_) => LockStatus::Unknown,
        }
    }

    /// Status at `now`: a locked namespace whose expiry has passed is pending deletion.
    pub fn lock_status(&self, now: DateTime<Utc>) -> LockStatus {
        match self.declared_status() {
            LockStatus::Locked => match self.lock_expiry() {
                Some(expiry) if expiry <= now => LockStatus::PendingDeletion,
                _ => LockStatus::Locked,
            },
            other => other,
        }
    }

    pub fn has_expiry_annotation(&self) -> bool {
        self.annotations.contains_key(LOCK_EXPIRY_ANNOTATION)
    }

    /// Parsed lock expiry. A malformed timestamp counts as no expiry.
    pub fn lock_expiry(&self) -> Option<DateTime<Utc>> {
        let raw = self.annotations.get(LOCK_EXPIRY_ANNOTATION)?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(
                    namespace = %self.name,
                    value = %raw,
                    "Ignoring malformed lock expiry annotation: {}", e
                );
                None
            }
        }
    }

    /// Whether the namespace carries anything that makes it worth watching.
    pub fn carries_lock_markers(&self) -> bool {
        self.labels.contains_key(STATUS_LABEL) || self.has_expiry_annotation()
    }

    pub fn has_lock_annotations(&self) -> bool {
        self.annotations.contains_key(LOCK_EXPIRY_ANNOTATION)
            || self.annotations.contains_key(LOCK_REASON_ANNOTATION)
            || self.annotations.contains_key(LOCK_OPERATOR_ANNOTATION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    ReplicationController,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 4] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::ReplicaSet,
        WorkloadKind::ReplicationController,
    ];
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A scalable workload controller reduced to what lock/unlock touches.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub name: String,
    pub resource_version: String,
    pub replicas: i32,
    pub annotations: BTreeMap<String, String>,
    /// Set when another controller (e.g. a Deployment) owns this object.
    pub controlled: bool,
}

impl Workload {
    pub fn original_replicas(&self) -> Option<&String> {
        self.annotations.get(ORIGINAL_REPLICAS_ANNOTATION)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CronJobState {
    pub name: String,
    pub resource_version: String,
    pub suspended: bool,
    pub annotations: BTreeMap<String, String>,
}

impl CronJobState {
    pub fn original_suspend(&self) -> Option<&String> {
        self.annotations.get(ORIGINAL_SUSPEND_ANNOTATION)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodState {
    pub name: String,
    pub owner_kinds: Vec<String>,
}

impl PodState {
    /// A pod no scaling controller can reach.
    pub fn is_standalone(&self) -> bool {
        !self
            .owner_kinds
            .iter()
            .any(|kind| SCALABLE_POD_OWNERS.contains(&kind.as_str()))
    }
}

/// One page of a paginated namespace listing.
#[derive(Debug, Clone, Default)]
pub struct NamespacePage {
    pub items: Vec<NamespaceState>,
    pub continue_token: Option<String>,
}

/// A JSON merge patch guarded by the resource version it was computed from.
/// `None` values delete the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePatch {
    pub resource_version: String,
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
    pub spec: Option<Value>,
}

impl MergePatch {
    pub fn guarded_by(resource_version: &str) -> MergePatch {
        MergePatch {
            resource_version: resource_version.to_string(),
            ..MergePatch::default()
        }
    }

    pub fn set_label(mut self, key: &str, value: &str) -> MergePatch {
        self.labels.insert(key.to_string(), Some(value.to_string()));
        self
    }

    pub fn set_annotation(mut self, key: &str, value: impl Into<String>) -> MergePatch {
        self.annotations.insert(key.to_string(), Some(value.into()));
        self
    }

    pub fn remove_annotation(mut self, key: &str) -> MergePatch {
        self.annotations.insert(key.to_string(), None);
        self
    }

    pub fn with_spec(mut self, spec: Value) -> MergePatch {
        self.spec = Some(spec);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty() && self.spec.is_none()
    }

    pub fn to_json(&self) -> Value {
        let mut metadata = Map::new();
        metadata.insert(
            "resourceVersion".to_string(),
            Value::String(self.resource_version.clone()),
        );
        if !self.labels.is_empty() {
            metadata.insert("labels".to_string(), json!(self.labels));
        }
        if !self.annotations.is_empty() {
            metadata.insert("annotations".to_string(), json!(self.annotations));
        }
        let mut patch = Map::new();
        patch.insert("metadata".to_string(), Value::Object(metadata));
        if let Some(spec) = &self.spec {
            patch.insert("spec".to_string(), spec.clone());
        }
        Value::Object(patch)
    }
}

/// Applies a key patch to a string map the way a merge patch does.
pub fn apply_map_patch(
    target: &mut BTreeMap<String, String>,
    patch: &BTreeMap<String, Option<String>>,
) {
    for (key, value) in patch {
        match value {
            Some(v) => {
                target.insert(key.clone(), v.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

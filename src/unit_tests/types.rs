// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::types::*;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeMap;

fn namespace(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> NamespaceState {
    NamespaceState {
        name: "ns-1".to_string(),
        resource_version: "1".to_string(),
        labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        terminating: false,
    }
}

#[test]
pub fn test_declared_status_from_label() {
    assert_eq!(namespace(&[], &[]).declared_status(), LockStatus::Unset);
    assert_eq!(
        namespace(&[(STATUS_LABEL, STATUS_ACTIVE)], &[]).declared_status(),
        LockStatus::Active
    );
    assert_eq!(
        namespace(&[(STATUS_LABEL, STATUS_LOCKED)], &[]).declared_status(),
        LockStatus::Locked
    );
    assert_eq!(
        namespace(&[(STATUS_LABEL, "frozen")], &[]).declared_status(),
        LockStatus::Unknown
    );
}

#[test]
pub fn test_lock_status_honours_expiry() {
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let past = (now - Duration::hours(1)).to_rfc3339();
    let future = (now + Duration::hours(1)).to_rfc3339();
    let expired = namespace(
        &[(STATUS_LABEL, STATUS_LOCKED)],
        &[(LOCK_EXPIRY_ANNOTATION, &past)],
    );
    assert_eq!(expired.lock_status(now), LockStatus::PendingDeletion);
    let pending = namespace(
        &[(STATUS_LABEL, STATUS_LOCKED)],
        &[(LOCK_EXPIRY_ANNOTATION, &future)],
    );
    assert_eq!(pending.lock_status(now), LockStatus::Locked);
    // Expiry on an active namespace means nothing.
    let active = namespace(
        &[(STATUS_LABEL, STATUS_ACTIVE)],
        &[(LOCK_EXPIRY_ANNOTATION, &past)],
    );
    assert_eq!(active.lock_status(now), LockStatus::Active);
}

#[test]
pub fn test_malformed_expiry_counts_as_none() {
    let ns = namespace(
        &[(STATUS_LABEL, STATUS_LOCKED)],
        &[(LOCK_EXPIRY_ANNOTATION, "next tuesday")],
    );
    assert!(ns.has_expiry_annotation());
    assert!(ns.lock_expiry().is_none());
    assert_eq!(ns.lock_status(Utc::now()), LockStatus::Locked);
}

#[test]
pub fn test_lock_markers() {
    assert!(!namespace(&[], &[]).carries_lock_markers());
    assert!(namespace(&[(STATUS_LABEL, STATUS_ACTIVE)], &[]).carries_lock_markers());
    assert!(namespace(&[], &[(LOCK_EXPIRY_ANNOTATION, "x")]).carries_lock_markers());
    assert!(namespace(&[], &[(LOCK_OPERATOR_ANNOTATION, "ops")]).has_lock_annotations());
}

#[test]
pub fn test_status_code_round_trips() {
    for status in [
        LockStatus::Unset,
        LockStatus::Active,
        LockStatus::Locked,
        LockStatus::PendingDeletion,
        LockStatus::Unknown,
    ] {
        assert_eq!(LockStatus::from_code(status.code()), status);
    }
    assert_eq!(LockStatus::from_code(200), LockStatus::Unknown);
}

#[test]
pub fn test_pod_standalone() {
    let bare = PodState {
        name: "p".to_string(),
        owner_kinds: vec![],
    };
    assert!(bare.is_standalone());
    let owned = PodState {
        name: "p".to_string(),
        owner_kinds: vec!["ReplicaSet".to_string()],
    };
    assert!(!owned.is_standalone());
    let daemon = PodState {
        name: "p".to_string(),
        owner_kinds: vec!["DaemonSet".to_string()],
    };
    assert!(daemon.is_standalone());
}

#[test]
pub fn test_merge_patch_to_json() {
    let patch = MergePatch::guarded_by("42")
        .set_label(STATUS_LABEL, STATUS_ACTIVE)
        .remove_annotation(LOCK_EXPIRY_ANNOTATION)
        .with_spec(json!({ "replicas": 0 }));
    assert!(!patch.is_noop());
    assert_eq!(
        patch.to_json(),
        json!({
            "metadata": {
                "resourceVersion": "42",
                "labels": { STATUS_LABEL: STATUS_ACTIVE },
                "annotations": { LOCK_EXPIRY_ANNOTATION: null },
            },
            "spec": { "replicas": 0 },
        })
    );
    let bare = MergePatch::guarded_by("7");
    assert!(bare.is_noop());
    assert_eq!(bare.to_json(), json!({ "metadata": { "resourceVersion": "7" } }));
}

#[test]
pub fn test_apply_map_patch() {
    let mut target = BTreeMap::from([
        ("keep".to_string(), "1".to_string()),
        ("drop".to_string(), "2".to_string()),
    ]);
    let patch = BTreeMap::from([
        ("drop".to_string(), None),
        ("add".to_string(), Some("3".to_string())),
    ]);
    apply_map_patch(&mut target, &patch);
    assert_eq!(target.get("keep").map(String::as_str), Some("1"));
    assert_eq!(target.get("add").map(String::as_str), Some("3"));
    assert!(!target.contains_key("drop"));
}

#[test]
pub fn test_lock_request_wire_format() {
    let spec: LockRequestSpec = serde_json::from_value(json!({
        "namespaceNames": ["ns-1", "ns-2"],
        "action": "locked",
        "durationSeconds": 3600,
    }))
    .unwrap();
    assert_eq!(spec.action, LockAction::Lock);
    assert_eq!(spec.namespace_names.len(), 2);
    assert_eq!(spec.duration_seconds, Some(3600));
    assert!(spec.reason.is_none());
    assert_eq!(LockAction::Unlock.label_value(), STATUS_ACTIVE);
}

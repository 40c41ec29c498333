// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use super::fixture;
use crate::cluster::ClusterApi;
use crate::memory::PressureLevel;
use crate::quota::make_deny_all_quota;
use crate::scanner::PeriodicScanner;
use crate::types::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn lock_spec(targets: &[&str]) -> LockRequestSpec {
    LockRequestSpec {
        namespace_names: targets.iter().map(|t| t.to_string()).collect(),
        action: LockAction::Lock,
        reason: None,
        operator: None,
        duration_seconds: None,
    }
}

#[tokio::test]
pub async fn test_fast_scan_converges_labelled_namespaces() {
    let f = fixture();
    f.cluster.add_namespace(
        "expired",
        &[(STATUS_LABEL, STATUS_LOCKED)],
        &[(LOCK_EXPIRY_ANNOTATION, "2020-01-01T00:00:00Z")],
    );
    f.cluster
        .add_namespace("locked", &[(STATUS_LABEL, STATUS_LOCKED)], &[]);
    f.cluster
        .add_workload("locked", WorkloadKind::Deployment, "web", 2);
    f.cluster
        .add_namespace("active", &[(STATUS_LABEL, STATUS_ACTIVE)], &[]);
    f.cluster.add_namespace("plain", &[], &[]);
    f.cluster
        .create_quota("plain", &make_deny_all_quota("plain", false))
        .await
        .unwrap();

    let scanner = PeriodicScanner::new(f.engine.clone());
    let summary = scanner.fast_scan().await.unwrap();
    assert_eq!(summary.listed, 3);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.converged, 2);
    assert!(!summary.deferred);

    assert!(f.cluster.namespace("expired").is_none());
    assert_eq!(
        f.cluster
            .workload("locked", WorkloadKind::Deployment, "web")
            .unwrap()
            .replicas,
        0
    );
    // Unlabelled namespaces are left to the slow scan.
    assert_eq!(f.cluster.quota_count("plain"), 1);
    assert_eq!(f.ctx.metrics.fast_scans.load(Ordering::Relaxed), 1);
}

#[tokio::test]
pub async fn test_slow_scan_pages_through_everything() {
    let f = fixture();
    for i in 0..5 {
        let name = format!("ns-{}", i);
        f.cluster.add_namespace(&name, &[], &[]);
        f.cluster
            .create_quota(&name, &make_deny_all_quota(&name, false))
            .await
            .unwrap();
    }
    let scanner = PeriodicScanner::new(f.engine.clone());
    let summary = scanner.slow_scan().await.unwrap();
    assert_eq!(summary.listed, 5);
    assert_eq!(summary.converged, 5);
    for i in 0..5 {
        assert_eq!(f.cluster.quota_count(&format!("ns-{}", i)), 0);
    }
    assert_eq!(f.ctx.index.len(), 5);
    assert_eq!(f.ctx.metrics.slow_scans.load(Ordering::Relaxed), 1);
}

#[tokio::test]
pub async fn test_scan_failure_is_counted() {
    let f = fixture();
    f.cluster
        .add_namespace("locked", &[(STATUS_LABEL, STATUS_LOCKED)], &[]);
    f.cluster.fail_lists_of("Namespace");
    let scanner = PeriodicScanner::new(f.engine.clone());
    assert!(scanner.fast_scan().await.is_err());
    assert!(scanner.slow_scan().await.is_err());
    assert_eq!(f.ctx.metrics.scan_failures.load(Ordering::Relaxed), 2);
    assert_eq!(f.ctx.metrics.fast_scans.load(Ordering::Relaxed), 0);

    f.cluster.heal_lists();
    assert!(scanner.fast_scan().await.is_ok());
}

#[tokio::test]
pub async fn test_scan_is_cut_short_under_pressure() {
    let f = fixture();
    f.cluster
        .add_namespace("locked", &[(STATUS_LABEL, STATUS_LOCKED)], &[]);
    f.ctx
        .pressure
        .record(f.ctx.config.defer_bytes(), PressureLevel::Elevated);
    let scanner = PeriodicScanner::new(f.engine.clone());
    let summary = scanner.slow_scan().await.unwrap();
    assert!(summary.deferred);
    assert_eq!(summary.listed, 0);
    assert_eq!(f.cluster.quota_count("locked"), 0);
}

#[tokio::test]
pub async fn test_filter_refresh_collects_relevant_names() {
    let f = fixture();
    f.cluster
        .add_namespace("labelled", &[(STATUS_LABEL, STATUS_ACTIVE)], &[]);
    f.cluster.add_namespace("plain", &[], &[]);
    f.cluster.add_lock_request("freeze", lock_spec(&["target", "labelled"]));
    let scanner = PeriodicScanner::new(f.engine.clone());
    assert_eq!(scanner.refresh_filter().await.unwrap(), 2);
    assert!(f.ctx.filter.should_process("labelled"));
    assert!(f.ctx.filter.should_process("target"));
    assert!(!f.ctx.filter.should_process("plain"));
}

#[tokio::test]
pub async fn test_filter_refresh_keeps_expiry_only_namespaces() {
    let f = fixture();
    f.cluster.add_namespace(
        "expiring",
        &[],
        &[(LOCK_EXPIRY_ANNOTATION, "2030-01-01T00:00:00Z")],
    );
    f.cluster.add_namespace("plain", &[], &[]);
    let scanner = PeriodicScanner::new(f.engine.clone());
    assert_eq!(scanner.refresh_filter().await.unwrap(), 1);
    assert!(f.ctx.filter.should_process("expiring"));
    assert!(!f.ctx.filter.should_process("plain"));
}

#[tokio::test]
pub async fn test_filter_refresh_failure_keeps_old_set() {
    let f = fixture();
    f.admit("kept");
    f.cluster.fail_lists_of("LockRequest");
    let scanner = PeriodicScanner::new(f.engine.clone());
    assert!(scanner.refresh_filter().await.is_err());
    assert!(f.ctx.filter.should_process("kept"));
    assert_eq!(f.ctx.metrics.scan_failures.load(Ordering::Relaxed), 1);
}

#[tokio::test]
pub async fn test_fast_loop_runs_immediately_and_stops_on_shutdown() {
    let f = fixture();
    f.cluster
        .add_namespace("locked", &[(STATUS_LABEL, STATUS_LOCKED)], &[]);
    let scanner = Arc::new(PeriodicScanner::new(f.engine.clone()));
    let handle = tokio::spawn(scanner.run_fast(f.shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.ctx.metrics.fast_scans.load(Ordering::Relaxed), 1);
    assert_eq!(f.cluster.quota_count("locked"), 1);
    f.trigger.trigger();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
pub async fn test_event_and_scan_racing_on_one_namespace_stay_consistent() {
    let f = fixture();
    f.cluster
        .add_namespace("ns-1", &[(STATUS_LABEL, STATUS_LOCKED)], &[]);
    f.cluster
        .add_workload("ns-1", WorkloadKind::Deployment, "web", 3);
    f.cluster
        .add_workload("ns-1", WorkloadKind::StatefulSet, "db", 2);
    f.cluster.conflict_next_write("Deployment/ns-1/web");
    f.admit("ns-1");
    let scanner = PeriodicScanner::new(f.engine.clone());

    let (_, scan) = tokio::join!(f.engine.reconcile("ns-1"), scanner.fast_scan());
    scan.unwrap();
    scanner.fast_scan().await.unwrap();

    let quota = f.cluster.quota("ns-1", DENY_ALL_QUOTA_NAME).is_some();
    assert!(quota);
    for (kind, name, original) in [
        (WorkloadKind::Deployment, "web", "3"),
        (WorkloadKind::StatefulSet, "db", "2"),
    ] {
        let workload = f.cluster.workload("ns-1", kind, name).unwrap();
        assert!(workload.replicas != 0 || quota, "{} scaled down without quota", name);
        assert!(
            workload.original_replicas().is_none() || workload.replicas == 0 || !quota,
            "{} running with a stale restore annotation",
            name
        );
        assert_eq!(workload.replicas, 0);
        assert_eq!(workload.original_replicas().map(String::as_str), Some(original));
    }
}

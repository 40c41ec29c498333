// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Process-lifetime counters, safe to bump from any task.
        #[derive(Debug, Default)]
        pub struct Metrics {
            $(pub $name: AtomicU64,)*
        }

        /// A point-in-time copy of [`Metrics`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
        pub struct MetricsSnapshot {
            $(pub $name: u64,)*
        }

        impl Metrics {
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    namespaces_processed,
    api_calls,
    errors,
    conflicts,
    workloads_scaled,
    workloads_restored,
    cron_jobs_suspended,
    cron_jobs_resumed,
    pods_deleted,
    namespaces_deleted,
    requeued_pressure,
    requeued_busy,
    filtered,
    fast_scans,
    slow_scans,
    scan_failures,
);

impl Metrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn api_call(&self) {
        Metrics::inc(&self.api_calls);
    }
}

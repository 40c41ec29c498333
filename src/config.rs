// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::error::{Error, Result};
use crate::worker::lock_expiry_after;
use clap::{Args, ValueEnum};
use std::time::Duration;

/// What happens to a locked namespace once its lock expiry has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExpiryPolicy {
    /// Delete the namespace outright.
    Delete,
    /// Flip it back to active and restore its workloads.
    Unlock,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Controller settings, from flags or the matching environment variables.
#[derive(Debug, Clone, Args)]
pub struct ControllerConfig {
    /// Maximum namespaces reconciled concurrently.
    #[arg(long, env = "NSLOCK_WORKERS", default_value_t = 16)]
    pub workers: usize,

    /// Resident memory ceiling in bytes.
    #[arg(long, env = "NSLOCK_MEMORY_CEILING_BYTES", default_value_t = 1 << 30)]
    pub memory_ceiling_bytes: u64,

    /// Fraction of the ceiling at which caches are trimmed.
    #[arg(long, env = "NSLOCK_SOFT_CLEANUP_FRACTION", default_value_t = 0.8)]
    pub soft_cleanup_fraction: f64,

    /// Fraction of the ceiling above which reconciles are deferred.
    #[arg(long, env = "NSLOCK_DEFER_FRACTION", default_value_t = 0.9)]
    pub defer_fraction: f64,

    #[arg(long, env = "NSLOCK_MEMORY_TICK", default_value = "30s", value_parser = parse_duration)]
    pub memory_tick: Duration,

    #[arg(long, env = "NSLOCK_FAST_SCAN_INTERVAL", default_value = "2m", value_parser = parse_duration)]
    pub fast_scan_interval: Duration,

    #[arg(long, env = "NSLOCK_SLOW_SCAN_INTERVAL", default_value = "1h", value_parser = parse_duration)]
    pub slow_scan_interval: Duration,

    /// Page size for namespace listings.
    #[arg(long, env = "NSLOCK_SCAN_BATCH", default_value_t = 500)]
    pub scan_batch: u32,

    #[arg(long, env = "NSLOCK_FILTER_REFRESH_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub filter_refresh_interval: Duration,

    #[arg(long, env = "NSLOCK_FILTER_MAX_ENTRIES", default_value_t = 200_000)]
    pub filter_max_entries: usize,

    #[arg(long, env = "NSLOCK_INDEX_CAPACITY", default_value_t = 150_000)]
    pub index_capacity: usize,

    #[arg(long, env = "NSLOCK_INTERN_MAX_ENTRIES", default_value_t = 100_000)]
    pub intern_max_entries: usize,

    /// Lock duration applied when a locked namespace has no expiry. `0s` keeps such locks permanent.
    #[arg(long, env = "NSLOCK_DEFAULT_LOCK_DURATION", default_value = "7days", value_parser = parse_duration)]
    pub default_lock_duration: Duration,

    #[arg(long, env = "NSLOCK_BUSY_REQUEUE", default_value = "2s", value_parser = parse_duration)]
    pub busy_requeue: Duration,

    #[arg(long, env = "NSLOCK_PRESSURE_REQUEUE", default_value = "30s", value_parser = parse_duration)]
    pub pressure_requeue: Duration,

    #[arg(long, env = "NSLOCK_ERROR_REQUEUE", default_value = "10s", value_parser = parse_duration)]
    pub error_requeue: Duration,

    #[arg(long, env = "NSLOCK_METRICS_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub metrics_interval: Duration,

    #[arg(long, env = "NSLOCK_EXPIRY_POLICY", value_enum, default_value_t = ExpiryPolicy::Delete)]
    pub expiry_policy: ExpiryPolicy,

    /// Leave secrets and configmaps out of the deny-all quota.
    #[arg(long, env = "NSLOCK_QUOTA_ALLOW_CONFIG_OBJECTS", default_value_t = false)]
    pub quota_allow_config_objects: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            workers: 16,
            memory_ceiling_bytes: 1 << 30,
            soft_cleanup_fraction: 0.8,
            defer_fraction: 0.9,
            memory_tick: Duration::from_secs(30),
            fast_scan_interval: Duration::from_secs(120),
            slow_scan_interval: Duration::from_secs(3600),
            scan_batch: 500,
            filter_refresh_interval: Duration::from_secs(300),
            filter_max_entries: 200_000,
            index_capacity: 150_000,
            intern_max_entries: 100_000,
            default_lock_duration: Duration::from_secs(7 * 24 * 3600),
            busy_requeue: Duration::from_secs(2),
            pressure_requeue: Duration::from_secs(30),
            error_requeue: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
            expiry_policy: ExpiryPolicy::Delete,
            quota_allow_config_objects: false,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.memory_ceiling_bytes == 0 {
            return Err(Error::InvalidConfig(
                "memory ceiling must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("soft cleanup fraction", self.soft_cleanup_fraction),
            ("defer fraction", self.defer_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.scan_batch == 0 {
            return Err(Error::InvalidConfig("scan batch must be positive".to_string()));
        }
        for (name, period) in [
            ("memory tick", self.memory_tick),
            ("fast scan interval", self.fast_scan_interval),
            ("slow scan interval", self.slow_scan_interval),
            ("filter refresh interval", self.filter_refresh_interval),
            ("metrics interval", self.metrics_interval),
        ] {
            if period.is_zero() {
                return Err(Error::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if let Some(duration) = self.default_lock_duration() {
            lock_expiry_after(duration)?;
        }
        Ok(())
    }

    pub fn default_lock_duration(&self) -> Option<Duration> {
        if self.default_lock_duration.is_zero() {
            None
        } else {
            Some(self.default_lock_duration)
        }
    }

    pub fn soft_cleanup_bytes(&self) -> u64 {
        (self.memory_ceiling_bytes as f64 * self.soft_cleanup_fraction) as u64
    }

    pub fn defer_bytes(&self) -> u64 {
        (self.memory_ceiling_bytes as f64 * self.defer_fraction) as u64
    }
}

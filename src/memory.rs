// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::engine::Context;
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Source of the process's resident memory.
pub trait MemorySampler: Send {
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Reads the current process's RSS through sysinfo.
pub struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    pub fn new() -> ProcessSampler {
        ProcessSampler {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        ProcessSampler::new()
    }
}

impl MemorySampler for ProcessSampler {
    fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid).map(sysinfo::Process::memory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PressureLevel {
    Normal = 0,
    Elevated = 1,
    Critical = 2,
}

impl PressureLevel {
    fn from_code(code: u8) -> PressureLevel {
        match code {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Elevated,
            _ => PressureLevel::Critical,
        }
    }
}

/// Latest memory sample, shared with the reconciler's admission check.
#[derive(Debug, Default)]
pub struct PressureGauge {
    resident_bytes: AtomicU64,
    level: AtomicU8,
}

impl PressureGauge {
    pub fn record(&self, resident_bytes: u64, level: PressureLevel) {
        self.resident_bytes.store(resident_bytes, Ordering::Relaxed);
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_code(self.level.load(Ordering::Relaxed))
    }
}

/// Samples memory on a fixed tick and shrinks the side caches when the
/// process approaches its ceiling. It never stops reconciliation itself; the
/// reconciler reads the gauge it updates and defers work on its own.
pub struct MemoryPressureController {
    ctx: Arc<Context>,
    sampler: Box<dyn MemorySampler>,
}

impl MemoryPressureController {
    pub fn new(ctx: Arc<Context>, sampler: Box<dyn MemorySampler>) -> MemoryPressureController {
        MemoryPressureController { ctx, sampler }
    }

    pub fn classify(&self, resident_bytes: u64) -> PressureLevel {
        if resident_bytes >= self.ctx.config.memory_ceiling_bytes {
            PressureLevel::Critical
        } else if resident_bytes >= self.ctx.config.soft_cleanup_bytes() {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    /// Takes one sample and reacts to it.
    pub fn tick(&mut self) -> PressureLevel {
        let resident_bytes = match self.sampler.resident_bytes() {
            Some(bytes) => bytes,
            None => {
                debug!("Memory sample unavailable");
                return self.ctx.pressure.level();
            }
        };
        let level = self.classify(resident_bytes);
        self.ctx.pressure.record(resident_bytes, level);
        match level {
            PressureLevel::Normal => {}
            PressureLevel::Elevated => self.soft_cleanup(resident_bytes),
            PressureLevel::Critical => self.emergency_cleanup(resident_bytes),
        }
        level
    }

    fn soft_cleanup(&self, resident_bytes: u64) {
        let interned = self.ctx.interner.cleanup_old_entries();
        let filter_dropped = self.ctx.filter.cleanup_expired_entries();
        let compacted = self.ctx.index.compact();
        info!(
            resident_bytes,
            ceiling = self.ctx.config.memory_ceiling_bytes,
            interned,
            filter_dropped,
            compacted,
            "Memory pressure, trimmed caches"
        );
    }

    // Resetting drops the allocations themselves, which is as close to a forced
    // collection as an allocator-managed process gets.
    fn emergency_cleanup(&self, resident_bytes: u64) {
        self.ctx.interner.reset();
        self.ctx.filter.reset();
        self.ctx.index.reset();
        warn!(
            resident_bytes,
            ceiling = self.ctx.config.memory_ceiling_bytes,
            "Memory ceiling reached, reset all caches"
        );
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        let mut ticker = interval(self.ctx.config.memory_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        info!("memory monitor terminated");
    }
}

//! Worker count policy for elastic pools.

use async_trait::async_trait;
use sysinfo::System;

/// Default memory budget of one worker, in megabytes.
pub const DEFAULT_WORKER_MEMORY_MB: u64 = 2048;

/// Snapshot of the host resources relevant to sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub available_memory_mb: u64,
    pub logical_cpus: usize,
}

/// Number of workers the host can sustain.
///
/// Bounded by both memory and CPU, never below one.
pub fn target_worker_count(available_memory_mb: u64, per_worker_mb: u64, cpus: usize) -> usize {
    let by_memory = available_memory_mb / per_worker_mb.max(1);
    let by_memory = usize::try_from(by_memory).unwrap_or(usize::MAX);
    by_memory.min(cpus).max(1)
}

/// Source of host resource snapshots.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn probe(&self) -> HostResources;
}

/// Probe backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn probe(&self) -> HostResources {
        let sample = tokio::task::spawn_blocking(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.refresh_cpu_usage();
            HostResources {
                available_memory_mb: sys.available_memory() / (1024 * 1024),
                logical_cpus: sys.cpus().len(),
            }
        })
        .await;

        // A panicked probe reports a single-worker host.
        sample.unwrap_or(HostResources {
            available_memory_mb: 0,
            logical_cpus: 1,
        })
    }
}

/// Probe returning a fixed snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub HostResources);

#[async_trait]
impl ResourceProbe for StaticProbe {
    async fn probe(&self) -> HostResources {
        self.0
    }
}

//! GPU enumeration (§4.2). Shells out to NVML and caches results with a short
//! TTL; a mock backend stands in when `MOCK_GPUS=N` is set, for tests and for
//! machines with no GPU at all.

use nvml_wrapper::Nvml;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub process_count: usize,
    pub pids: Vec<u32>,
}

pub trait GpuBackend: Send + Sync {
    fn enumerate(&self) -> anyhow::Result<Vec<GpuInfo>>;
}

struct NvmlBackend {
    nvml: Nvml,
}

impl GpuBackend for NvmlBackend {
    fn enumerate(&self) -> anyhow::Result<Vec<GpuInfo>> {
        let count = self.nvml.device_count()?;
        let mut gpus = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self.nvml.device_by_index(index)?;
            let name = device.name().unwrap_or_else(|_| "unknown".to_string());
            let mem = device.memory_info()?;
            let pids: Vec<u32> = device
                .running_compute_processes()
                .map(|procs| procs.iter().map(|p| p.pid).collect())
                .unwrap_or_default();
            gpus.push(GpuInfo {
                index,
                name,
                memory_total_mb: mem.total / (1024 * 1024),
                memory_used_mb: mem.used / (1024 * 1024),
                process_count: pids.len(),
                pids,
            });
        }
        Ok(gpus)
    }
}

/// Deterministic stand-in enabled by `MOCK_GPUS=N`: `N` synthetic GPUs, always idle.
struct MockBackend {
    count: u32,
}

impl GpuBackend for MockBackend {
    fn enumerate(&self) -> anyhow::Result<Vec<GpuInfo>> {
        Ok((0..self.count)
            .map(|index| GpuInfo {
                index,
                name: "mock-gpu".to_string(),
                memory_total_mb: 81920,
                memory_used_mb: 0,
                process_count: 0,
                pids: Vec::new(),
            })
            .collect())
    }
}

/// Shared, TTL-cached view over the GPU backend (§5 "single-writer refreshes under a
/// mutex", ambient "Cache with TTL" design note).
pub struct GpuProbe {
    backend: Box<dyn GpuBackend>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<GpuInfo>)>>,
}

impl GpuProbe {
    pub fn new(ttl: Duration) -> anyhow::Result<Self> {
        let backend: Box<dyn GpuBackend> = if let Ok(n) = std::env::var("MOCK_GPUS") {
            let count: u32 = n
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid MOCK_GPUS value: {n}"))?;
            Box::new(MockBackend { count })
        } else {
            Box::new(NvmlBackend { nvml: Nvml::init()? })
        };
        Ok(Self {
            backend,
            ttl,
            cache: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub fn with_backend(backend: Box<dyn GpuBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn snapshot(&self, force_refresh: bool) -> anyhow::Result<Vec<GpuInfo>> {
        let mut guard = self.cache.lock().unwrap();
        if !force_refresh {
            if let Some((at, gpus)) = guard.as_ref() {
                if at.elapsed() < self.ttl {
                    return Ok(gpus.clone());
                }
            }
        }
        let gpus = self.backend.enumerate()?;
        *guard = Some((Instant::now(), gpus.clone()));
        Ok(gpus)
    }

    /// Availability rule (§4.2): not blacklisted (or override), not already assigned
    /// to a running job, no stray external process holding it, and — if the daemon
    /// is configured with an explicit GPU allowlist — present in that allowlist.
    pub fn available_indices(
        &self,
        blacklist: &HashSet<u32>,
        busy: &HashSet<u32>,
        ignore_blacklist: bool,
        allowed: Option<&[u32]>,
    ) -> anyhow::Result<Vec<u32>> {
        let gpus = self.snapshot(false)?;
        Ok(gpus
            .into_iter()
            .filter(|g| ignore_blacklist || !blacklist.contains(&g.index))
            .filter(|g| !busy.contains(&g.index))
            .filter(|g| g.process_count == 0)
            .filter(|g| match allowed {
                Some(a) => a.contains(&g.index),
                None => true,
            })
            .map(|g| g.index)
            .collect())
    }
}

/// Test double reused by `scheduler.rs`/`engine.rs` tests that need a
/// deterministic, idle GPU set without depending on `MOCK_GPUS`/NVML.
#[cfg(test)]
pub mod test_support {
    use super::*;

    pub struct FixedBackend(pub Vec<GpuInfo>);

    impl FixedBackend {
        pub fn idle(count: u32) -> Self {
            Self(
                (0..count)
                    .map(|index| GpuInfo {
                        index,
                        name: "mock-gpu".to_string(),
                        memory_total_mb: 81920,
                        memory_used_mb: 0,
                        process_count: 0,
                        pids: Vec::new(),
                    })
                    .collect(),
            )
        }
    }

    impl GpuBackend for FixedBackend {
        fn enumerate(&self) -> anyhow::Result<Vec<GpuInfo>> {
            Ok(self.0.clone())
        }
    }
}

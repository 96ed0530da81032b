//! System health probe (§4.5 task 4). Purely observational: samples CPU,
//! memory, and disk usage and lets the scheduler log warnings on threshold
//! breach. Never influences scheduling decisions.

use sysinfo::{Disks, System};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HealthSample {
    pub cpu_used_pct: f32,
    pub mem_used_pct: f64,
    pub disk_used_pct: f64,
}

pub fn sample() -> HealthSample {
    let mut sys = System::new_all();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_used_pct = sys.global_cpu_usage();
    let mem_used_pct = if sys.total_memory() > 0 {
        sys.used_memory() as f64 / sys.total_memory() as f64
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (total, available): (u64, u64) = disks
        .iter()
        .fold((0, 0), |(t, a), d| (t + d.total_space(), a + d.available_space()));
    let disk_used_pct = if total > 0 {
        1.0 - (available as f64 / total as f64)
    } else {
        0.0
    };

    HealthSample {
        cpu_used_pct,
        mem_used_pct,
        disk_used_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_returns_fractions_in_range() {
        let s = sample();
        assert!(s.mem_used_pct >= 0.0 && s.mem_used_pct <= 1.0);
        assert!(s.disk_used_pct >= 0.0 && s.disk_used_pct <= 1.0);
    }
}

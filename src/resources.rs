//! Host resource headroom checks performed before spawning a worker.

use crate::config::Config;
use crate::{Error, Result};

/// Point-in-time host utilisation, both as fractions of capacity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSnapshot {
    /// One-minute load average divided by the CPU count.
    pub cpu_load: f64,
    pub memory_used: f64,
}

pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> Result<ResourceSnapshot>;
}

/// Reads `/proc`. Reports an idle host where `/proc` is unavailable.
#[derive(Debug, Default, Clone)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn snapshot(&self) -> Result<ResourceSnapshot> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;

        let cpu_load = match std::fs::read_to_string("/proc/loadavg") {
            Ok(raw) => parse_loadavg(&raw).map(|l| l / cpus).unwrap_or(0.0),
            Err(_) => 0.0,
        };
        let memory_used = match std::fs::read_to_string("/proc/meminfo") {
            Ok(raw) => parse_meminfo(&raw).unwrap_or(0.0),
            Err(_) => 0.0,
        };
        Ok(ResourceSnapshot {
            cpu_load,
            memory_used,
        })
    }
}

fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// Fraction of memory in use: `1 - MemAvailable / MemTotal`.
fn parse_meminfo(raw: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        raw.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total).clamp(0.0, 1.0))
}

/// Upper bounds on utilisation at which new workers are refused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_cpu_load: f64,
    pub max_memory_used: f64,
}

impl ResourceLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_cpu_load: config.max_cpu_load,
            max_memory_used: config.max_memory_used,
        }
    }

    /// `ResourceExhaustion` when either bound is exceeded.
    pub fn check(&self, snapshot: ResourceSnapshot) -> Result<()> {
        if snapshot.cpu_load > self.max_cpu_load {
            return Err(Error::ResourceExhaustion(format!(
                "cpu load {:.2} exceeds {:.2}",
                snapshot.cpu_load, self.max_cpu_load
            )));
        }
        if snapshot.memory_used > self.max_memory_used {
            return Err(Error::ResourceExhaustion(format!(
                "memory use {:.2} exceeds {:.2}",
                snapshot.memory_used, self.max_memory_used
            )));
        }
        Ok(())
    }
}

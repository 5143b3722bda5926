//! Self-process probes backing the Prometheus exposition.

use std::sync::Mutex;
use std::time::Instant;

/// CPU percent derived from successive /proc/self samples.
/// Returns None on platforms without /proc or before the second sample.
pub struct CpuProbe {
    last: Mutex<Option<(Instant, f64)>>,
}

impl CpuProbe {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    pub fn sample(&self) -> Option<f64> {
        let cpu_seconds = self_cpu_seconds()?;
        let now = Instant::now();
        let mut last = self.last.lock().expect("cpu probe lock poisoned");
        let percent = last.map(|(t, prev)| {
            let wall = now.duration_since(t).as_secs_f64();
            if wall > 0.0 {
                ((cpu_seconds - prev) / wall * 100.0).max(0.0)
            } else {
                0.0
            }
        });
        *last = Some((now, cpu_seconds));
        percent
    }
}

impl Default for CpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn self_cpu_seconds() -> Option<f64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) / 100.0)
}

#[cfg(not(target_os = "linux"))]
fn self_cpu_seconds() -> Option<f64> {
    None
}

/// Resident set of this process in megabytes.
#[cfg(target_os = "linux")]
pub fn self_working_set_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let rss_kb: f64 = status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    Some(rss_kb / 1024.0)
}

#[cfg(not(target_os = "linux"))]
pub fn self_working_set_mb() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn probes_read_proc() {
        assert!(self_cpu_seconds().is_some());
        assert!(self_working_set_mb().unwrap() > 0.0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn cpu_probe_needs_two_samples() {
        let probe = CpuProbe::new();
        assert!(probe.sample().is_none());
        assert!(probe.sample().is_some());
    }
}

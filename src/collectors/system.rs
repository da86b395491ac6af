use crate::collectors::{SampleError, SystemSample};
use chrono::Utc;
use std::fs;
use std::time::Instant;
use tracing::debug;

const PROC_STAT: &str = "/proc/stat";
const PROC_MEMINFO: &str = "/proc/meminfo";
const PROC_NET_DEV: &str = "/proc/net/dev";
const PROC_LOADAVG: &str = "/proc/loadavg";

/// Aggregate CPU tick counters from the first line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

#[derive(Debug, Clone, Copy)]
struct NetTotals {
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Delta-based host sampler. Keeps only the previous raw counter snapshot;
/// the first call after start reports zero for the delta-derived metrics.
pub struct SystemSampler {
    last_cpu: Option<CpuTimes>,
    last_net: Option<(NetTotals, Instant)>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            last_cpu: None,
            last_net: None,
        }
    }

    pub fn sample(&mut self) -> Result<SystemSample, SampleError> {
        let cpu_percent = self.sample_cpu()?;
        let memory_percent = sample_memory()?;
        let network_mbps = self.sample_network()?;
        let (load_avg_1, load_avg_5, load_avg_15) = sample_loadavg()?;

        debug!(
            cpu = cpu_percent,
            memory = memory_percent,
            net_mbps = network_mbps,
            "host counters sampled"
        );

        Ok(SystemSample {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            network_mbps,
            load_avg_1,
            load_avg_5,
            load_avg_15,
        })
    }

    fn sample_cpu(&mut self) -> Result<f64, SampleError> {
        let text = fs::read_to_string(PROC_STAT)
            .map_err(|source| SampleError::read(PROC_STAT, source))?;
        let line = text
            .lines()
            .next()
            .ok_or_else(|| SampleError::format(PROC_STAT, "empty file"))?;
        let current = parse_cpu_line(line)
            .ok_or_else(|| SampleError::format(PROC_STAT, format!("bad cpu line: {line}")))?;

        let percent = match self.last_cpu {
            Some(prev) => cpu_percent_between(prev, current),
            None => 0.0,
        };
        self.last_cpu = Some(current);
        Ok(percent)
    }

    fn sample_network(&mut self) -> Result<f64, SampleError> {
        let text = fs::read_to_string(PROC_NET_DEV)
            .map_err(|source| SampleError::read(PROC_NET_DEV, source))?;
        let current = parse_net_dev(&text);
        let now = Instant::now();

        let rate = match self.last_net {
            Some((prev, at)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    let rx = current.rx_bytes.saturating_sub(prev.rx_bytes);
                    let tx = current.tx_bytes.saturating_sub(prev.tx_bytes);
                    (rx + tx) as f64 / elapsed / (1024.0 * 1024.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_net = Some((current, now));
        Ok(rate)
    }
}

fn sample_memory() -> Result<f64, SampleError> {
    let text = fs::read_to_string(PROC_MEMINFO)
        .map_err(|source| SampleError::read(PROC_MEMINFO, source))?;
    memory_percent_from_meminfo(&text)
        .ok_or_else(|| SampleError::format(PROC_MEMINFO, "MemTotal missing or zero"))
}

fn sample_loadavg() -> Result<(f64, f64, f64), SampleError> {
    let text = fs::read_to_string(PROC_LOADAVG)
        .map_err(|source| SampleError::read(PROC_LOADAVG, source))?;
    parse_loadavg(&text)
        .ok_or_else(|| SampleError::format(PROC_LOADAVG, format!("bad line: {}", text.trim())))
}

/// Total kB of physical memory, needed to turn per-process RSS into a
/// percentage.
pub fn mem_total_kb() -> Result<u64, SampleError> {
    let text = fs::read_to_string(PROC_MEMINFO)
        .map_err(|source| SampleError::read(PROC_MEMINFO, source))?;
    parse_meminfo_field(&text, "MemTotal:")
        .filter(|&v| v > 0)
        .ok_or_else(|| SampleError::format(PROC_MEMINFO, "MemTotal missing or zero"))
}

pub(crate) fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    Some(CpuTimes {
        total: values.iter().sum(),
        idle: values[3],
    })
}

/// Busy share of the ticks elapsed between two snapshots. Counter resets
/// and zero-width windows read as idle.
pub(crate) fn cpu_percent_between(prev: CpuTimes, current: CpuTimes) -> f64 {
    let total_delta = current.total.saturating_sub(prev.total);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = current.idle.saturating_sub(prev.idle).min(total_delta);
    (1.0 - idle_delta as f64 / total_delta as f64) * 100.0
}

pub(crate) fn memory_percent_from_meminfo(text: &str) -> Option<f64> {
    let total = parse_meminfo_field(text, "MemTotal:").filter(|&v| v > 0)?;
    let free = parse_meminfo_field(text, "MemFree:").unwrap_or(0);
    let buffers = parse_meminfo_field(text, "Buffers:").unwrap_or(0);
    let cached = parse_meminfo_field(text, "Cached:").unwrap_or(0);
    let used = total.saturating_sub(free + buffers + cached);
    Some(used as f64 / total as f64 * 100.0)
}

fn parse_meminfo_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Sums rx/tx byte counters over all interfaces except loopback.
fn parse_net_dev(text: &str) -> NetTotals {
    let mut totals = NetTotals {
        rx_bytes: 0,
        tx_bytes: 0,
    };
    for line in text.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        totals.rx_bytes += fields[0].parse::<u64>().unwrap_or(0);
        totals.tx_bytes += fields[8].parse::<u64>().unwrap_or(0);
    }
    totals
}

pub(crate) fn parse_loadavg(text: &str) -> Option<(f64, f64, f64)> {
    let mut fields = text.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    let fifteen = fields.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_line() {
        let times = parse_cpu_line("cpu  100 20 30 400 50 0 6 0 0 0").expect("valid line");
        assert_eq!(times.total, 606);
        assert_eq!(times.idle, 400);
        assert!(parse_cpu_line("cpu0 100 20 30 400").is_none());
        assert!(parse_cpu_line("cpu 100 20").is_none());
    }

    #[test]
    fn cpu_percent_uses_idle_delta() {
        let prev = CpuTimes {
            total: 1000,
            idle: 800,
        };
        let current = CpuTimes {
            total: 2000,
            idle: 1000,
        };
        // 200 of 1000 elapsed ticks idle, so 80% busy.
        let percent = cpu_percent_between(prev, current);
        assert!((percent - 80.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_handles_counter_reset() {
        let prev = CpuTimes {
            total: 5000,
            idle: 4000,
        };
        let current = CpuTimes {
            total: 100,
            idle: 90,
        };
        assert_eq!(cpu_percent_between(prev, current), 0.0);
        assert_eq!(cpu_percent_between(prev, prev), 0.0);
    }

    #[test]
    fn memory_percent_subtracts_reclaimable() {
        let text = "MemTotal:       1000 kB\nMemFree:         200 kB\nBuffers:         100 kB\nCached:          200 kB\nSwapTotal:         0 kB\n";
        let percent = memory_percent_from_meminfo(text).expect("valid meminfo");
        assert!((percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn memory_percent_rejects_zero_total() {
        assert!(memory_percent_from_meminfo("MemTotal: 0 kB\n").is_none());
        assert!(memory_percent_from_meminfo("MemFree: 100 kB\n").is_none());
    }

    #[test]
    fn net_dev_skips_loopback_and_headers() {
        let text = "Inter-|   Receive                                                |  Transmit\n \
face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
lo: 9999999    100    0    0    0     0          0         0  9999999     100    0    0    0     0       0          0\n  \
eth0: 1000    10    0    0    0     0          0         0  2000      20    0    0    0     0       0          0\n  \
wlan0: 500     5    0    0    0     0          0         0  700        7    0    0    0     0       0          0\n";
        let totals = parse_net_dev(text);
        assert_eq!(totals.rx_bytes, 1500);
        assert_eq!(totals.tx_bytes, 2700);
    }

    #[test]
    fn parses_loadavg_line() {
        let (one, five, fifteen) =
            parse_loadavg("0.52 1.04 2.08 2/512 12345\n").expect("valid loadavg");
        assert!((one - 0.52).abs() < 1e-9);
        assert!((five - 1.04).abs() < 1e-9);
        assert!((fifteen - 2.08).abs() < 1e-9);
        assert!(parse_loadavg("garbage").is_none());
    }
}

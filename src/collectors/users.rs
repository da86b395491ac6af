use crate::collectors::{system, SampleError, UserSample};
use crate::config::UserFilteringConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::time::Instant;
use sysinfo::{SystemExt, UserExt};
use tracing::debug;

/// UID to username mapping refreshed once per cycle. Unresolvable UIDs get
/// a synthetic `uid_<n>` name so their usage is still attributable.
pub struct UserTable {
    by_uid: HashMap<u32, String>,
}

impl UserTable {
    pub fn from_system(system: &sysinfo::System) -> Self {
        let by_uid = system
            .users()
            .iter()
            .filter_map(|u| {
                let uid = u.id().to_string().parse::<u32>().ok()?;
                Some((uid, u.name().to_string()))
            })
            .collect();
        Self { by_uid }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(u32, &str)]) -> Self {
        Self {
            by_uid: pairs.iter().map(|&(u, n)| (u, n.to_string())).collect(),
        }
    }

    pub fn resolve(&self, uid: u32) -> String {
        match self.by_uid.get(&uid) {
            Some(name) => name.clone(),
            None => format!("uid_{uid}"),
        }
    }
}

/// Decides which accounts count as real users and which samples show
/// enough activity to be worth tracking.
pub struct UserClassifier<'a> {
    filtering: &'a UserFilteringConfig,
}

impl<'a> UserClassifier<'a> {
    pub fn new(filtering: &'a UserFilteringConfig) -> Self {
        Self { filtering }
    }

    /// Include list wins, then the exclude list, then the system-account
    /// heuristics. An account we cannot place is tracked rather than
    /// silently dropped.
    pub fn is_trackable(&self, username: &str, uid: Option<u32>) -> bool {
        if self
            .filtering
            .included_users
            .iter()
            .any(|u| u == username)
        {
            return true;
        }
        if self
            .filtering
            .excluded_users
            .iter()
            .any(|u| u == username)
        {
            return false;
        }
        if username.starts_with("uid_") {
            return false;
        }
        if username.starts_with('_') && self.filtering.ignore_system_users {
            return false;
        }
        match uid {
            Some(uid) => uid >= self.filtering.min_uid_for_real_users,
            None => true,
        }
    }

    pub fn should_track(&self, sample: &UserSample) -> bool {
        if sample.cpu_percent >= self.filtering.min_cpu_percent
            || sample.memory_percent >= self.filtering.min_memory_percent
        {
            return true;
        }
        // A swarm of near-idle processes only matters once it burns real CPU.
        sample.process_count >= self.filtering.min_process_count && sample.cpu_percent >= 20.0
    }
}

#[derive(Debug, Clone, Copy)]
struct ProcessStat {
    uid: u32,
    cpu_ticks: u64,
    rss_kb: u64,
}

#[derive(Default)]
struct UserAccumulator {
    cpu_percent: f64,
    rss_kb: u64,
    pids: Vec<i32>,
}

/// Walks /proc and aggregates per-user usage. Per-process CPU percentages
/// come from utime+stime tick deltas against the previous walk, so the
/// first call reports zero CPU for every user.
pub struct UserSampler {
    clock_ticks: u64,
    page_kb: u64,
    last_walk: Option<Instant>,
    last_proc_ticks: HashMap<i32, u64>,
}

impl UserSampler {
    pub fn new() -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64;
        let page_kb = (unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(1) as u64) / 1024;
        Self {
            clock_ticks,
            page_kb: page_kb.max(1),
            last_walk: None,
            last_proc_ticks: HashMap::new(),
        }
    }

    pub fn sample_users(
        &mut self,
        table: &UserTable,
        filtering: &UserFilteringConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserSample>, SampleError> {
        let mem_total_kb = system::mem_total_kb()?;
        let entries =
            fs::read_dir("/proc").map_err(|source| SampleError::read("/proc", source))?;

        let walked_at = Instant::now();
        let elapsed = self
            .last_walk
            .map(|at| walked_at.duration_since(at).as_secs_f64())
            .filter(|&e| e > 0.0);

        let mut users: HashMap<u32, UserAccumulator> = HashMap::new();
        let mut seen_ticks: HashMap<i32, u64> = HashMap::new();

        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            // Processes exiting mid-walk are expected, not errors.
            let Some(stat) = self.read_process_stat(pid) else {
                continue;
            };

            seen_ticks.insert(pid, stat.cpu_ticks);
            let cpu_percent = match (self.last_proc_ticks.get(&pid), elapsed) {
                (Some(&prev), Some(elapsed)) => {
                    let delta = stat.cpu_ticks.saturating_sub(prev);
                    delta as f64 / self.clock_ticks as f64 / elapsed * 100.0
                }
                _ => 0.0,
            };

            let acc = users.entry(stat.uid).or_default();
            acc.cpu_percent += cpu_percent;
            acc.rss_kb += stat.rss_kb;
            acc.pids.push(pid);
        }

        // PIDs gone since the previous walk drop out of the tick map here.
        self.last_proc_ticks = seen_ticks;
        self.last_walk = Some(walked_at);

        let classifier = UserClassifier::new(filtering);
        let mut samples: Vec<UserSample> = users
            .into_iter()
            .filter_map(|(uid, acc)| {
                let username = table.resolve(uid);
                if !classifier.is_trackable(&username, Some(uid)) {
                    return None;
                }
                let sample = aggregate_sample(username, acc, mem_total_kb, now);
                classifier.should_track(&sample).then_some(sample)
            })
            .collect();
        samples.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));

        debug!(tracked_users = samples.len(), "user usage sampled");
        Ok(samples)
    }

    fn read_process_stat(&self, pid: i32) -> Option<ProcessStat> {
        let stat_text = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let (cpu_ticks, rss_pages) = parse_pid_stat(&stat_text)?;
        let status_text = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        let uid = parse_uid_from_status(&status_text)?;
        Some(ProcessStat {
            uid,
            cpu_ticks,
            rss_kb: rss_pages * self.page_kb,
        })
    }
}

/// Returns (utime+stime ticks, rss pages). The comm field may itself
/// contain spaces and parentheses, so fields are counted after the last
/// closing paren.
/// Summed per-PID rates exceed 100 on multi-core hosts, so both
/// percentages are capped to keep the sample within its domain.
fn aggregate_sample(
    username: String,
    acc: UserAccumulator,
    mem_total_kb: u64,
    now: DateTime<Utc>,
) -> UserSample {
    UserSample {
        username,
        cpu_percent: acc.cpu_percent.min(100.0),
        memory_percent: (acc.rss_kb as f64 / mem_total_kb as f64 * 100.0).min(100.0),
        process_count: acc.pids.len(),
        pids: acc.pids,
        timestamp: now,
    }
}

fn parse_pid_stat(text: &str) -> Option<(u64, u64)> {
    let rest = &text[text.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Field 14 (utime) is index 11 after pid and comm, rss is field 24.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss: i64 = fields.get(21)?.parse().ok()?;
    Some((utime + stime, rss.max(0) as u64))
}

fn parse_uid_from_status(text: &str) -> Option<u32> {
    text.lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

use crate::collectors::UserSample;
use crate::config::Config;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Memory,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Cpu, Metric::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user holding one metric above its threshold for at least the
/// configured persistence window. Re-emitted every cycle while the breach
/// continues.
#[derive(Debug, Clone, Serialize)]
pub struct PersistentUsageEvent {
    pub username: String,
    pub metric: Metric,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub current_usage: f64,
    pub peak_usage: f64,
    pub average_usage: f64,
}

impl PersistentUsageEvent {
    pub fn duration_mins(&self) -> i64 {
        self.duration_secs / 60
    }
}

#[derive(Debug, Clone, Default)]
struct MetricTrack {
    started_at: Option<DateTime<Utc>>,
    peak: f64,
    sum: f64,
    samples: u64,
}

impl MetricTrack {
    fn start(&mut self, value: f64, now: DateTime<Utc>) {
        self.started_at = Some(now);
        self.peak = value;
        self.sum = value;
        self.samples = 1;
    }

    fn average(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.sum / self.samples as f64
        }
    }
}

#[derive(Debug, Default)]
struct UserTrack {
    cpu: MetricTrack,
    memory: MetricTrack,
}

impl UserTrack {
    fn metric_mut(&mut self, metric: Metric) -> &mut MetricTrack {
        match metric {
            Metric::Cpu => &mut self.cpu,
            Metric::Memory => &mut self.memory,
        }
    }
}

/// Tracks per-user threshold breaches across cycles. CPU and memory are
/// tracked independently per user.
pub struct UsageTracker {
    users: HashMap<String, UserTrack>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    /// Feeds one cycle of samples through the state machine and returns the
    /// breaches that have lasted at least their persistence window.
    ///
    /// Comparisons are strictly greater-than: a value exactly at the
    /// threshold neither starts nor sustains a breach. A single reading at
    /// or below the threshold resets that metric's accumulation entirely,
    /// and users absent from the samples are forgotten.
    pub fn update(
        &mut self,
        samples: &[UserSample],
        cfg: &Config,
        now: DateTime<Utc>,
    ) -> Vec<PersistentUsageEvent> {
        let mut events = Vec::new();

        for sample in samples {
            let track = self.users.entry(sample.username.clone()).or_default();
            for metric in Metric::ALL {
                let value = match metric {
                    Metric::Cpu => sample.cpu_percent,
                    Metric::Memory => sample.memory_percent,
                };
                let threshold = cfg.user_threshold(&sample.username, metric);
                let metric_track = track.metric_mut(metric);

                if value > threshold {
                    match metric_track.started_at {
                        None => metric_track.start(value, now),
                        Some(started_at) => {
                            metric_track.peak = metric_track.peak.max(value);
                            metric_track.sum += value;
                            metric_track.samples += 1;

                            let elapsed_secs = now.signed_duration_since(started_at).num_seconds();
                            if elapsed_secs >= cfg.user_persistent_secs(&sample.username) as i64 {
                                events.push(PersistentUsageEvent {
                                    username: sample.username.clone(),
                                    metric,
                                    started_at,
                                    duration_secs: elapsed_secs,
                                    current_usage: value,
                                    peak_usage: metric_track.peak,
                                    average_usage: metric_track.average(),
                                });
                            }
                        }
                    }
                } else if metric_track.started_at.is_some() {
                    debug!(
                        user = %sample.username,
                        metric = %metric,
                        value,
                        "breach ended, resetting tracking"
                    );
                    *metric_track = MetricTrack::default();
                }
            }
        }

        let active: HashSet<&str> = samples.iter().map(|s| s.username.as_str()).collect();
        self.users.retain(|name, _| active.contains(name.as_str()));

        events
    }

    #[cfg(test)]
    fn is_tracking(&self, username: &str, metric: Metric) -> bool {
        self.users
            .get(username)
            .map(|t| match metric {
                Metric::Cpu => t.cpu.started_at.is_some(),
                Metric::Memory => t.memory.started_at.is_some(),
            })
            .unwrap_or(false)
    }
}

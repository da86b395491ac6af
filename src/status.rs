use crate::collectors::{SystemSample, UserSample};
use crate::tracker::PersistentUsageEvent;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemStatus {
    #[serde(rename = "Heavy Load")]
    HeavyLoad,
    #[serde(rename = "Medium Usage")]
    MediumUsage,
    #[serde(rename = "Light Usage")]
    LightUsage,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::HeavyLoad => "Heavy Load",
            SystemStatus::MediumUsage => "Medium Usage",
            SystemStatus::LightUsage => "Light Usage",
        }
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for SystemStatus {
    fn default() -> Self {
        SystemStatus::LightUsage
    }
}

/// Classifies the cycle, most severe condition first. All comparisons are
/// strictly greater-than, so a reading exactly at a boundary stays in the
/// milder class.
pub fn classify(
    system: &SystemSample,
    users: &[UserSample],
    cpu_threshold: f64,
    memory_threshold: f64,
    persistent: &[PersistentUsageEvent],
) -> SystemStatus {
    if system.cpu_percent > cpu_threshold || system.memory_percent > memory_threshold {
        return SystemStatus::HeavyLoad;
    }
    if !persistent.is_empty() {
        return SystemStatus::HeavyLoad;
    }
    if system.cpu_percent > 60.0 || system.memory_percent > 60.0 {
        return SystemStatus::MediumUsage;
    }

    // A small number of spiking users reads as an isolated incident; three
    // or more spikes without system pressure is left to the system gauges.
    let spiking = users
        .iter()
        .filter(|u| u.cpu_percent > 80.0 || u.memory_percent > 80.0)
        .count();
    if (1..=2).contains(&spiking) {
        return SystemStatus::MediumUsage;
    }

    SystemStatus::LightUsage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Metric;
    use chrono::Utc;

    fn system(cpu: f64, mem: f64) -> SystemSample {
        SystemSample {
            timestamp: Utc::now(),
            cpu_percent: cpu,
            memory_percent: mem,
            network_mbps: 0.0,
            load_avg_1: 0.5,
            load_avg_5: 0.5,
            load_avg_15: 0.5,
        }
    }

    fn user(name: &str, cpu: f64, mem: f64) -> UserSample {
        UserSample {
            username: name.to_string(),
            cpu_percent: cpu,
            memory_percent: mem,
            process_count: 1,
            pids: vec![1],
            timestamp: Utc::now(),
        }
    }

    fn event(name: &str) -> PersistentUsageEvent {
        PersistentUsageEvent {
            username: name.to_string(),
            metric: Metric::Cpu,
            started_at: Utc::now(),
            duration_secs: 3900,
            current_usage: 90.0,
            peak_usage: 95.0,
            average_usage: 91.0,
        }
    }

    #[test]
    fn system_breach_is_heavy() {
        let status = classify(&system(85.0, 10.0), &[], 80.0, 80.0, &[]);
        assert_eq!(status, SystemStatus::HeavyLoad);
        let status = classify(&system(10.0, 81.0), &[], 80.0, 80.0, &[]);
        assert_eq!(status, SystemStatus::HeavyLoad);
    }

    #[test]
    fn persistent_event_is_heavy_even_when_system_calm() {
        let status = classify(&system(10.0, 10.0), &[], 80.0, 80.0, &[event("alice")]);
        assert_eq!(status, SystemStatus::HeavyLoad);
    }

    #[test]
    fn elevated_system_is_medium() {
        let status = classify(&system(61.0, 10.0), &[], 80.0, 80.0, &[]);
        assert_eq!(status, SystemStatus::MediumUsage);
        let status = classify(&system(10.0, 70.0), &[], 80.0, 80.0, &[]);
        assert_eq!(status, SystemStatus::MediumUsage);
    }

    #[test]
    fn boundaries_are_strict() {
        assert_eq!(
            classify(&system(80.0, 80.0), &[], 80.0, 80.0, &[]),
            SystemStatus::MediumUsage
        );
        assert_eq!(
            classify(&system(60.0, 60.0), &[], 80.0, 80.0, &[]),
            SystemStatus::LightUsage
        );
    }

    #[test]
    fn one_or_two_spiking_users_is_medium() {
        let users = vec![user("alice", 85.0, 10.0)];
        assert_eq!(
            classify(&system(20.0, 20.0), &users, 80.0, 80.0, &[]),
            SystemStatus::MediumUsage
        );
        let users = vec![user("alice", 85.0, 10.0), user("bob", 10.0, 90.0)];
        assert_eq!(
            classify(&system(20.0, 20.0), &users, 80.0, 80.0, &[]),
            SystemStatus::MediumUsage
        );
    }

    #[test]
    fn three_spiking_users_fall_through_to_light() {
        let users = vec![
            user("alice", 85.0, 10.0),
            user("bob", 85.0, 10.0),
            user("carol", 85.0, 10.0),
        ];
        assert_eq!(
            classify(&system(20.0, 20.0), &users, 80.0, 80.0, &[]),
            SystemStatus::LightUsage
        );
    }

    #[test]
    fn spike_at_eighty_does_not_count() {
        let users = vec![user("alice", 80.0, 80.0)];
        assert_eq!(
            classify(&system(20.0, 20.0), &users, 80.0, 80.0, &[]),
            SystemStatus::LightUsage
        );
    }

    #[test]
    fn quiet_host_is_light() {
        assert_eq!(
            classify(&system(5.0, 30.0), &[], 80.0, 80.0, &[]),
            SystemStatus::LightUsage
        );
    }
}

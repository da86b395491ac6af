use crate::collectors::{SystemSample, UserSample};
use crate::config::Config;
use crate::status::SystemStatus;
use crate::tracker::{Metric, PersistentUsageEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Light,
    Medium,
    Heavy,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Light => "light",
            Severity::Medium => "medium",
            Severity::Heavy => "heavy",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SystemStatus> for Severity {
    fn from(status: SystemStatus) -> Self {
        match status {
            SystemStatus::HeavyLoad => Severity::Heavy,
            SystemStatus::MediumUsage => Severity::Medium,
            SystemStatus::LightUsage => Severity::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    System,
    User,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::System => "system",
            AlertKind::User => "user",
        }
    }
}

/// Everything operators need to act on one cycle's findings.
#[derive(Debug, Clone, Serialize)]
pub struct AlertDecision {
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub status: SystemStatus,
    pub message: String,
    pub primary_cause: String,
    pub user_breakdown: String,
    pub recommendations: Vec<String>,
}

/// Borrowed view of one completed monitoring cycle.
pub struct CycleContext<'a> {
    pub system: &'a SystemSample,
    pub users: &'a [UserSample],
    pub persistent: &'a [PersistentUsageEvent],
    pub status: SystemStatus,
}

/// Builds the decision for a cycle. The boolean says whether the decision
/// represents an actionable alert; the decision itself is always complete
/// so it can be rendered regardless.
pub fn decide(cfg: &Config, ctx: &CycleContext<'_>, now: DateTime<Utc>) -> (AlertDecision, bool) {
    let severity = Severity::from(ctx.status);
    let cause = primary_cause(ctx);
    let kind = if !ctx.persistent.is_empty() || !cause.is_empty() {
        AlertKind::User
    } else {
        AlertKind::System
    };
    let decision = AlertDecision {
        timestamp: now,
        kind,
        severity,
        status: ctx.status,
        message: compose_message(cfg, ctx),
        primary_cause: cause,
        user_breakdown: user_breakdown(ctx.users),
        recommendations: recommendations(cfg, ctx),
    };
    (decision, should_alert(cfg, ctx))
}

fn system_breached(cfg: &Config, system: &SystemSample) -> bool {
    system.cpu_percent > cfg.monitoring.cpu_threshold
        || system.memory_percent > cfg.monitoring.memory_threshold
}

/// Alert when the system breaches, a persistent user event exists, or any
/// user is above their effective per-user thresholds.
pub fn should_alert(cfg: &Config, ctx: &CycleContext<'_>) -> bool {
    if system_breached(cfg, ctx.system) || !ctx.persistent.is_empty() {
        return true;
    }
    ctx.users.iter().any(|u| {
        u.cpu_percent > cfg.user_threshold(&u.username, Metric::Cpu)
            || u.memory_percent > cfg.user_threshold(&u.username, Metric::Memory)
    })
}

/// The first persistent event wins; otherwise the top spiking user.
fn primary_cause(ctx: &CycleContext<'_>) -> String {
    if let Some(event) = ctx.persistent.first() {
        return format!(
            "{} ({}: {:.1}% for {}m)",
            event.username,
            event.metric,
            event.current_usage,
            event.duration_mins()
        );
    }
    if let Some(top) = ctx
        .users
        .first()
        .filter(|u| u.cpu_percent > 80.0 || u.memory_percent > 80.0)
    {
        return format!(
            "{} (CPU: {:.1}%, Memory: {:.1}%)",
            top.username, top.cpu_percent, top.memory_percent
        );
    }
    String::new()
}

/// Additive recommendations, one per observed condition. Never empty: a
/// generic line covers the case where nothing specific applies.
fn recommendations(cfg: &Config, ctx: &CycleContext<'_>) -> Vec<String> {
    let mut out = Vec::new();
    if ctx.system.cpu_percent > cfg.monitoring.cpu_threshold {
        out.push("System CPU usage is high - check for runaway processes".to_string());
    }
    if ctx.system.memory_percent > cfg.monitoring.memory_threshold {
        out.push("System memory usage is high - check for memory leaks".to_string());
    }
    if ctx.system.load_avg_1 > 2.0 {
        out.push("High load average detected - system may be overloaded".to_string());
    }
    for user in ctx.users {
        if user.process_count > 20 {
            out.push(format!(
                "User {} has {} processes - check for process spawning issues",
                user.username, user.process_count
            ));
        }
    }
    for event in ctx.persistent {
        out.push(format!(
            "User {} has sustained high {} usage - investigate immediately",
            event.username, event.metric
        ));
    }
    if out.is_empty() {
        out.push("Monitor system performance and user activity".to_string());
    }
    out
}

fn compose_message(cfg: &Config, ctx: &CycleContext<'_>) -> String {
    let mut lines = vec![
        format!("System status: {}", ctx.status),
        format!(
            "CPU: {:.1}% (threshold {:.0}%), Memory: {:.1}% (threshold {:.0}%), Load: {:.2}",
            ctx.system.cpu_percent,
            cfg.monitoring.cpu_threshold,
            ctx.system.memory_percent,
            cfg.monitoring.memory_threshold,
            ctx.system.load_avg_1
        ),
    ];
    let cause = primary_cause(ctx);
    if !cause.is_empty() {
        lines.push(format!("Primary cause: {cause}"));
    }
    for user in ctx.users.iter().take(5) {
        let persistent = ctx
            .persistent
            .iter()
            .any(|e| e.username == user.username)
            .then_some(" (PERSISTENT)")
            .unwrap_or("");
        lines.push(format!(
            "  {}: CPU {:.1}%, Memory {:.1}%, {} processes{}",
            user.username, user.cpu_percent, user.memory_percent, user.process_count, persistent
        ));
    }
    lines.join("\n")
}

/// Compact per-user line for storage, `user:cpu:mem:procs` separated by
/// semicolons.
fn user_breakdown(users: &[UserSample]) -> String {
    users
        .iter()
        .map(|u| {
            format!(
                "{}:{:.1}:{:.1}:{}",
                u.username, u.cpu_percent, u.memory_percent, u.process_count
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status;

    fn system(cpu: f64, mem: f64, load: f64) -> SystemSample {
        SystemSample {
            timestamp: Utc::now(),
            cpu_percent: cpu,
            memory_percent: mem,
            network_mbps: 1.0,
            load_avg_1: load,
            load_avg_5: load,
            load_avg_15: load,
        }
    }

    fn user(name: &str, cpu: f64, mem: f64, procs: usize) -> UserSample {
        UserSample {
            username: name.to_string(),
            cpu_percent: cpu,
            memory_percent: mem,
            process_count: procs,
            pids: (0..procs as i32).collect(),
            timestamp: Utc::now(),
        }
    }

    fn event(name: &str, current: f64, duration_secs: i64) -> PersistentUsageEvent {
        PersistentUsageEvent {
            username: name.to_string(),
            metric: Metric::Cpu,
            started_at: Utc::now(),
            duration_secs,
            current_usage: current,
            peak_usage: current,
            average_usage: current,
        }
    }

    #[test]
    fn quiet_cycle_does_not_alert() {
        let cfg = Config::default();
        let sys = system(10.0, 20.0, 0.3);
        let users = vec![user("alice", 10.0, 5.0, 2)];
        let ctx = CycleContext {
            system: &sys,
            users: &users,
            persistent: &[],
            status: SystemStatus::LightUsage,
        };
        let (decision, alert) = decide(&cfg, &ctx, Utc::now());
        assert!(!alert);
        assert_eq!(decision.severity, Severity::Light);
        assert_eq!(
            decision.recommendations,
            vec!["Monitor system performance and user activity".to_string()]
        );
    }

    #[test]
    fn user_over_threshold_alerts_without_system_breach() {
        let cfg = Config::default();
        let sys = system(30.0, 30.0, 0.5);
        let users = vec![user("alice", 85.0, 10.0, 4)];
        let ctx = CycleContext {
            system: &sys,
            users: &users,
            persistent: &[],
            status: SystemStatus::MediumUsage,
        };
        let (decision, alert) = decide(&cfg, &ctx, Utc::now());
        assert!(alert);
        assert_eq!(decision.kind, AlertKind::User);
        assert_eq!(decision.severity, Severity::Medium);
        assert!(decision.primary_cause.contains("alice"));
    }

    #[test]
    fn recommendations_are_additive() {
        let cfg = Config::default();
        let sys = system(90.0, 95.0, 3.5);
        let users = vec![user("spawner", 50.0, 10.0, 42)];
        let events = vec![event("spawner", 90.0, 3900)];
        let ctx = CycleContext {
            system: &sys,
            users: &users,
            persistent: &events,
            status: SystemStatus::HeavyLoad,
        };
        let (decision, alert) = decide(&cfg, &ctx, Utc::now());
        assert!(alert);
        let recs = decision.recommendations.join("\n");
        assert!(recs.contains("runaway processes"));
        assert!(recs.contains("memory leaks"));
        assert!(recs.contains("load average"));
        assert!(recs.contains("42 processes"));
        assert!(recs.contains("sustained high cpu"));
        assert_eq!(decision.recommendations.len(), 5);
    }

    #[test]
    fn persistent_event_beats_spiking_user_as_cause() {
        let cfg = Config::default();
        let sys = system(50.0, 50.0, 1.0);
        let users = vec![user("bob", 95.0, 10.0, 3)];
        let events = vec![event("alice", 88.0, 4200)];
        let ctx = CycleContext {
            system: &sys,
            users: &users,
            persistent: &events,
            status: SystemStatus::HeavyLoad,
        };
        let (decision, _) = decide(&cfg, &ctx, Utc::now());
        assert_eq!(decision.primary_cause, "alice (cpu: 88.0% for 70m)");
    }

    #[test]
    fn breakdown_is_compact_and_ordered() {
        let users = vec![user("alice", 90.5, 12.0, 3), user("bob", 10.0, 45.25, 1)];
        assert_eq!(
            user_breakdown(&users),
            "alice:90.5:12.0:3;bob:10.0:45.2:1"
        );
    }

    #[test]
    fn sustained_user_breach_end_to_end() {
        // CPU 85% against an 80% threshold, alice at 90% CPU for 65 minutes
        // with a 60-minute persistence window.
        let cfg = Config::default();
        let sys = system(85.0, 40.0, 1.2);
        let users = vec![user("alice", 90.0, 15.0, 6)];
        let events = vec![event("alice", 90.0, 65 * 60)];
        let status = status::classify(
            &sys,
            &users,
            cfg.monitoring.cpu_threshold,
            cfg.monitoring.memory_threshold,
            &events,
        );
        assert_eq!(status, SystemStatus::HeavyLoad);

        let ctx = CycleContext {
            system: &sys,
            users: &users,
            persistent: &events,
            status,
        };
        let (decision, alert) = decide(&cfg, &ctx, Utc::now());
        assert!(alert);
        assert_eq!(decision.severity, Severity::Heavy);
        assert_eq!(decision.kind, AlertKind::User);
        assert!(decision.primary_cause.contains("alice"));
        assert!(decision.primary_cause.contains("65m"));
        assert!(!decision.recommendations.is_empty());
    }
}

use crate::alerts::AlertDecision;
use crate::collectors::{SystemSample, UserSample};
use crate::status::SystemStatus;
use crate::tracker::PersistentUsageEvent;

/// Last completed cycle plus daemon counters, shared between the monitor
/// loop and the HTTP surface behind an RwLock.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_cycle_unix: i64,
    pub host_name: Option<String>,
    pub system: Option<SystemSample>,
    pub disk_percent: f64,
    pub uptime_secs: u64,
    pub users: Vec<UserSample>,
    pub status: SystemStatus,
    pub persistent: Vec<PersistentUsageEvent>,
    pub last_alert: Option<AlertDecision>,
    pub cycle_count: u64,
    pub cycle_errors: u64,
}

impl State {
    pub fn new(started_at_unix: i64) -> Self {
        Self {
            started_at_unix,
            ..Self::default()
        }
    }

    pub fn apply_cycle(
        &mut self,
        now_unix: i64,
        system: SystemSample,
        users: Vec<UserSample>,
        status: SystemStatus,
        persistent: Vec<PersistentUsageEvent>,
    ) {
        self.last_cycle_unix = now_unix;
        self.system = Some(system);
        self.users = users;
        self.status = status;
        self.persistent = persistent;
        self.cycle_count += 1;
    }

    pub fn record_alert(&mut self, decision: AlertDecision) {
        self.last_alert = Some(decision);
    }

    pub fn record_cycle_error(&mut self) {
        self.cycle_errors += 1;
    }
}

use crate::state::State;
use crate::status::SystemStatus;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const STATUSES: [SystemStatus; 3] = [
    SystemStatus::HeavyLoad,
    SystemStatus::MediumUsage,
    SystemStatus::LightUsage,
];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub usagemon_cpu_usage_percent: Gauge,
    pub usagemon_memory_usage_percent: Gauge,
    pub usagemon_network_mbps: Gauge,
    pub usagemon_load_average: GaugeVec,
    pub usagemon_user_cpu_percent: GaugeVec,
    pub usagemon_user_memory_percent: GaugeVec,
    pub usagemon_user_process_count: GaugeVec,
    pub usagemon_tracked_user_count: Gauge,
    pub usagemon_persistent_event_count: Gauge,
    pub usagemon_system_status: GaugeVec,
    pub usagemon_uptime_seconds: Gauge,
    pub usagemon_last_cycle_timestamp_seconds: Gauge,
    pub usagemon_cycles_total: Counter,
    pub usagemon_cycle_errors_total: CounterVec,
    pub usagemon_alerts_total: CounterVec,
    pub usagemon_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let usagemon_cpu_usage_percent = Gauge::with_opts(opts!(
            "usagemon_cpu_usage_percent",
            "Host CPU busy share in percent (0..100)"
        ))?;
        let usagemon_memory_usage_percent = Gauge::with_opts(opts!(
            "usagemon_memory_usage_percent",
            "Host memory usage after subtracting buffers and cache, in percent"
        ))?;
        let usagemon_network_mbps = Gauge::with_opts(opts!(
            "usagemon_network_mbps",
            "Combined rx+tx throughput over non-loopback interfaces in MB/s"
        ))?;
        let usagemon_load_average = GaugeVec::new(
            opts!("usagemon_load_average", "Load average by window"),
            &["window"],
        )?;
        let usagemon_user_cpu_percent = GaugeVec::new(
            opts!(
                "usagemon_user_cpu_percent",
                "Aggregate CPU usage of tracked users in percent"
            ),
            &["username"],
        )?;
        let usagemon_user_memory_percent = GaugeVec::new(
            opts!(
                "usagemon_user_memory_percent",
                "Aggregate RSS of tracked users as a share of total memory"
            ),
            &["username"],
        )?;
        let usagemon_user_process_count = GaugeVec::new(
            opts!(
                "usagemon_user_process_count",
                "Number of processes owned by tracked users"
            ),
            &["username"],
        )?;
        let usagemon_tracked_user_count = Gauge::with_opts(opts!(
            "usagemon_tracked_user_count",
            "Users tracked in the last cycle"
        ))?;
        let usagemon_persistent_event_count = Gauge::with_opts(opts!(
            "usagemon_persistent_event_count",
            "Persistent usage events emitted in the last cycle"
        ))?;
        let usagemon_system_status = GaugeVec::new(
            opts!(
                "usagemon_system_status",
                "Current system status, 1 for the active label"
            ),
            &["status"],
        )?;
        let usagemon_uptime_seconds = Gauge::with_opts(opts!(
            "usagemon_uptime_seconds",
            "Daemon uptime in seconds"
        ))?;
        let usagemon_last_cycle_timestamp_seconds = Gauge::with_opts(opts!(
            "usagemon_last_cycle_timestamp_seconds",
            "Unix timestamp of the last completed cycle"
        ))?;
        let usagemon_cycles_total = Counter::with_opts(opts!(
            "usagemon_cycles_total",
            "Completed monitoring cycles"
        ))?;
        let usagemon_cycle_errors_total = CounterVec::new(
            opts!(
                "usagemon_cycle_errors_total",
                "Cycle errors total by stage"
            ),
            &["stage"],
        )?;
        let usagemon_alerts_total = CounterVec::new(
            opts!("usagemon_alerts_total", "Raised alerts total by severity"),
            &["severity"],
        )?;
        let usagemon_scrape_count_total = Counter::with_opts(opts!(
            "usagemon_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &usagemon_cpu_usage_percent)?;
        register(&registry, &usagemon_memory_usage_percent)?;
        register(&registry, &usagemon_network_mbps)?;
        register(&registry, &usagemon_load_average)?;
        register(&registry, &usagemon_user_cpu_percent)?;
        register(&registry, &usagemon_user_memory_percent)?;
        register(&registry, &usagemon_user_process_count)?;
        register(&registry, &usagemon_tracked_user_count)?;
        register(&registry, &usagemon_persistent_event_count)?;
        register(&registry, &usagemon_system_status)?;
        register(&registry, &usagemon_uptime_seconds)?;
        register(&registry, &usagemon_last_cycle_timestamp_seconds)?;
        register(&registry, &usagemon_cycles_total)?;
        register(&registry, &usagemon_cycle_errors_total)?;
        register(&registry, &usagemon_alerts_total)?;
        register(&registry, &usagemon_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            usagemon_cpu_usage_percent,
            usagemon_memory_usage_percent,
            usagemon_network_mbps,
            usagemon_load_average,
            usagemon_user_cpu_percent,
            usagemon_user_memory_percent,
            usagemon_user_process_count,
            usagemon_tracked_user_count,
            usagemon_persistent_event_count,
            usagemon_system_status,
            usagemon_uptime_seconds,
            usagemon_last_cycle_timestamp_seconds,
            usagemon_cycles_total,
            usagemon_cycle_errors_total,
            usagemon_alerts_total,
            usagemon_scrape_count_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        if let Some(system) = &state.system {
            self.usagemon_cpu_usage_percent.set(system.cpu_percent);
            self.usagemon_memory_usage_percent
                .set(system.memory_percent);
            self.usagemon_network_mbps.set(system.network_mbps);
            self.usagemon_load_average
                .with_label_values(&["1m"])
                .set(system.load_avg_1);
            self.usagemon_load_average
                .with_label_values(&["5m"])
                .set(system.load_avg_5);
            self.usagemon_load_average
                .with_label_values(&["15m"])
                .set(system.load_avg_15);
        }

        self.usagemon_user_cpu_percent.reset();
        self.usagemon_user_memory_percent.reset();
        self.usagemon_user_process_count.reset();
        for user in &state.users {
            self.usagemon_user_cpu_percent
                .with_label_values(&[&user.username])
                .set(user.cpu_percent);
            self.usagemon_user_memory_percent
                .with_label_values(&[&user.username])
                .set(user.memory_percent);
            self.usagemon_user_process_count
                .with_label_values(&[&user.username])
                .set(user.process_count as f64);
        }
        self.usagemon_tracked_user_count
            .set(state.users.len() as f64);
        self.usagemon_persistent_event_count
            .set(state.persistent.len() as f64);

        for status in STATUSES {
            self.usagemon_system_status
                .with_label_values(&[status.as_str()])
                .set(if status == state.status { 1.0 } else { 0.0 });
        }

        self.usagemon_last_cycle_timestamp_seconds
            .set(state.last_cycle_unix as f64);
        let now = now_unix();
        let uptime = now.saturating_sub(state.started_at_unix) as f64;
        self.usagemon_uptime_seconds.set(uptime);
    }

    pub fn inc_cycle(&self) {
        self.usagemon_cycles_total.inc();
    }

    pub fn inc_cycle_error(&self, stage: &str) {
        self.usagemon_cycle_errors_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn inc_alert(&self, severity: &str) {
        self.usagemon_alerts_total
            .with_label_values(&[severity])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.usagemon_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{SystemSample, UserSample};
    use chrono::Utc;

    #[test]
    fn status_gauge_marks_exactly_one_label() {
        let metrics = Metrics::new().expect("metrics init");
        let mut state = State::new(0);
        state.status = SystemStatus::HeavyLoad;
        metrics.update_from_state(&state);

        let text = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(text.contains("usagemon_system_status{status=\"Heavy Load\"} 1"));
        assert!(text.contains("usagemon_system_status{status=\"Light Usage\"} 0"));
    }

    #[test]
    fn user_gauges_reset_between_cycles() {
        let metrics = Metrics::new().expect("metrics init");
        let mut state = State::new(0);
        state.system = Some(SystemSample {
            timestamp: Utc::now(),
            cpu_percent: 10.0,
            memory_percent: 20.0,
            network_mbps: 0.1,
            load_avg_1: 0.5,
            load_avg_5: 0.4,
            load_avg_15: 0.3,
        });
        state.users = vec![UserSample {
            username: "alice".to_string(),
            cpu_percent: 55.0,
            memory_percent: 5.0,
            process_count: 2,
            pids: vec![1, 2],
            timestamp: Utc::now(),
        }];
        metrics.update_from_state(&state);

        let text = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(text.contains("usagemon_user_cpu_percent{username=\"alice\"} 55"));

        state.users.clear();
        metrics.update_from_state(&state);
        let text = String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8");
        assert!(!text.contains("username=\"alice\""));
        assert!(text.contains("usagemon_tracked_user_count 0"));
    }
}

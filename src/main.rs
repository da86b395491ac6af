mod alerts;
mod collectors;
mod config;
mod http;
mod metrics;
mod notify;
mod state;
mod status;
mod storage;
mod tracker;
mod ws;

use alerts::CycleContext;
use axum::serve;
use chrono::Utc;
use clap::Parser;
use collectors::system::SystemSampler;
use collectors::users::{UserSampler, UserTable};
use config::Config;
use metrics::Metrics;
use notify::EmailNotifier;
use state::State;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use storage::Storage;
use sysinfo::{DiskExt, SystemExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracker::UsageTracker;
use ws::WsHub;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Parser, Debug)]
#[command(name = "usagemon")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "/etc/usagemon/config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        check_interval_secs = cfg.monitoring.check_interval_secs,
        data_dir = %cfg.data_dir,
        "starting usagemon"
    );

    let storage = match Storage::new(Path::new(&cfg.data_dir)) {
        Ok(s) => Arc::new(s),
        Err(err) => {
            error!(error = %err, "failed to open storage");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let now = now_unix();
    let shared_state = Arc::new(RwLock::new(State::new(now)));
    let shared_cfg = Arc::new(RwLock::new(cfg.clone()));
    let hub = WsHub::new(64);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let hub = hub.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state, hub);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let maintenance_task = {
        let shared_cfg = shared_cfg.clone();
        let storage = storage.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let retain = shared_cfg.read().await.retain_period();
                        let cutoff = Utc::now()
                            - chrono::Duration::seconds(retain.as_secs() as i64);
                        if let Err(err) = storage.cleanup_before(cutoff) {
                            warn!(error = %err, "history cleanup failed");
                        }
                        match storage.stats() {
                            Ok(stats) => info!(
                                system_samples = stats.system_samples,
                                user_samples = stats.user_samples,
                                alerts = stats.alerts,
                                persistent_episodes = stats.persistent_episodes,
                                "storage totals after cleanup"
                            ),
                            Err(err) => warn!(error = %err, "failed to read storage totals"),
                        }
                    }
                }
            }
        })
    };

    let push_task = {
        let shared_cfg = shared_cfg.clone();
        let shared_state = shared_state.clone();
        let hub = hub.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let interval = shared_cfg.read().await.push_interval();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if hub.client_count() == 0 {
                            continue;
                        }
                        let guard = shared_state.read().await;
                        if let Some(system) = &guard.system {
                            hub.broadcast_system_update(
                                system.cpu_percent,
                                system.memory_percent,
                                guard.disk_percent,
                                guard.uptime_secs,
                            );
                        }
                    }
                }
            }
        })
    };

    let monitor_task = {
        let shared_cfg = shared_cfg.clone();
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let storage = storage.clone();
        let hub = hub.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut system = sysinfo::System::new();
            let mut system_sampler = SystemSampler::new();
            let mut user_sampler = UserSampler::new();
            let mut tracker = UsageTracker::new();
            let interval = shared_cfg.read().await.check_interval();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("shutdown signal received, stopping monitor loop");
                        break;
                    }
                    _ = ticker.tick() => {
                        let cfg = shared_cfg.read().await.clone();
                        system.refresh_users_list();
                        system.refresh_disks_list();
                        system.refresh_disks();
                        let table = UserTable::from_system(&system);
                        let host_name = system.host_name();
                        let now = Utc::now();

                        let system_sample = match system_sampler.sample() {
                            Ok(sample) => sample,
                            Err(err) => {
                                warn!(error = %err, "system sampling failed");
                                metrics.inc_cycle_error("system");
                                shared_state.write().await.record_cycle_error();
                                continue;
                            }
                        };
                        let user_samples = match user_sampler.sample_users(
                            &table,
                            &cfg.user_filtering,
                            now,
                        ) {
                            Ok(samples) => samples,
                            Err(err) => {
                                warn!(error = %err, "user sampling failed");
                                metrics.inc_cycle_error("users");
                                shared_state.write().await.record_cycle_error();
                                continue;
                            }
                        };

                        let events = tracker.update(&user_samples, &cfg, now);
                        let status = status::classify(
                            &system_sample,
                            &user_samples,
                            cfg.monitoring.cpu_threshold,
                            cfg.monitoring.memory_threshold,
                            &events,
                        );

                        if let Err(err) = storage.store_system_sample(&system_sample) {
                            warn!(error = %err, "failed to store system sample");
                            metrics.inc_cycle_error("storage");
                        }
                        if let Err(err) = storage.store_user_samples(&user_samples) {
                            warn!(error = %err, "failed to store user samples");
                            metrics.inc_cycle_error("storage");
                        }
                        for event in &events {
                            if let Err(err) = storage.record_persistent_event(event, now) {
                                warn!(error = %err, "failed to record persistent episode");
                                metrics.inc_cycle_error("storage");
                            }
                        }
                        let active: Vec<(String, &'static str)> = events
                            .iter()
                            .map(|e| (e.username.clone(), e.metric.as_str()))
                            .collect();
                        if let Err(err) = storage.resolve_absent_persistent(&active, now) {
                            warn!(error = %err, "failed to resolve persistent episodes");
                            metrics.inc_cycle_error("storage");
                        }

                        let ctx = CycleContext {
                            system: &system_sample,
                            users: &user_samples,
                            persistent: &events,
                            status,
                        };
                        let (decision, raise) = alerts::decide(&cfg, &ctx, now);
                        if raise {
                            info!(
                                status = %status,
                                severity = %decision.severity,
                                cause = %decision.primary_cause,
                                "alert raised"
                            );
                            if let Err(err) = storage.store_alert(&decision) {
                                warn!(error = %err, "failed to store alert");
                                metrics.inc_cycle_error("storage");
                            }
                            metrics.inc_alert(decision.severity.as_str());
                            hub.broadcast_alert(&decision);

                            if cfg.is_email_enabled() {
                                let notifier = EmailNotifier::new(cfg.email.clone());
                                let host = host_name.as_deref().unwrap_or("unknown");
                                if let Err(err) =
                                    notifier.send_alert(host, &decision, &ctx).await
                                {
                                    warn!(error = %err, "failed to send alert email");
                                    metrics.inc_cycle_error("notify");
                                }
                            }
                        }
                        drop(ctx);

                        let snapshot = {
                            let mut guard = shared_state.write().await;
                            guard.host_name = host_name;
                            guard.disk_percent = worst_disk_percent(&system);
                            guard.uptime_secs = system.uptime();
                            guard.apply_cycle(
                                now.timestamp(),
                                system_sample,
                                user_samples,
                                status,
                                events,
                            );
                            if raise {
                                guard.record_alert(decision);
                            }
                            guard.clone()
                        };
                        metrics.update_from_state(&snapshot);
                        metrics.inc_cycle();
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = monitor_task.await;
    let _ = push_task.await;
    let _ = maintenance_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Usage share of the fullest mounted disk, for the realtime feed.
fn worst_disk_percent(system: &sysinfo::System) -> f64 {
    system
        .disks()
        .iter()
        .map(|d| {
            let total = d.total_space();
            if total == 0 {
                return 0.0;
            }
            let used = total.saturating_sub(d.available_space());
            used as f64 / total as f64 * 100.0
        })
        .fold(0.0_f64, f64::max)
}

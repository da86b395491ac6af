use crate::alerts::AlertDecision;
use crate::collectors::{SystemSample, UserSample};
use crate::tracker::PersistentUsageEvent;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create data dir {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("storage lock poisoned")]
    Lock,
}

/// Alert row as read back from the database.
#[derive(Debug, Clone)]
pub struct StoredAlert {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub severity: String,
    pub status: String,
    pub message: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub system_samples: i64,
    pub user_samples: i64,
    pub alerts: i64,
    pub persistent_episodes: i64,
}

/// SQLite-backed history of samples, alerts and persistent-usage episodes.
/// The connection is wrapped in a mutex; every caller takes short
/// transactions.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn new(data_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir).map_err(|source| StorageError::CreateDir {
            path: data_dir.display().to_string(),
            source,
        })?;
        Self::open(&data_dir.join("usagemon.db"))
    }

    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "storage opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Lock)
    }

    pub fn store_system_sample(&self, sample: &SystemSample) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO system_metrics \
             (timestamp, cpu_percent, memory_percent, network_mbps, load_avg_1, load_avg_5, load_avg_15) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sample.timestamp,
                sample.cpu_percent,
                sample.memory_percent,
                sample.network_mbps,
                sample.load_avg_1,
                sample.load_avg_5,
                sample.load_avg_15,
            ],
        )?;
        Ok(())
    }

    pub fn store_user_samples(&self, samples: &[UserSample]) -> Result<(), StorageError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_metrics \
                 (timestamp, username, cpu_percent, memory_percent, process_count, pids) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for sample in samples {
                let pids = sample
                    .pids
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                stmt.execute(params![
                    sample.timestamp,
                    sample.username,
                    sample.cpu_percent,
                    sample.memory_percent,
                    sample.process_count as i64,
                    pids,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn store_alert(&self, decision: &AlertDecision) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO alerts \
             (timestamp, kind, severity, status, message, primary_cause, user_breakdown, recommendations) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                decision.timestamp,
                decision.kind.as_str(),
                decision.severity.as_str(),
                decision.status.as_str(),
                decision.message,
                decision.primary_cause,
                decision.user_breakdown,
                decision.recommendations.join("\n"),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn resolve_alert(&self, id: i64, now: DateTime<Utc>) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE alerts SET resolved = 1, resolved_at = ?1 WHERE id = ?2 AND resolved = 0",
            params![now, id],
        )?;
        Ok(())
    }

    /// Upserts the open episode for a user/metric pair. The row is created
    /// the first time a breach crosses the persistence bar and updated in
    /// place while it continues.
    pub fn record_persistent_event(
        &self,
        event: &PersistentUsageEvent,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM persistent_users \
                 WHERE username = ?1 AND metric = ?2 AND resolved = 0",
                params![event.username, event.metric.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE persistent_users \
                     SET last_seen = ?1, peak_usage = ?2, average_usage = ?3 \
                     WHERE id = ?4",
                    params![now, event.peak_usage, event.average_usage, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO persistent_users \
                     (username, metric, started_at, last_seen, peak_usage, average_usage) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        event.username,
                        event.metric.as_str(),
                        event.started_at,
                        now,
                        event.peak_usage,
                        event.average_usage,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Marks open episodes resolved when their user/metric pair is absent
    /// from the current cycle's events.
    pub fn resolve_absent_persistent(
        &self,
        active: &[(String, &'static str)],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let open = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, username, metric FROM persistent_users WHERE resolved = 0",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let conn = self.lock()?;
        for (id, username, metric) in open {
            let still_active = active
                .iter()
                .any(|(u, m)| *u == username && *m == metric);
            if !still_active {
                conn.execute(
                    "UPDATE persistent_users SET resolved = 1, resolved_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
            }
        }
        Ok(())
    }

    pub fn open_persistent_count(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM persistent_users WHERE resolved = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn recent_system_samples(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemSample>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, cpu_percent, memory_percent, network_mbps, \
                    load_avg_1, load_avg_5, load_avg_15 \
             FROM system_metrics WHERE timestamp >= ?1 ORDER BY timestamp",
        )?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok(SystemSample {
                    timestamp: row.get(0)?,
                    cpu_percent: row.get(1)?,
                    memory_percent: row.get(2)?,
                    network_mbps: row.get(3)?,
                    load_avg_1: row.get(4)?,
                    load_avg_5: row.get(5)?,
                    load_avg_15: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_user_samples(
        &self,
        since: DateTime<Utc>,
        username: Option<&str>,
    ) -> Result<Vec<UserSample>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, username, cpu_percent, memory_percent, process_count, pids \
             FROM user_metrics \
             WHERE timestamp >= ?1 AND (?2 IS NULL OR username = ?2) \
             ORDER BY timestamp",
        )?;
        let rows = stmt
            .query_map(params![since, username], |row| {
                let pids_text: String = row.get(5)?;
                let pids = pids_text
                    .split(',')
                    .filter_map(|p| p.parse().ok())
                    .collect();
                Ok(UserSample {
                    timestamp: row.get(0)?,
                    username: row.get(1)?,
                    cpu_percent: row.get(2)?,
                    memory_percent: row.get(3)?,
                    process_count: row.get::<_, i64>(4)? as usize,
                    pids,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_alerts(
        &self,
        since: DateTime<Utc>,
        resolved: Option<bool>,
    ) -> Result<Vec<StoredAlert>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, kind, severity, status, message, resolved \
             FROM alerts \
             WHERE timestamp >= ?1 AND (?2 IS NULL OR resolved = ?2) \
             ORDER BY timestamp DESC",
        )?;
        let rows = stmt
            .query_map(params![since, resolved], |row| {
                Ok(StoredAlert {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    kind: row.get(2)?,
                    severity: row.get(3)?,
                    status: row.get(4)?,
                    message: row.get(5)?,
                    resolved: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Row counts per table, for the maintenance log line.
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.lock()?;
        let count = |table: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
        };
        Ok(StorageStats {
            system_samples: count("system_metrics")?,
            user_samples: count("user_metrics")?,
            alerts: count("alerts")?,
            persistent_episodes: count("persistent_users")?,
        })
    }

    /// Deletes history older than the cutoff and compacts the file.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let conn = self.lock()?;
        let mut removed = 0usize;
        removed += conn.execute(
            "DELETE FROM system_metrics WHERE timestamp < ?1",
            params![cutoff],
        )?;
        removed += conn.execute(
            "DELETE FROM user_metrics WHERE timestamp < ?1",
            params![cutoff],
        )?;
        removed += conn.execute(
            "DELETE FROM alerts WHERE timestamp < ?1 AND resolved = 1",
            params![cutoff],
        )?;
        removed += conn.execute(
            "DELETE FROM persistent_users WHERE resolved = 1 AND last_seen < ?1",
            params![cutoff],
        )?;
        conn.execute_batch("VACUUM")?;
        info!(removed, "old history cleaned up");
        Ok(removed as u64)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS system_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    cpu_percent REAL NOT NULL,
    memory_percent REAL NOT NULL,
    network_mbps REAL NOT NULL,
    load_avg_1 REAL NOT NULL,
    load_avg_5 REAL NOT NULL,
    load_avg_15 REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_system_metrics_timestamp ON system_metrics(timestamp);

CREATE TABLE IF NOT EXISTS user_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    username TEXT NOT NULL,
    cpu_percent REAL NOT NULL,
    memory_percent REAL NOT NULL,
    process_count INTEGER NOT NULL,
    pids TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_metrics_timestamp ON user_metrics(timestamp);
CREATE INDEX IF NOT EXISTS idx_user_metrics_username ON user_metrics(username);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    primary_cause TEXT NOT NULL,
    user_breakdown TEXT NOT NULL,
    recommendations TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp);

CREATE TABLE IF NOT EXISTS persistent_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    metric TEXT NOT NULL,
    started_at TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    peak_usage REAL NOT NULL,
    average_usage REAL NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_persistent_users_username ON persistent_users(username);
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, Severity};
    use crate::status::SystemStatus;
    use crate::tracker::Metric;
    use chrono::Duration;

    fn open_temp() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).expect("open storage");
        (dir, storage)
    }

    fn system_sample(at: DateTime<Utc>) -> SystemSample {
        SystemSample {
            timestamp: at,
            cpu_percent: 42.5,
            memory_percent: 61.0,
            network_mbps: 1.25,
            load_avg_1: 0.9,
            load_avg_5: 0.8,
            load_avg_15: 0.7,
        }
    }

    fn user_sample(name: &str, at: DateTime<Utc>) -> UserSample {
        UserSample {
            username: name.to_string(),
            cpu_percent: 85.0,
            memory_percent: 12.0,
            process_count: 3,
            pids: vec![101, 102, 103],
            timestamp: at,
        }
    }

    fn event(name: &str) -> PersistentUsageEvent {
        PersistentUsageEvent {
            username: name.to_string(),
            metric: Metric::Cpu,
            started_at: Utc::now() - Duration::minutes(65),
            duration_secs: 65 * 60,
            current_usage: 90.0,
            peak_usage: 95.0,
            average_usage: 91.0,
        }
    }

    fn decision(at: DateTime<Utc>) -> AlertDecision {
        AlertDecision {
            timestamp: at,
            kind: AlertKind::System,
            severity: Severity::Heavy,
            status: SystemStatus::HeavyLoad,
            message: "System status: Heavy Load".to_string(),
            primary_cause: "alice (cpu: 90.0% for 65m)".to_string(),
            user_breakdown: "alice:90.0:12.0:3".to_string(),
            recommendations: vec!["investigate".to_string()],
        }
    }

    #[test]
    fn system_samples_round_trip() {
        let (_dir, storage) = open_temp();
        let now = Utc::now();
        storage
            .store_system_sample(&system_sample(now))
            .expect("store");
        let rows = storage
            .recent_system_samples(now - Duration::minutes(1))
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cpu_percent, 42.5);
        assert!(storage
            .recent_system_samples(now + Duration::minutes(1))
            .expect("query")
            .is_empty());
    }

    #[test]
    fn user_samples_filter_by_username() {
        let (_dir, storage) = open_temp();
        let now = Utc::now();
        storage
            .store_user_samples(&[user_sample("alice", now), user_sample("bob", now)])
            .expect("store");
        let all = storage
            .recent_user_samples(now - Duration::minutes(1), None)
            .expect("query");
        assert_eq!(all.len(), 2);
        let alice = storage
            .recent_user_samples(now - Duration::minutes(1), Some("alice"))
            .expect("query");
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].pids, vec![101, 102, 103]);
    }

    #[test]
    fn alerts_store_and_resolve() {
        let (_dir, storage) = open_temp();
        let now = Utc::now();
        let id = storage.store_alert(&decision(now)).expect("store");
        let since = now - Duration::minutes(1);
        let alerts = storage.recent_alerts(since, None).expect("query");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, id);
        assert!(!alerts[0].resolved);

        storage.resolve_alert(id, now).expect("resolve");
        let alerts = storage.recent_alerts(since, Some(true)).expect("query");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].resolved);
        assert!(storage
            .recent_alerts(since, Some(false))
            .expect("query")
            .is_empty());
    }

    #[test]
    fn stats_counts_rows_per_table() {
        let (_dir, storage) = open_temp();
        let now = Utc::now();
        storage
            .store_system_sample(&system_sample(now))
            .expect("store system");
        storage
            .store_user_samples(&[user_sample("alice", now)])
            .expect("store users");
        storage.store_alert(&decision(now)).expect("store alert");
        let stats = storage.stats().expect("stats");
        assert_eq!(stats.system_samples, 1);
        assert_eq!(stats.user_samples, 1);
        assert_eq!(stats.alerts, 1);
        assert_eq!(stats.persistent_episodes, 0);
    }

    #[test]
    fn persistent_episode_upserts_then_resolves() {
        let (_dir, storage) = open_temp();
        let now = Utc::now();
        storage
            .record_persistent_event(&event("alice"), now)
            .expect("insert");
        storage
            .record_persistent_event(&event("alice"), now + Duration::minutes(1))
            .expect("update");
        assert_eq!(storage.open_persistent_count().expect("count"), 1);

        storage
            .resolve_absent_persistent(&[], now + Duration::minutes(2))
            .expect("resolve");
        assert_eq!(storage.open_persistent_count().expect("count"), 0);
    }

    #[test]
    fn resolve_skips_still_active_episodes() {
        let (_dir, storage) = open_temp();
        let now = Utc::now();
        storage
            .record_persistent_event(&event("alice"), now)
            .expect("insert");
        storage
            .record_persistent_event(&event("bob"), now)
            .expect("insert");
        storage
            .resolve_absent_persistent(
                &[("alice".to_string(), Metric::Cpu.as_str())],
                now + Duration::minutes(1),
            )
            .expect("resolve");
        assert_eq!(storage.open_persistent_count().expect("count"), 1);
    }

    #[test]
    fn cleanup_drops_only_old_rows() {
        let (_dir, storage) = open_temp();
        let now = Utc::now();
        let old = now - Duration::days(40);
        storage
            .store_system_sample(&system_sample(old))
            .expect("store old");
        storage
            .store_system_sample(&system_sample(now))
            .expect("store new");
        let removed = storage
            .cleanup_before(now - Duration::days(30))
            .expect("cleanup");
        assert_eq!(removed, 1);
        let rows = storage
            .recent_system_samples(now - Duration::days(60))
            .expect("query");
        assert_eq!(rows.len(), 1);
    }
}

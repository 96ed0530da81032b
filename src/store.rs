//! The persistent job and artifact store (§4.1).
//!
//! A single sqlite file holds three tables — `jobs`, `gpu_blacklist`,
//! `artifacts` — plus an append-only `job_events` audit trail. Schema
//! evolution is additive only: at open time we inspect `PRAGMA table_info`
//! against a canonical column list and `ALTER TABLE ... ADD COLUMN` whatever
//! is missing, so upgrading never requires a destructive migration.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{NexusError, Result};
use crate::job::{Job, JobStatus, NotificationChannel};
use crate::util::now_secs;

/// (column name, DDL type + default) — the canonical shape of the `jobs` table.
/// `open()` adds any column here that an existing database file is missing.
const JOB_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT PRIMARY KEY"),
    ("command", "TEXT NOT NULL DEFAULT ''"),
    ("user", "TEXT NOT NULL DEFAULT ''"),
    ("node_name", "TEXT NOT NULL DEFAULT ''"),
    ("priority", "INTEGER NOT NULL DEFAULT 0"),
    ("num_gpus", "INTEGER NOT NULL DEFAULT 1"),
    ("gpu_idxs", "TEXT NOT NULL DEFAULT ''"),
    ("requested_gpu_idxs", "TEXT"),
    ("git_repo_url", "TEXT NOT NULL DEFAULT ''"),
    ("git_branch", "TEXT NOT NULL DEFAULT ''"),
    ("git_tag", "TEXT NOT NULL DEFAULT ''"),
    ("artifact_id", "TEXT NOT NULL DEFAULT ''"),
    ("env", "TEXT NOT NULL DEFAULT ''"),
    ("jobrc", "TEXT"),
    ("notifications", "TEXT NOT NULL DEFAULT ''"),
    ("search_wandb", "INTEGER NOT NULL DEFAULT 0"),
    ("ignore_blacklist", "INTEGER NOT NULL DEFAULT 0"),
    ("status", "TEXT NOT NULL DEFAULT 'queued'"),
    ("created_at", "REAL NOT NULL DEFAULT 0"),
    ("started_at", "REAL"),
    ("completed_at", "REAL"),
    ("pid", "INTEGER"),
    ("dir", "TEXT"),
    ("screen_session_name", "TEXT"),
    ("exit_code", "INTEGER"),
    ("error_message", "TEXT"),
    ("wandb_url", "TEXT"),
    ("marked_for_kill", "INTEGER NOT NULL DEFAULT 0"),
    ("notification_messages", "TEXT NOT NULL DEFAULT ''"),
    ("output_file", "TEXT"),
];

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS gpu_blacklist (
    gpu_index INTEGER PRIMARY KEY,
    blacklisted_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    size INTEGER NOT NULL,
    created_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    at REAL NOT NULL,
    event_type TEXT NOT NULL,
    detail TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_job_events_job_id ON job_events(job_id, at);
"#;

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub gpu_index: Option<u32>,
    pub command_regex: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

fn join_list(items: &[u32]) -> String {
    items.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn parse_list(s: &str) -> Vec<u32> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(',').filter_map(|p| p.parse().ok()).collect()
}

fn serialize_map(map: &HashMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_default()
}

fn deserialize_map(s: &str) -> HashMap<String, String> {
    if s.is_empty() {
        return HashMap::new();
    }
    serde_json::from_str(s).unwrap_or_default()
}

fn serialize_notifications(set: &std::collections::HashSet<NotificationChannel>) -> String {
    set.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
}

fn deserialize_notifications(s: &str) -> std::collections::HashSet<NotificationChannel> {
    use std::str::FromStr;
    s.split(',')
        .filter(|p| !p.is_empty())
        .filter_map(|p| NotificationChannel::from_str(p).ok())
        .collect()
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    use std::str::FromStr;
    let status_str: String = row.get("status")?;
    Ok(Job {
        id: row.get("id")?,
        command: row.get::<_, String>("command")?.into(),
        user: row.get::<_, String>("user")?.into(),
        node_name: row.get::<_, String>("node_name")?.into(),
        priority: row.get("priority")?,
        num_gpus: row.get::<_, i64>("num_gpus")? as u32,
        gpu_idxs: parse_list(&row.get::<_, String>("gpu_idxs")?),
        requested_gpu_idxs: row
            .get::<_, Option<String>>("requested_gpu_idxs")?
            .map(|s| parse_list(&s)),
        git_repo_url: row.get::<_, String>("git_repo_url")?.into(),
        git_branch: row.get::<_, String>("git_branch")?.into(),
        git_tag: row.get::<_, String>("git_tag")?.into(),
        artifact_id: row.get("artifact_id")?,
        env: deserialize_map(&row.get::<_, String>("env")?),
        jobrc: row.get("jobrc")?,
        notifications: deserialize_notifications(&row.get::<_, String>("notifications")?),
        search_wandb: row.get::<_, i64>("search_wandb")? != 0,
        ignore_blacklist: row.get::<_, i64>("ignore_blacklist")? != 0,
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Queued),
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        pid: row.get::<_, Option<i64>>("pid")?.map(|v| v as u32),
        dir: row.get::<_, Option<String>>("dir")?.map(PathBuf::from),
        screen_session_name: row.get("screen_session_name")?,
        exit_code: row.get::<_, Option<i64>>("exit_code")?.map(|v| v as i32),
        error_message: row.get("error_message")?,
        wandb_url: row.get("wandb_url")?,
        marked_for_kill: row.get::<_, i64>("marked_for_kill")? != 0,
        notification_messages: deserialize_map(&row.get::<_, String>("notification_messages")?),
        output_file: row.get("output_file")?,
    })
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; \
                 PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| NexusError::Internal(format!("failed to build db pool: {e}")))?;

        let store = Self { pool: Arc::new(pool) };
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| NexusError::Internal(format!("failed to build db pool: {e}")))?;
        let store = Self { pool: Arc::new(pool) };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(CREATE_TABLES_SQL)?;

        let existing: std::collections::HashSet<String> = conn
            .prepare("PRAGMA table_info(jobs)")?
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();

        for (name, ddl) in JOB_COLUMNS {
            if !existing.contains(*name) {
                let sql = format!("ALTER TABLE jobs ADD COLUMN {name} {ddl}");
                conn.execute(&sql, [])?;
                tracing::info!(column = name, "migrated jobs table: added column");
            }
        }
        Ok(())
    }

    fn insert_event(conn: &Connection, job_id: &str, event_type: &str, detail: Option<&str>) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO job_events (job_id, at, event_type, detail) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, now_secs(), event_type, detail],
        )?;
        Ok(())
    }

    pub fn add_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        if Self::job_exists(&conn, &job.id)? {
            return Err(NexusError::Conflict(format!("job {} already exists", job.id)));
        }
        Self::upsert_row(&conn, job)?;
        Self::insert_event(&conn, &job.id, "created", None)?;
        Ok(())
    }

    fn job_exists(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
        conn.query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .map(|r| r.is_some())
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()?
            .ok_or_else(|| NexusError::NotFound(format!("job {id}")))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let order_by = match filter.status {
            Some(JobStatus::Queued) => "priority DESC, created_at ASC",
            Some(JobStatus::Running) => "started_at ASC",
            _ => "completed_at DESC",
        };
        let sql = format!("SELECT * FROM jobs ORDER BY {order_by}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_job)?;

        let regex = match &filter.command_regex {
            Some(pattern) => Some(
                regex::Regex::new(pattern)
                    .map_err(|e| NexusError::Validation(format!("invalid command_regex: {e}")))?,
            ),
            None => None,
        };

        let mut jobs: Vec<Job> = Vec::new();
        for row in rows {
            let job = row?;
            if let Some(status) = filter.status {
                if job.status != status {
                    continue;
                }
            }
            if let Some(gpu) = filter.gpu_index {
                if !job.gpu_idxs.contains(&gpu) {
                    continue;
                }
            }
            if let Some(re) = &regex {
                if !re.is_match(&job.command) {
                    continue;
                }
            }
            jobs.push(job);
        }

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let jobs: Vec<Job> = jobs.into_iter().skip(offset).collect();
        let jobs = if let Some(limit) = filter.limit {
            jobs.into_iter().take(limit.max(0) as usize).collect()
        } else {
            jobs
        };
        Ok(jobs)
    }

    pub fn update_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        Self::upsert_row(&conn, job)?;
        Self::insert_event(&conn, &job.id, "updated", Some(job.status.to_string().as_str()))?;
        Ok(())
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()?
            .ok_or_else(|| NexusError::NotFound(format!("job {id}")))?;
        if job.status != JobStatus::Queued {
            return Err(NexusError::Conflict(format!(
                "job {id} is not queued; cannot delete"
            )));
        }
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM job_events WHERE job_id = ?1", params![id])?;
        Ok(())
    }

    pub fn count_jobs(&self, status: JobStatus) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn job_events(&self, id: &str) -> Result<Vec<(f64, String, Option<String>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT at, event_type, detail FROM job_events WHERE job_id = ?1 ORDER BY at ASC",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn upsert_row(conn: &Connection, job: &Job) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO jobs (
                id, command, user, node_name, priority, num_gpus, gpu_idxs,
                requested_gpu_idxs,
                git_repo_url, git_branch, git_tag, artifact_id, env, jobrc,
                notifications, search_wandb, ignore_blacklist, status,
                created_at, started_at, completed_at, pid, dir,
                screen_session_name, exit_code, error_message, wandb_url,
                marked_for_kill, notification_messages, output_file
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                ?27, ?28, ?29, ?30
            )
            ON CONFLICT(id) DO UPDATE SET
                command=excluded.command, user=excluded.user,
                node_name=excluded.node_name, priority=excluded.priority,
                num_gpus=excluded.num_gpus, gpu_idxs=excluded.gpu_idxs,
                requested_gpu_idxs=excluded.requested_gpu_idxs,
                git_repo_url=excluded.git_repo_url, git_branch=excluded.git_branch,
                git_tag=excluded.git_tag, artifact_id=excluded.artifact_id,
                env=excluded.env, jobrc=excluded.jobrc,
                notifications=excluded.notifications, search_wandb=excluded.search_wandb,
                ignore_blacklist=excluded.ignore_blacklist, status=excluded.status,
                created_at=excluded.created_at, started_at=excluded.started_at,
                completed_at=excluded.completed_at, pid=excluded.pid, dir=excluded.dir,
                screen_session_name=excluded.screen_session_name, exit_code=excluded.exit_code,
                error_message=excluded.error_message, wandb_url=excluded.wandb_url,
                marked_for_kill=excluded.marked_for_kill,
                notification_messages=excluded.notification_messages,
                output_file=excluded.output_file",
            params![
                job.id,
                job.command.as_str(),
                job.user.as_str(),
                job.node_name.as_str(),
                job.priority,
                job.num_gpus as i64,
                join_list(&job.gpu_idxs),
                job.requested_gpu_idxs.as_ref().map(|v| join_list(v)),
                job.git_repo_url.as_str(),
                job.git_branch.as_str(),
                job.git_tag.as_str(),
                job.artifact_id,
                serialize_map(&job.env),
                job.jobrc,
                serialize_notifications(&job.notifications),
                job.search_wandb as i64,
                job.ignore_blacklist as i64,
                job.status.to_string(),
                job.created_at,
                job.started_at,
                job.completed_at,
                job.pid.map(|v| v as i64),
                job.dir.as_ref().and_then(|p| p.to_str()),
                job.screen_session_name,
                job.exit_code.map(|v| v as i64),
                job.error_message,
                job.wandb_url,
                job.marked_for_kill as i64,
                serialize_map(&job.notification_messages),
                job.output_file,
            ],
        )?;
        Ok(())
    }

    // --- GPU blacklist ---------------------------------------------------

    pub fn set_blacklist(&self, gpu_index: u32, on: bool) -> Result<()> {
        let conn = self.conn()?;
        if on {
            conn.execute(
                "INSERT INTO gpu_blacklist (gpu_index, blacklisted_at) VALUES (?1, ?2)
                 ON CONFLICT(gpu_index) DO NOTHING",
                params![gpu_index, now_secs()],
            )?;
        } else {
            conn.execute(
                "DELETE FROM gpu_blacklist WHERE gpu_index = ?1",
                params![gpu_index],
            )?;
        }
        Ok(())
    }

    pub fn list_blacklist(&self) -> Result<std::collections::HashSet<u32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT gpu_index FROM gpu_blacklist")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .filter_map(|r| r.ok())
            .map(|v| v as u32)
            .collect();
        Ok(rows)
    }

    // --- Artifacts ---------------------------------------------------------

    pub fn add_artifact(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO artifacts (id, data, size, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![id, bytes, bytes.len() as i64, now_secs()],
        )?;
        Ok(())
    }

    pub fn get_artifact(&self, id: &str) -> Result<Vec<u8>> {
        let conn = self.conn()?;
        conn.query_row("SELECT data FROM artifacts WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or_else(|| NexusError::NotFound(format!("artifact {id}")))
    }

    /// Must run in the same transaction as a delete to avoid racing a concurrent
    /// submission that references the artifact (design note, §9).
    pub fn delete_artifact(&self, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let in_use: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE artifact_id = ?1 AND status IN ('queued','running'))",
            params![id],
            |row| row.get(0),
        )?;
        if in_use {
            return Err(NexusError::Conflict(format!(
                "artifact {id} is referenced by a live job"
            )));
        }
        tx.execute("DELETE FROM artifacts WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn artifact_in_use(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let in_use: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE artifact_id = ?1 AND status IN ('queued','running'))",
            params![id],
            |row| row.get(0),
        )?;
        Ok(in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{create_job, JobRequest};
    use std::collections::HashMap as Map;

    fn req(cmd: &str) -> JobRequest {
        JobRequest {
            command: cmd.into(),
            user: "u".into(),
            git_repo_url: String::new(),
            git_tag: String::new(),
            git_branch: String::new(),
            artifact_id: "art".into(),
            num_gpus: 1,
            gpu_idxs: None,
            priority: 0,
            search_wandb: false,
            notifications: vec![],
            env: Map::new(),
            jobrc: None,
            run_immediately: false,
            ignore_blacklist: false,
            output_file: None,
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let job = create_job(req("echo hi"), "job001".into(), "node").unwrap();
        store.add_job(&job).unwrap();
        let got = store.get_job("job001").unwrap();
        assert_eq!(got.command, job.command);
        assert_eq!(got.status, JobStatus::Queued);
    }

    #[test]
    fn add_job_duplicate_id_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        let job = create_job(req("echo hi"), "job001".into(), "node").unwrap();
        store.add_job(&job).unwrap();
        let err = store.add_job(&job).unwrap_err();
        assert!(matches!(err, NexusError::Conflict(_)));
    }

    #[test]
    fn get_missing_job_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_job("nope01").unwrap_err();
        assert!(matches!(err, NexusError::NotFound(_)));
    }

    #[test]
    fn delete_job_requires_queued_status() {
        let store = Store::open_in_memory().unwrap();
        let mut job = create_job(req("echo hi"), "job001".into(), "node").unwrap();
        job.status = JobStatus::Running;
        job.started_at = Some(now_secs());
        store.add_job(&job).unwrap();
        let err = store.delete_job("job001").unwrap_err();
        assert!(matches!(err, NexusError::Conflict(_)));
    }

    #[test]
    fn queued_listing_orders_by_priority_then_age() {
        let store = Store::open_in_memory().unwrap();
        let mut a = create_job(req("a"), "jobaaa1".into(), "node").unwrap();
        a.priority = 0;
        a.created_at = 1.0;
        let mut b = create_job(req("b"), "jobbbb1".into(), "node").unwrap();
        b.priority = 5;
        b.created_at = 2.0;
        store.add_job(&a).unwrap();
        store.add_job(&b).unwrap();

        let jobs = store
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Queued),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(jobs[0].id, "jobbbb1");
        assert_eq!(jobs[1].id, "jobaaa1");
    }

    #[test]
    fn blacklist_add_and_remove_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.set_blacklist(0, true).unwrap();
        store.set_blacklist(0, true).unwrap();
        assert_eq!(store.list_blacklist().unwrap().len(), 1);
        store.set_blacklist(0, false).unwrap();
        assert!(store.list_blacklist().unwrap().is_empty());
    }

    #[test]
    fn artifact_in_use_blocks_delete() {
        let store = Store::open_in_memory().unwrap();
        store.add_artifact("art", b"hello").unwrap();
        let job = create_job(req("echo hi"), "job001".into(), "node").unwrap();
        store.add_job(&job).unwrap();
        assert!(store.artifact_in_use("art").unwrap());
        let err = store.delete_artifact("art").unwrap_err();
        assert!(matches!(err, NexusError::Conflict(_)));
    }

    #[test]
    fn artifact_not_in_use_can_be_deleted() {
        let store = Store::open_in_memory().unwrap();
        store.add_artifact("art", b"hello").unwrap();
        assert!(!store.artifact_in_use("art").unwrap());
        store.delete_artifact("art").unwrap();
        assert!(store.get_artifact("art").is_err());
    }

    #[test]
    fn command_regex_filters_listing() {
        let store = Store::open_in_memory().unwrap();
        let a = create_job(req("python train.py"), "jobaaa1".into(), "node").unwrap();
        let b = create_job(req("echo hi"), "jobbbb1".into(), "node").unwrap();
        store.add_job(&a).unwrap();
        store.add_job(&b).unwrap();

        let jobs = store
            .list_jobs(&JobFilter {
                command_regex: Some("^python".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "jobaaa1");
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! The store handle and core transactional operations.

use crate::error::StoreError;
use crate::schema::SCHEMA;
use crate::types::{PlanJob, RunningJob, duration_to_ms};
use chrono::{DateTime, Utc};
use granary_core::{ConfigValue, JobId, JobSetup, JobState, Key, MIME_TEXT, MIME_VALUE};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Handle to one SQLite-backed job store.
///
/// Multiple processes may open the same path; the unique index on
/// `announcements(key)` arbitrates between them. Within one process a handle
/// serializes access through an internal mutex, so workers open their own
/// handles instead of sharing one.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_date(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::integrity(format!("unparsable stored date '{text}': {e}")))
}

pub(crate) fn decode_state(code: &str) -> Result<JobState, StoreError> {
    JobState::from_code(code)
        .ok_or_else(|| StoreError::integrity(format!("unknown state code '{code}'")))
}

pub(crate) fn decode_config(blob: &[u8]) -> Result<ConfigValue, StoreError> {
    Ok(serde_json::from_slice(blob)?)
}

pub(crate) fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

impl Store {
    /// Open (or create) the store at `path` and initialize the schema.
    ///
    /// # Errors
    ///
    /// Refuses in-memory paths; fails on any SQLite error.
    pub fn open(path: impl AsRef<Path>) -> Result<Store, StoreError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() || path.as_os_str() == ":memory:" {
            return Err(StoreError::InMemoryUnsupported);
        }
        debug!(target: "granary.store", path = %path.display(), "opening store");
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        // Foreign keys are per-connection in SQLite and must be enabled
        // outside of any transaction.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Store {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    /// The filesystem path backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Create the schema idempotently.
    pub fn init(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Remove every row in `Announced` or `Running`.
    ///
    /// Invoked on startup to recover from crashed executors; cascades take
    /// the announcement rows, edges, and blobs with the jobs.
    pub fn drop_unfinished_jobs(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM jobs WHERE state IN ('a', 'r')",
            [],
        )?;
        tx.commit()?;
        if removed > 0 {
            debug!(target: "granary.store", removed, "dropped unfinished jobs");
        }
        Ok(removed)
    }

    /// Active state of a key; `Detached` when no active row exists.
    pub fn get_active_state(&self, key: &Key) -> Result<JobState, StoreError> {
        Ok(self.get_active_job_id_and_state(key)?.1)
    }

    /// Active row id and state of a key; `(None, Detached)` when absent.
    pub fn get_active_job_id_and_state(
        &self,
        key: &Key,
    ) -> Result<(Option<JobId>, JobState), StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, state FROM jobs
                 WHERE key = ?1 AND state IN ('a', 'r', 'f', 'd')",
                params![key.as_str()],
                |row| {
                    let id: i64 = row.get(0)?;
                    let state: String = row.get(1)?;
                    Ok((id, state))
                },
            )
            .optional()?;
        match row {
            None => Ok((None, JobState::Detached)),
            Some((id, code)) => Ok((Some(JobId(id)), decode_state(&code)?)),
        }
    }

    /// States of the given rows; missing ids are absent from the map.
    pub fn get_states(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobState>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT id, state FROM jobs WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(ids.iter().map(|id| id.0)),
            |row| {
                let id: i64 = row.get(0)?;
                let state: String = row.get(1)?;
                Ok((id, state))
            },
        )?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, code) = row?;
            out.insert(JobId(id), decode_state(&code)?);
        }
        Ok(out)
    }

    /// Announce a whole plan atomically.
    ///
    /// Inserts one `Announced` row plus one announcement per node, then all
    /// declared dependency edges. The first uniqueness violation rolls the
    /// entire transaction back and returns `false`, leaving no partial state;
    /// on success every node carries its assigned id.
    pub fn announce_plan(&self, jobs: &mut [PlanJob]) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let now = now_str();
            for job in jobs.iter_mut() {
                tx.execute(
                    "INSERT INTO jobs (state, builder, key, config, job_setup, created_date)
                     VALUES ('a', ?1, ?2, ?3, ?4, ?5)",
                    params![
                        job.builder,
                        job.key.as_str(),
                        serde_json::to_vec(&job.config)?,
                        serde_json::to_vec(&job.job_setup)?,
                        now,
                    ],
                )?;
                job.job_id = Some(JobId(tx.last_insert_rowid()));
            }

            let mut lost_race = false;
            {
                let mut announce =
                    tx.prepare("INSERT INTO announcements (key, job_id) VALUES (?1, ?2)")?;
                for job in jobs.iter() {
                    let id = job.job_id.expect("id assigned above");
                    match announce.execute(params![job.key.as_str(), id.0]) {
                        Ok(_) => {}
                        Err(rusqlite::Error::SqliteFailure(e, _))
                            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                        {
                            debug!(target: "granary.store", key = %job.key, "lost announce race");
                            lost_race = true;
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            if lost_race {
                tx.rollback()?;
                for job in jobs.iter_mut() {
                    job.job_id = None;
                }
                return Ok(false);
            }

            let by_key: HashMap<&Key, JobId> = jobs
                .iter()
                .map(|j| (&j.key, j.job_id.expect("id assigned above")))
                .collect();
            let mut edge =
                tx.prepare("INSERT INTO job_deps (source_id, target_id) VALUES (?1, ?2)")?;
            for job in jobs.iter() {
                let target = job.job_id.expect("id assigned above");
                for dep_key in &job.dep_keys {
                    let source = by_key.get(dep_key).copied().ok_or_else(|| {
                        StoreError::integrity(format!("plan edge to unknown key {dep_key}"))
                    })?;
                    edge.execute(params![source.0, target.0])?;
                }
                for dep_id in &job.dep_ids {
                    edge.execute(params![dep_id.0, target.0])?;
                }
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Delete the plan's rows that are still `Announced` or `Running`.
    ///
    /// Used on executor abort; finished and errored rows survive.
    pub fn unannounce_plan(&self, ids: &[JobId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "DELETE FROM jobs WHERE id IN ({}) AND state IN ('a', 'r')",
            placeholders(ids.len())
        );
        tx.execute(&sql, rusqlite::params_from_iter(ids.iter().map(|id| id.0)))?;
        tx.commit()?;
        Ok(())
    }

    /// Claim a job for execution: `Announced` → `Running`.
    ///
    /// Returns the job's setup, its config, and the key→id mapping of its
    /// immediate predecessors, read in the same transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::BadTransition`] when the row is not `Announced` —
    /// exactly one worker wins this transition.
    pub fn set_running(&self, job_id: JobId) -> Result<RunningJob, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE jobs SET state = 'r' WHERE id = ?1 AND state = 'a'",
            params![job_id.0],
        )?;
        if changed != 1 {
            return Err(StoreError::BadTransition {
                job_id,
                target: "running",
            });
        }

        let (config_blob, setup_blob): (Vec<u8>, Option<Vec<u8>>) = tx.query_row(
            "SELECT config, job_setup FROM jobs WHERE id = ?1",
            params![job_id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut dep_ids = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT j.id, j.key FROM jobs j
                 JOIN job_deps d ON d.source_id = j.id
                 WHERE d.target_id = ?1",
            )?;
            let rows = stmt.query_map(params![job_id.0], |row| {
                let id: i64 = row.get(0)?;
                let key: String = row.get(1)?;
                Ok((id, key))
            })?;
            for row in rows {
                let (id, key) = row?;
                dep_ids.insert(Key::from_hex(key), JobId(id));
            }
        }
        tx.commit()?;

        let job_setup = match setup_blob {
            Some(blob) => serde_json::from_slice(&blob)?,
            None => JobSetup::default(),
        };
        Ok(RunningJob {
            job_setup,
            config: decode_config(&config_blob)?,
            dep_ids,
        })
    }

    /// Commit a successful computation: `Running` → `Finished`.
    ///
    /// Stamps the finish date and computation time, stores the primary value
    /// blob (when the builder returned one) and the captured output.
    pub fn set_finished(
        &self,
        job_id: JobId,
        value: Option<(Vec<u8>, String)>,
        computation_time: Duration,
        output: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE jobs SET state = 'f', finished_date = ?2, computation_time = ?3
             WHERE id = ?1 AND state = 'r'",
            params![job_id.0, now_str(), duration_to_ms(computation_time)],
        )?;
        if changed != 1 {
            return Err(StoreError::BadTransition {
                job_id,
                target: "finished",
            });
        }
        if let Some((data, repr)) = value {
            insert_blob_tx(&tx, job_id, None, &data, MIME_VALUE, Some(&repr))?;
        }
        if let Some(output) = output {
            insert_blob_tx(&tx, job_id, Some("!output"), output.as_bytes(), MIME_TEXT, None)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a failed computation: `Running`/`Announced` → `Error`.
    ///
    /// The announcement row is deleted in the same transaction, freeing the
    /// key for re-announcement; the message and captured output are attached
    /// as the `!message` / `!output` blobs.
    pub fn set_error(
        &self,
        job_id: JobId,
        message: &str,
        computation_time: Option<Duration>,
        output: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM announcements WHERE job_id = ?1",
            params![job_id.0],
        )?;
        let changed = tx.execute(
            "UPDATE jobs SET state = 'e', finished_date = ?2, computation_time = ?3
             WHERE id = ?1 AND state IN ('r', 'a')",
            params![
                job_id.0,
                now_str(),
                computation_time.map(duration_to_ms),
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::BadTransition {
                job_id,
                target: "error",
            });
        }
        insert_blob_tx(&tx, job_id, Some("!message"), message.as_bytes(), MIME_TEXT, None)?;
        if let Some(output) = output {
            insert_blob_tx(&tx, job_id, Some("!output"), output.as_bytes(), MIME_TEXT, None)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Attach a named blob to a job.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateBlob`] when `(job_id, name)` already exists.
    pub fn insert_blob(
        &self,
        job_id: JobId,
        name: Option<&str>,
        data: &[u8],
        mime: &str,
        repr: Option<&str>,
    ) -> Result<(), StoreError> {
        insert_blob_tx(&self.conn(), job_id, name, data, mime, repr)
    }

    /// Fetch a blob's payload and mime tag; `None` when absent.
    pub fn get_blob(
        &self,
        job_id: JobId,
        name: Option<&str>,
    ) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT data, mime FROM blobs WHERE job_id = ?1 AND name IS ?2",
                params![job_id.0, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Sorted names of a job's named blobs (the primary value is unnamed).
    pub fn get_blob_names(&self, job_id: JobId) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name FROM blobs
             WHERE job_id = ?1 AND name IS NOT NULL ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![job_id.0], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Insert an externally-computed value as a `Finished` job.
    ///
    /// Returns `false` when the key is already actively announced.
    pub fn create_job_with_value(
        &self,
        builder: &str,
        key: &Key,
        config: &ConfigValue,
        value: Option<(Vec<u8>, String)>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_str();
        tx.execute(
            "INSERT INTO jobs (state, builder, key, config, job_setup, created_date, finished_date)
             VALUES ('f', ?1, ?2, ?3, NULL, ?4, ?4)",
            params![builder, key.as_str(), serde_json::to_vec(config)?, now],
        )?;
        let job_id = JobId(tx.last_insert_rowid());
        match tx.execute(
            "INSERT INTO announcements (key, job_id) VALUES (?1, ?2)",
            params![key.as_str(), job_id.0],
        ) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tx.rollback()?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        if let Some((data, repr)) = value {
            insert_blob_tx(&tx, job_id, None, &data, MIME_VALUE, Some(&repr))?;
        }
        tx.commit()?;
        Ok(true)
    }
}

fn insert_blob_tx(
    conn: &Connection,
    job_id: JobId,
    name: Option<&str>,
    data: &[u8],
    mime: &str,
    repr: Option<&str>,
) -> Result<(), StoreError> {
    match conn.execute(
        "INSERT INTO blobs (job_id, name, data, mime, repr) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id.0, name, data, mime, repr],
    ) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::DuplicateBlob {
                name: name.unwrap_or("<primary>").to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

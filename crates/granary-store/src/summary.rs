// SPDX-License-Identifier: MIT OR Apache-2.0
//! Read-side queries: job history, metadata, run statistics, and the
//! summaries backing the CLI and browser views.

use crate::error::StoreError;
use crate::store::{Store, decode_config, decode_state, parse_date};
use crate::types::{
    BlobSummary, BuilderSummary, ErrorSummary, JobSummary, RunStats, RunningStatus, StatusCounts,
    StoredJob, ms_to_duration,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use granary_core::{JobId, JobMetadata, Key, MIME_PNG, MIME_TEXT};
use rusqlite::{OptionalExtension, params};
use std::collections::BTreeMap;

impl Store {
    /// All job rows for a key, including archived history.
    pub fn read_jobs(&self, key: &Key) -> Result<Vec<StoredJob>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, builder, config, state FROM jobs WHERE key = ?1")?;
        let rows = stmt.query_map(params![key.as_str()], |row| {
            let id: i64 = row.get(0)?;
            let builder: String = row.get(1)?;
            let config: Vec<u8> = row.get(2)?;
            let state: String = row.get(3)?;
            Ok((id, builder, config, state))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, builder, config, state) = row?;
            out.push(StoredJob {
                id: JobId(id),
                builder,
                key: key.clone(),
                state: decode_state(&state)?,
                config: decode_config(&config)?,
            });
        }
        Ok(out)
    }

    /// Dates, timing, and setup of one row; `None` when the row is gone.
    pub fn read_metadata(&self, job_id: JobId) -> Result<Option<JobMetadata>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT created_date, finished_date, computation_time, job_setup
                 FROM jobs WHERE id = ?1",
                params![job_id.0],
                |row| {
                    let created: String = row.get(0)?;
                    let finished: Option<String> = row.get(1)?;
                    let comp_time: Option<i64> = row.get(2)?;
                    let setup: Option<Vec<u8>> = row.get(3)?;
                    Ok((created, finished, comp_time, setup))
                },
            )
            .optional()?;
        let Some((created, finished, comp_time, setup)) = row else {
            return Ok(None);
        };
        Ok(Some(JobMetadata {
            created_date: parse_date(&created)?,
            finished_date: finished.as_deref().map(parse_date).transpose()?,
            computation_time: comp_time.map(ms_to_duration),
            job_setup: setup
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?,
        }))
    }

    /// Count / mean / sample standard deviation of a builder's computation
    /// times, in milliseconds. Backs the planner's scheduled-jobs report.
    pub fn get_run_stats(&self, builder: &str) -> Result<RunStats, StoreError> {
        let conn = self.conn();
        let (count, avg): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(computation_time), AVG(computation_time)
             FROM jobs WHERE builder = ?1 AND computation_time IS NOT NULL",
            params![builder],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let stdev = match avg {
            Some(avg) if count > 2 => {
                let sum_sq: f64 = conn.query_row(
                    "SELECT SUM((computation_time - ?2) * (computation_time - ?2))
                     FROM jobs WHERE builder = ?1 AND computation_time IS NOT NULL",
                    params![builder, avg],
                    |row| row.get(0),
                )?;
                Some((sum_sq / (count - 1) as f64).sqrt())
            }
            Some(_) => Some(0.0),
            None => None,
        };
        Ok(RunStats { count, avg, stdev })
    }

    /// Per-builder counters and byte footprint, one row per known builder.
    ///
    /// Builders registered in the runtime but absent from the store appear
    /// with zeroed counters.
    pub fn builder_summaries(
        &self,
        registered: &[String],
    ) -> Result<Vec<BuilderSummary>, StoreError> {
        let conn = self.conn();
        let mut result: BTreeMap<String, BuilderSummary> = BTreeMap::new();
        let empty = |name: &str| BuilderSummary {
            name: name.to_string(),
            n_finished: 0,
            n_failed: 0,
            n_in_progress: 0,
            n_archived: 0,
            n_freed: 0,
            size: 0,
        };

        let mut stmt = conn.prepare(
            "SELECT builder, SUM(LENGTH(config)) FROM jobs GROUP BY builder",
        )?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let size: i64 = row.get(1)?;
            Ok((name, size))
        })?;
        for row in rows {
            let (name, size) = row?;
            result.entry(name.clone()).or_insert_with(|| empty(&name)).size = size;
        }

        let mut stmt = conn.prepare(
            "SELECT builder, state, COUNT(key) FROM jobs GROUP BY builder, state",
        )?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let state: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok((name, state, count))
        })?;
        for row in rows {
            let (name, state, count) = row?;
            let entry = result.entry(name.clone()).or_insert_with(|| empty(&name));
            match state.as_str() {
                "f" => entry.n_finished += count,
                "e" => entry.n_failed += count,
                "a" | "r" => entry.n_in_progress += count,
                "F" => entry.n_archived += count,
                "d" | "D" => entry.n_freed += count,
                _ => {}
            }
        }

        let mut stmt = conn.prepare(
            "SELECT j.builder, SUM(LENGTH(b.data))
             FROM blobs b JOIN jobs j ON j.id = b.job_id GROUP BY j.builder",
        )?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let size: i64 = row.get(1)?;
            Ok((name, size))
        })?;
        for row in rows {
            let (name, size) = row?;
            result.entry(name.clone()).or_insert_with(|| empty(&name)).size += size;
        }

        for name in registered {
            result
                .entry(name.clone())
                .or_insert_with(|| empty(name));
        }
        Ok(result.into_values().collect())
    }

    /// Listing of all rows of one builder, with per-job byte footprint.
    pub fn job_summaries(&self, builder: &str) -> Result<Vec<JobSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT j.id, j.key, j.state, j.config, j.created_date, j.finished_date,
                    j.computation_time,
                    LENGTH(j.config) + COALESCE(SUM(LENGTH(b.data)), 0)
             FROM jobs j LEFT JOIN blobs b ON b.job_id = j.id
             WHERE j.builder = ?1
             GROUP BY j.id",
        )?;
        let rows = stmt.query_map(params![builder], |row| {
            let id: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            let state: String = row.get(2)?;
            let config: Vec<u8> = row.get(3)?;
            let created: String = row.get(4)?;
            let finished: Option<String> = row.get(5)?;
            let comp_time: Option<i64> = row.get(6)?;
            let size: i64 = row.get(7)?;
            Ok((id, key, state, config, created, finished, comp_time, size))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, key, state, config, created, finished, comp_time, size) = row?;
            out.push(JobSummary {
                id: JobId(id),
                key: Key::from_hex(key),
                state: decode_state(&state)?.to_string(),
                config: decode_config(&config)?,
                size,
                comp_time,
                created: parse_date(&created)?,
                finished: finished.as_deref().map(parse_date).transpose()?,
            });
        }
        Ok(out)
    }

    /// Listing of a job's blobs with inline previews for text and PNGs.
    pub fn blob_summaries(&self, job_id: JobId) -> Result<Vec<BlobSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, repr, mime, LENGTH(data), data
             FROM blobs WHERE job_id = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![job_id.0], |row| {
            let name: Option<String> = row.get(0)?;
            let repr: Option<String> = row.get(1)?;
            let mime: String = row.get(2)?;
            let size: i64 = row.get(3)?;
            let data: Vec<u8> = row.get(4)?;
            Ok((name, repr, mime, size, data))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (name, repr, mime, size, data) = row?;
            let value = match mime.as_str() {
                MIME_TEXT => Some(String::from_utf8_lossy(&data).into_owned()),
                MIME_PNG => Some(BASE64.encode(&data)),
                _ => None,
            };
            out.push(BlobSummary {
                name,
                repr,
                mime,
                size,
                value,
            });
        }
        Ok(out)
    }

    /// Counters over the currently-running window plus the five most recent
    /// errors. The window starts at the oldest unfinished row.
    pub fn running_status(&self) -> Result<RunningStatus, StoreError> {
        let conn = self.conn();
        let mut counts = StatusCounts::default();
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(key) FROM jobs
             WHERE finished_date IS NULL
                OR finished_date >= (SELECT MIN(created_date) FROM jobs
                                     WHERE finished_date IS NULL)
             GROUP BY state",
        )?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((state, count))
        })?;
        for row in rows {
            let (state, count) = row?;
            match state.as_str() {
                "r" => counts.n_running = count,
                "f" => counts.n_finished = count,
                "a" => counts.n_announced = count,
                "e" => counts.n_failed = count,
                _ => {}
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, builder, config, finished_date FROM jobs
             WHERE state = 'e' ORDER BY finished_date DESC LIMIT 5",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let builder: String = row.get(1)?;
            let config: Vec<u8> = row.get(2)?;
            let finished: Option<String> = row.get(3)?;
            Ok((id, builder, config, finished))
        })?;
        let mut errors = Vec::new();
        for row in rows {
            let (id, builder, config, finished) = row?;
            errors.push(ErrorSummary {
                id: JobId(id),
                builder,
                config: decode_config(&config)?,
                finished: finished.as_deref().map(parse_date).transpose()?,
            });
        }
        Ok(RunningStatus { counts, errors })
    }
}

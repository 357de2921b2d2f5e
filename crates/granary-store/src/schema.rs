// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schema definition.
//!
//! States are stored as one-character codes (see [`granary_core::JobState`]);
//! configs and job setups as JSON blobs; dates as RFC 3339 text; computation
//! time as integer milliseconds.

/// Idempotent DDL executed by [`crate::Store::init`].
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    state            TEXT NOT NULL,
    builder          TEXT NOT NULL,
    key              TEXT NOT NULL,
    config           BLOB NOT NULL,
    job_setup        BLOB,
    created_date     TEXT NOT NULL,
    finished_date    TEXT,
    computation_time INTEGER
);
CREATE INDEX IF NOT EXISTS jobs_builder_idx ON jobs(builder);
CREATE INDEX IF NOT EXISTS jobs_key_idx ON jobs(key);
CREATE INDEX IF NOT EXISTS jobs_finished_date_idx ON jobs(finished_date);

CREATE TABLE IF NOT EXISTS announcements (
    key    TEXT NOT NULL,
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    UNIQUE (key)
);
CREATE INDEX IF NOT EXISTS announcements_job_idx ON announcements(job_id);

CREATE TABLE IF NOT EXISTS job_deps (
    source_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    target_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS job_deps_source_idx ON job_deps(source_id);
CREATE INDEX IF NOT EXISTS job_deps_target_idx ON job_deps(target_id);

CREATE TABLE IF NOT EXISTS blobs (
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    name   TEXT,
    data   BLOB NOT NULL,
    mime   TEXT NOT NULL,
    repr   TEXT,
    UNIQUE (job_id, name)
);
-- SQLite treats NULLs as distinct in UNIQUE constraints; the primary value
-- needs its own uniqueness guarantee.
CREATE UNIQUE INDEX IF NOT EXISTS blobs_primary_idx ON blobs(job_id) WHERE name IS NULL;
";

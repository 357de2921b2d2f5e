// SPDX-License-Identifier: MIT OR Apache-2.0
//! Archive / drop / free / upgrade maintenance operations.
//!
//! Drops and archives act on the reflexive-transitive downstream closure of
//! their seed rows (optionally the upstream closure too), expressed as
//! recursive CTEs over the `job_deps` edge table.

use crate::error::StoreError;
use crate::store::{Store, placeholders};
use crate::types::KeyUpdate;
use granary_core::{ConfigValue, Key};
use rusqlite::{Connection, TransactionBehavior, params};

/// States eligible for archiving; everything else is left untouched.
const ARCHIVE_STATES: &str = "('f', 'd', 'a', 'r')";

/// Render the recursive closure CTE.
///
/// The closure is seeded by `base` (a SELECT yielding job ids), expands
/// downstream always and upstream first when requested, and optionally
/// restricts traversal to rows whose state is in `states`.
fn closure_cte(base: &str, include_upstream: bool, states: Option<&str>) -> String {
    let down_join = match states {
        Some(states) => format!(
            "JOIN jobs j ON j.id = d.target_id AND j.state IN {states}"
        ),
        None => String::new(),
    };
    let up_join = match states {
        Some(states) => format!(
            "JOIN jobs j ON j.id = d.source_id AND j.state IN {states}"
        ),
        None => String::new(),
    };
    if include_upstream {
        format!(
            "WITH RECURSIVE up(id) AS ( \
                {base} \
                UNION \
                SELECT d.source_id FROM up u \
                  JOIN job_deps d ON d.target_id = u.id {up_join} \
            ), closure(id) AS ( \
                SELECT id FROM up \
                UNION \
                SELECT d.target_id FROM closure c \
                  JOIN job_deps d ON d.source_id = c.id {down_join} \
            )"
        )
    } else {
        format!(
            "WITH RECURSIVE closure(id) AS ( \
                {base} \
                UNION \
                SELECT d.target_id FROM closure c \
                  JOIN job_deps d ON d.source_id = c.id {down_join} \
            )"
        )
    }
}

fn collect_closure(
    conn: &Connection,
    cte: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<i64>, StoreError> {
    let sql = format!("{cte} SELECT id FROM closure");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

impl Store {
    /// Physically remove the closure of the given keys.
    ///
    /// Downstream consumers always go with them; `include_upstream` extends
    /// the closure to inputs. Cascades remove edges, announcements, blobs.
    pub fn drop_keys(&self, keys: &[Key], include_upstream: bool) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let base = format!(
            "SELECT id FROM jobs WHERE key IN ({})",
            placeholders(keys.len())
        );
        let sql = format!(
            "{} DELETE FROM jobs WHERE id IN (SELECT id FROM closure)",
            closure_cte(&base, include_upstream, None)
        );
        tx.execute(
            &sql,
            rusqlite::params_from_iter(keys.iter().map(Key::as_str)),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove every row of a builder, plus the downstream (and optionally
    /// upstream) closure of those rows.
    pub fn drop_builder(&self, builder: &str, include_upstream: bool) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "{} DELETE FROM jobs WHERE id IN (SELECT id FROM closure)",
            closure_cte(
                "SELECT id FROM jobs WHERE builder = ?1",
                include_upstream,
                None
            )
        );
        tx.execute(&sql, params![builder])?;
        tx.commit()?;
        Ok(())
    }

    /// Tombstone the closure of the given keys.
    ///
    /// `Finished` becomes `ArchivedFinished`, `Freed` becomes
    /// `ArchivedFreed`, any other active state becomes `Error`; the touched
    /// announcements are deleted so the keys are free for re-announcement.
    pub fn archive_keys(&self, keys: &[Key], include_upstream: bool) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let base = format!(
            "SELECT id FROM jobs WHERE key IN ({}) AND state IN {ARCHIVE_STATES}",
            placeholders(keys.len())
        );
        let cte = closure_cte(&base, include_upstream, Some(ARCHIVE_STATES));
        let ids = collect_closure(
            &tx,
            &cte,
            rusqlite::params_from_iter(keys.iter().map(Key::as_str)),
        )?;
        if !ids.is_empty() {
            let ph = placeholders(ids.len());
            tx.execute(
                &format!("DELETE FROM announcements WHERE job_id IN ({ph})"),
                rusqlite::params_from_iter(ids.iter()),
            )?;
            tx.execute(
                &format!(
                    "UPDATE jobs SET state = CASE state \
                        WHEN 'f' THEN 'F' \
                        WHEN 'd' THEN 'D' \
                        ELSE 'e' END \
                     WHERE id IN ({ph})"
                ),
                rusqlite::params_from_iter(ids.iter()),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Discard the primary values of `Finished` rows: `Finished` → `Freed`.
    ///
    /// Side blobs and metadata stay; downstream work cannot re-execute
    /// through a freed job until it is dropped or archived.
    pub fn free_keys(&self, keys: &[Key]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ph = placeholders(keys.len());
        tx.execute(
            &format!(
                "DELETE FROM blobs WHERE name IS NULL AND job_id IN \
                 (SELECT id FROM jobs WHERE key IN ({ph}) AND state = 'f')"
            ),
            rusqlite::params_from_iter(keys.iter().map(Key::as_str)),
        )?;
        tx.execute(
            &format!("UPDATE jobs SET state = 'd' WHERE key IN ({ph}) AND state = 'f'"),
            rusqlite::params_from_iter(keys.iter().map(Key::as_str)),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Bulk-rename keys after a config upgrade.
    ///
    /// Collisions are the caller's responsibility to detect before calling
    /// (see the runtime's upgrade helper); this just rewrites rows and their
    /// announcements in one transaction.
    pub fn upgrade_builder(&self, updates: &[KeyUpdate]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut update_job =
                tx.prepare("UPDATE jobs SET key = ?2, config = ?3 WHERE key = ?1")?;
            let mut update_announcement =
                tx.prepare("UPDATE announcements SET key = ?2 WHERE key = ?1")?;
            for update in updates {
                update_job.execute(params![
                    update.key.as_str(),
                    update.new_key.as_str(),
                    serde_json::to_vec(&update.config)?,
                ])?;
                update_announcement
                    .execute(params![update.key.as_str(), update.new_key.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Keys and configs of a builder's `Finished` rows.
    pub fn get_all_configs(&self, builder: &str) -> Result<Vec<(Key, ConfigValue)>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT key, config FROM jobs WHERE builder = ?1 AND state = 'f'")?;
        let rows = stmt.query_map(params![builder], |row| {
            let key: String = row.get(0)?;
            let config: Vec<u8> = row.get(1)?;
            Ok((key, config))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, config) = row?;
            out.push((Key::from_hex(key), crate::store::decode_config(&config)?));
        }
        Ok(out)
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for the transactional job store.

use granary_core::{ConfigValue, JobId, JobSetup, JobState, Key, canonical_key};
use granary_store::{PlanJob, Store};
use std::time::Duration;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Store {
    Store::open(dir.path().join("store.db")).unwrap()
}

fn key_of(builder: &str, config: i64) -> Key {
    canonical_key(builder, &ConfigValue::from(config)).unwrap()
}

fn plan_job(builder: &str, config: i64) -> PlanJob {
    PlanJob {
        builder: builder.to_string(),
        key: key_of(builder, config),
        config: ConfigValue::from(config),
        job_setup: JobSetup::default(),
        dep_keys: Vec::new(),
        dep_ids: Vec::new(),
        job_id: None,
    }
}

/// Announce a single dependency-free job and return its id.
fn announce_one(store: &Store, builder: &str, config: i64) -> JobId {
    let mut jobs = vec![plan_job(builder, config)];
    assert!(store.announce_plan(&mut jobs).unwrap());
    jobs[0].job_id.unwrap()
}

/// Announce, run, and finish a job with the given value bytes.
fn finish_one(store: &Store, builder: &str, config: i64, value: &[u8]) -> JobId {
    let id = announce_one(store, builder, config);
    store.set_running(id).unwrap();
    store
        .set_finished(
            id,
            Some((value.to_vec(), format!("{value:?}"))),
            Duration::from_millis(5),
            None,
        )
        .unwrap();
    id
}

#[test]
fn in_memory_store_is_refused() {
    assert!(Store::open(":memory:").is_err());
}

#[test]
fn announce_and_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let key = key_of("col1", 1);
    assert_eq!(store.get_active_state(&key).unwrap(), JobState::Detached);

    let id = announce_one(&store, "col1", 1);
    assert_eq!(store.get_active_state(&key).unwrap(), JobState::Announced);

    let running = store.set_running(id).unwrap();
    assert_eq!(running.config, ConfigValue::from(1));
    assert_eq!(running.job_setup, JobSetup::default());
    assert!(running.dep_ids.is_empty());
    assert_eq!(store.get_active_state(&key).unwrap(), JobState::Running);

    // The transition is single-winner.
    assert!(store.set_running(id).is_err());

    store
        .set_finished(id, Some((vec![1, 2, 3], "bytes".into())), Duration::from_millis(7), None)
        .unwrap();
    let (got_id, state) = store.get_active_job_id_and_state(&key).unwrap();
    assert_eq!(got_id, Some(id));
    assert_eq!(state, JobState::Finished);

    let meta = store.read_metadata(id).unwrap().unwrap();
    assert!(meta.finished_date.is_some());
    assert_eq!(meta.computation_time, Some(Duration::from_millis(7)));

    let (value, mime) = store.get_blob(id, None).unwrap().unwrap();
    assert_eq!(value, vec![1, 2, 3]);
    assert_eq!(mime, granary_core::MIME_VALUE);
}

#[test]
fn announce_conflict_rolls_back_whole_plan() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    announce_one(&store, "col1", 1);

    // A plan containing the contested key plus a fresh one must leave no
    // partial state behind.
    let mut jobs = vec![plan_job("col1", 2), plan_job("col1", 1)];
    assert!(!store.announce_plan(&mut jobs).unwrap());
    assert!(jobs.iter().all(|j| j.job_id.is_none()));
    assert_eq!(
        store.get_active_state(&key_of("col1", 2)).unwrap(),
        JobState::Detached
    );
}

#[test]
fn announce_plan_records_edges() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let existing = finish_one(&store, "base", 7, b"x");

    let mut jobs = vec![plan_job("mid", 1), plan_job("top", 1)];
    jobs[1].dep_keys = vec![jobs[0].key.clone()];
    jobs[1].dep_ids = vec![existing];
    assert!(store.announce_plan(&mut jobs).unwrap());

    let mid_id = jobs[0].job_id.unwrap();
    let top_id = jobs[1].job_id.unwrap();
    store.set_running(mid_id).unwrap();
    store
        .set_finished(mid_id, None, Duration::ZERO, None)
        .unwrap();

    let running = store.set_running(top_id).unwrap();
    assert_eq!(running.dep_ids.len(), 2);
    assert_eq!(running.dep_ids.get(&jobs[0].key), Some(&mid_id));
    assert_eq!(running.dep_ids.get(&key_of("base", 7)), Some(&existing));
}

#[test]
fn set_error_frees_the_key() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let id = announce_one(&store, "col1", 1);
    store.set_running(id).unwrap();
    store
        .set_error(id, "boom", Some(Duration::from_millis(3)), Some("partial output"))
        .unwrap();

    // The key is free again; the error row is invisible to active lookups.
    let key = key_of("col1", 1);
    assert_eq!(store.get_active_state(&key).unwrap(), JobState::Detached);
    let id2 = announce_one(&store, "col1", 1);
    assert_ne!(id, id2);

    let (message, mime) = store.get_blob(id, Some("!message")).unwrap().unwrap();
    assert_eq!(message, b"boom");
    assert_eq!(mime, granary_core::MIME_TEXT);
    let (output, _) = store.get_blob(id, Some("!output")).unwrap().unwrap();
    assert_eq!(output, b"partial output");
}

#[test]
fn recovery_removes_unfinished_rows() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let a = announce_one(&store, "col1", 1);
    let b = announce_one(&store, "col1", 2);
    store.set_running(b).unwrap();
    let done = finish_one(&store, "col1", 3, b"v");

    assert_eq!(store.drop_unfinished_jobs().unwrap(), 2);
    let states = store.get_states(&[a, b, done]).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states.get(&done), Some(&JobState::Finished));
}

#[test]
fn blobs_are_unique_per_name() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = finish_one(&store, "col1", 1, b"v");

    store
        .insert_blob(id, Some("log"), b"hello", granary_core::MIME_TEXT, None)
        .unwrap();
    let err = store
        .insert_blob(id, Some("log"), b"again", granary_core::MIME_TEXT, None)
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));

    assert_eq!(store.get_blob_names(id).unwrap(), vec!["log".to_string()]);
    assert!(store.get_blob(id, Some("missing")).unwrap().is_none());
}

#[test]
fn create_job_with_value_claims_the_key() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let key = key_of("fixed", 1);
    let inserted = store
        .create_job_with_value(
            "fixed",
            &key,
            &ConfigValue::from(1),
            Some((b"payload".to_vec(), "payload".into())),
        )
        .unwrap();
    assert!(inserted);
    assert_eq!(store.get_active_state(&key).unwrap(), JobState::Finished);

    // Second insertion of the same key is refused.
    let again = store
        .create_job_with_value("fixed", &key, &ConfigValue::from(1), None)
        .unwrap();
    assert!(!again);
}

/// Build the diamond base → (left, right) → top and return the four ids.
fn build_diamond(store: &Store) -> [JobId; 4] {
    let base = finish_one(store, "base", 1, b"b");
    let mut jobs = vec![plan_job("left", 1), plan_job("right", 1), plan_job("top", 1)];
    jobs[0].dep_ids = vec![base];
    jobs[1].dep_ids = vec![base];
    jobs[2].dep_keys = vec![jobs[0].key.clone(), jobs[1].key.clone()];
    assert!(store.announce_plan(&mut jobs).unwrap());
    let ids = [
        base,
        jobs[0].job_id.unwrap(),
        jobs[1].job_id.unwrap(),
        jobs[2].job_id.unwrap(),
    ];
    for id in &ids[1..] {
        store.set_running(*id).unwrap();
        store.set_finished(*id, None, Duration::ZERO, None).unwrap();
    }
    ids
}

#[test]
fn drop_removes_exactly_the_downstream_closure() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let [base, left, right, top] = build_diamond(&store);

    store.drop_keys(&[key_of("left", 1)], false).unwrap();

    let states = store.get_states(&[base, left, right, top]).unwrap();
    assert_eq!(states.get(&base), Some(&JobState::Finished));
    assert_eq!(states.get(&right), Some(&JobState::Finished));
    assert!(!states.contains_key(&left));
    assert!(!states.contains_key(&top));
}

#[test]
fn drop_with_upstream_takes_inputs_and_their_consumers() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let [base, left, right, top] = build_diamond(&store);

    // Upstream of `left` is `base`; downstream of `base` is everything.
    store.drop_keys(&[key_of("left", 1)], true).unwrap();
    let states = store.get_states(&[base, left, right, top]).unwrap();
    assert!(states.is_empty());
}

#[test]
fn drop_builder_cascades_downstream() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let [base, left, right, top] = build_diamond(&store);

    store.drop_builder("base", false).unwrap();
    let states = store.get_states(&[base, left, right, top]).unwrap();
    assert!(states.is_empty());
}

#[test]
fn archive_tombstones_and_releases_keys() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let [base, left, _right, top] = build_diamond(&store);

    store.archive_keys(&[key_of("left", 1)], false).unwrap();

    // Archived rows keep history but vanish from active lookups.
    assert_eq!(
        store.get_active_state(&key_of("left", 1)).unwrap(),
        JobState::Detached
    );
    let rows = store.read_jobs(&key_of("left", 1)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, JobState::ArchivedFinished);

    let states = store.get_states(&[base, left, top]).unwrap();
    assert_eq!(states.get(&left), Some(&JobState::ArchivedFinished));
    assert_eq!(states.get(&top), Some(&JobState::ArchivedFinished));
    assert_eq!(states.get(&base), Some(&JobState::Finished));
}

#[test]
fn archive_after_free_yields_archived_freed() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = finish_one(&store, "col1", 1, b"v");

    store.free_keys(&[key_of("col1", 1)]).unwrap();
    assert_eq!(
        store.get_active_state(&key_of("col1", 1)).unwrap(),
        JobState::Freed
    );

    store.archive_keys(&[key_of("col1", 1)], false).unwrap();
    let states = store.get_states(&[id]).unwrap();
    assert_eq!(states.get(&id), Some(&JobState::ArchivedFreed));
}

#[test]
fn free_drops_primary_value_but_keeps_side_blobs() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = finish_one(&store, "col1", 1, b"value");
    store
        .insert_blob(id, Some("notes"), b"kept", granary_core::MIME_TEXT, None)
        .unwrap();

    store.free_keys(&[key_of("col1", 1)]).unwrap();

    assert!(store.get_blob(id, None).unwrap().is_none());
    assert!(store.get_blob(id, Some("notes")).unwrap().is_some());
    assert_eq!(store.get_blob_names(id).unwrap(), vec!["notes".to_string()]);
}

#[test]
fn unannounce_plan_keeps_finished_rows() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut jobs = vec![plan_job("col1", 1), plan_job("col1", 2)];
    assert!(store.announce_plan(&mut jobs).unwrap());
    let done = jobs[0].job_id.unwrap();
    let pending = jobs[1].job_id.unwrap();
    store.set_running(done).unwrap();
    store.set_finished(done, None, Duration::ZERO, None).unwrap();

    store.unannounce_plan(&[done, pending]).unwrap();
    let states = store.get_states(&[done, pending]).unwrap();
    assert_eq!(states.get(&done), Some(&JobState::Finished));
    assert!(!states.contains_key(&pending));
}

#[test]
fn run_stats_aggregate_computation_times() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let stats = store.get_run_stats("col1").unwrap();
    assert_eq!(stats.count, 0);
    assert_eq!(stats.avg, None);

    for (config, ms) in [(1, 10u64), (2, 20), (3, 30), (4, 40)] {
        let id = announce_one(&store, "col1", config);
        store.set_running(id).unwrap();
        store
            .set_finished(id, None, Duration::from_millis(ms), None)
            .unwrap();
    }
    let stats = store.get_run_stats("col1").unwrap();
    assert_eq!(stats.count, 4);
    assert_eq!(stats.avg, Some(25.0));
    let stdev = stats.stdev.unwrap();
    assert!((stdev - 12.9099).abs() < 0.001, "stdev = {stdev}");
}

#[test]
fn upgrade_builder_rewrites_keys_and_announcements() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = finish_one(&store, "col1", 1, b"v");

    let old_key = key_of("col1", 1);
    let new_config = ConfigValue::from(100);
    let new_key = canonical_key("col1", &new_config).unwrap();
    store
        .upgrade_builder(&[granary_store::KeyUpdate {
            key: old_key.clone(),
            new_key: new_key.clone(),
            config: new_config.clone(),
        }])
        .unwrap();

    assert_eq!(store.get_active_state(&old_key).unwrap(), JobState::Detached);
    let (got_id, state) = store.get_active_job_id_and_state(&new_key).unwrap();
    assert_eq!(got_id, Some(id));
    assert_eq!(state, JobState::Finished);
    let rows = store.read_jobs(&new_key).unwrap();
    assert_eq!(rows[0].config, new_config);
}

#[test]
fn summaries_report_counts_sizes_and_previews() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let id = finish_one(&store, "col1", 1, b"value");
    store
        .insert_blob(id, Some("log"), b"hello log", granary_core::MIME_TEXT, None)
        .unwrap();
    let failed = announce_one(&store, "col1", 2);
    store.set_running(failed).unwrap();
    store.set_error(failed, "bad", None, None).unwrap();

    let summaries = store
        .builder_summaries(&["col1".to_string(), "unused".to_string()])
        .unwrap();
    assert_eq!(summaries.len(), 2);
    let col1 = &summaries[0];
    assert_eq!(col1.name, "col1");
    assert_eq!(col1.n_finished, 1);
    assert_eq!(col1.n_failed, 1);
    assert!(col1.size > 0);
    let unused = &summaries[1];
    assert_eq!(unused.name, "unused");
    assert_eq!(unused.n_finished, 0);

    let jobs = store.job_summaries("col1").unwrap();
    assert_eq!(jobs.len(), 2);

    let blobs = store.blob_summaries(id).unwrap();
    assert_eq!(blobs.len(), 2);
    let log = blobs.iter().find(|b| b.name.as_deref() == Some("log")).unwrap();
    assert_eq!(log.value.as_deref(), Some("hello log"));
    let primary = blobs.iter().find(|b| b.name.is_none()).unwrap();
    assert!(primary.value.is_none());

    let status = store.running_status().unwrap();
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].builder, "col1");
}

#[test]
fn two_handles_share_one_store() {
    let dir = TempDir::new().unwrap();
    let store_a = open_store(&dir);
    let store_b = Store::open(dir.path().join("store.db")).unwrap();

    let id = announce_one(&store_a, "col1", 1);
    // The second handle sees the announcement and loses the race.
    let mut jobs = vec![plan_job("col1", 1)];
    assert!(!store_b.announce_plan(&mut jobs).unwrap());

    store_b.set_running(id).unwrap();
    store_b
        .set_finished(id, Some((b"v".to_vec(), "v".into())), Duration::ZERO, None)
        .unwrap();
    assert_eq!(
        store_a.get_active_state(&key_of("col1", 1)).unwrap(),
        JobState::Finished
    );
}

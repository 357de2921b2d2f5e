// SPDX-License-Identifier: MIT OR Apache-2.0
//! Endpoint payload shapes against a seeded store.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use granary_runtime::{Builder, GranaryError, JobRef, PackedValue, Runtime};
use granary_server::{AppState, build_app};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn seeded_state(dir: &TempDir) -> AppState {
    let mut rt = Runtime::open(dir.path().join("store.db")).unwrap();
    rt.register_builder(
        Builder::new("add", |ctx| {
            ctx.attach_text("note", "hello")?;
            let x = ctx.config().as_int().unwrap_or(0);
            if x < 0 {
                return Err(GranaryError::builder("negative"));
            }
            Ok(Some(PackedValue::pack(&(x * 2))?))
        })
        .unwrap(),
    );
    rt.compute(&JobRef::new("add", 21).unwrap()).await.unwrap();
    let _ = rt
        .compute_many(&[JobRef::new("add", -1).unwrap()], true)
        .await
        .unwrap();
    AppState::new(rt.store().clone(), rt.builder_names())
}

async fn get_json(state: AppState, uri: &str) -> serde_json::Value {
    let app = build_app(state);
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn builders_lists_counts_and_sizes() {
    let dir = TempDir::new().unwrap();
    let state = seeded_state(&dir).await;
    let body = get_json(state, "/builders").await;

    let builders = body.as_array().unwrap();
    assert_eq!(builders.len(), 1);
    assert_eq!(builders[0]["name"], "add");
    assert_eq!(builders[0]["n_finished"], 1);
    assert_eq!(builders[0]["n_failed"], 1);
    assert!(builders[0]["size"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn jobs_lists_rows_for_a_builder() {
    let dir = TempDir::new().unwrap();
    let state = seeded_state(&dir).await;
    let body = get_json(state, "/jobs/add").await;

    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    let states: Vec<&str> = jobs.iter().map(|j| j["state"].as_str().unwrap()).collect();
    assert!(states.contains(&"finished"));
    assert!(states.contains(&"error"));
    assert_eq!(jobs[0]["key"].as_str().unwrap().len(), 56);
}

#[tokio::test]
async fn blobs_inline_text_previews() {
    let dir = TempDir::new().unwrap();
    let state = seeded_state(&dir).await;

    let jobs = get_json(state.clone(), "/jobs/add").await;
    let finished = jobs
        .as_array()
        .unwrap()
        .iter()
        .find(|j| j["state"] == "finished")
        .unwrap();
    let id = finished["id"].as_i64().unwrap();

    let blobs = get_json(state, &format!("/blobs/{id}")).await;
    let blobs = blobs.as_array().unwrap();
    // Primary value plus the attached note.
    assert_eq!(blobs.len(), 2);
    let note = blobs
        .iter()
        .find(|b| b["name"] == "note")
        .unwrap();
    assert_eq!(note["value"], "hello");
    assert_eq!(note["mime"], "text/plain");
    let primary = blobs.iter().find(|b| b["name"].is_null()).unwrap();
    assert!(primary["value"].is_null());
    assert_eq!(primary["repr"], "42");
}

#[tokio::test]
async fn status_reports_counts_and_recent_errors() {
    use granary_core::{ConfigValue, JobSetup, canonical_key};

    let dir = TempDir::new().unwrap();
    let state = {
        let mut rt = Runtime::open(dir.path().join("store.db")).unwrap();
        rt.register_builder(
            Builder::new("add", |ctx| {
                let x = ctx.config().as_int().unwrap_or(0);
                if x < 0 {
                    return Err(GranaryError::builder("negative"));
                }
                Ok(Some(PackedValue::pack(&(x * 2))?))
            })
            .unwrap(),
        );
        // An announced-but-unfinished row opens the "currently running"
        // window; everything finishing after it is counted.
        let config = ConfigValue::from(99);
        let mut pending = vec![granary_store::PlanJob {
            builder: "pending".to_string(),
            key: canonical_key("pending", &config).unwrap(),
            config,
            job_setup: JobSetup::default(),
            dep_keys: Vec::new(),
            dep_ids: Vec::new(),
            job_id: None,
        }];
        assert!(rt.store().announce_plan(&mut pending).unwrap());

        rt.compute(&JobRef::new("add", 21).unwrap()).await.unwrap();
        let _ = rt
            .compute_many(&[JobRef::new("add", -1).unwrap()], true)
            .await
            .unwrap();
        AppState::new(rt.store().clone(), rt.builder_names())
    };

    let body = get_json(state, "/status/").await;
    assert_eq!(body["counts"]["n_announced"], 1);
    assert_eq!(body["counts"]["n_finished"], 1);
    assert_eq!(body["counts"]["n_failed"], 1);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["builder"], "add");
}

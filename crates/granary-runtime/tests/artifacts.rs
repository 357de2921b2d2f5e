// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blobs, attachments, captured output, working directories, timeouts.

use granary_core::{JobSetup, JobState, MIME_TEXT};
use granary_runtime::{Builder, GranaryError, JobRef, PackedValue, Runtime};
use std::time::Duration;
use tempfile::TempDir;

fn runtime(dir: &TempDir) -> Runtime {
    Runtime::open(dir.path().join("store.db")).unwrap()
}

#[tokio::test]
async fn attach_object_and_text() {
    let dir = TempDir::new().unwrap();
    let mut rt = runtime(&dir);
    rt.register_builder(
        Builder::new("artifacts", |ctx| {
            ctx.attach_object("object", &2000i64)?;
            let duplicate = ctx.attach_object("object", &2001i64);
            assert!(duplicate.unwrap_err().to_string().contains("already exists"));
            ctx.attach_object("a_object", &20i64)?;
            ctx.attach_text("mytext", "Hello world!")?;
            Ok(None)
        })
        .unwrap(),
    );

    let job = rt.compute(&JobRef::new("artifacts", 20).unwrap()).await.unwrap();
    assert!(job.value_bytes().unwrap().is_none());
    assert_eq!(job.get_object::<i64>("object").unwrap(), 2000);
    assert_eq!(job.get_text("mytext").unwrap(), "Hello world!");
    assert_eq!(
        job.blob_names().unwrap(),
        vec!["a_object".to_string(), "mytext".to_string(), "object".to_string()]
    );

    // Typed accessors check the mime tag.
    assert!(matches!(
        job.get_object::<i64>("mytext").unwrap_err(),
        GranaryError::WrongMime { .. }
    ));
    assert!(matches!(
        job.get_text("object").unwrap_err(),
        GranaryError::WrongMime { .. }
    ));
    assert!(matches!(
        job.get_blob("missing").unwrap_err(),
        GranaryError::MissingBlob { .. }
    ));
}

#[tokio::test]
async fn attachment_names_are_validated() {
    let dir = TempDir::new().unwrap();
    let mut rt = runtime(&dir);
    rt.register_builder(
        Builder::new("badnames", |ctx| {
            assert!(ctx.attach_text("", "x").is_err());
            assert!(ctx.attach_text("!reserved", "x").is_err());
            Ok(None)
        })
        .unwrap(),
    );
    rt.compute(&JobRef::new("badnames", 1).unwrap()).await.unwrap();
}

#[tokio::test]
async fn attach_file_and_directory_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut rt = runtime(&dir);
    rt.register_builder(
        Builder::new("files", |ctx| {
            // Builders write into their own fresh working directory.
            std::fs::write(ctx.workdir().join("test.png"), b"1234")?;
            ctx.attach_file("test.png", None, None)?;
            ctx.attach_file("test.png", Some("aaa"), Some("application/zzz"))?;

            let subdir = ctx.workdir().join("testdir/subdir");
            std::fs::create_dir_all(&subdir)?;
            std::fs::write(ctx.workdir().join("testdir/aa.txt"), "Content 1")?;
            std::fs::write(subdir.join("cc.txt"), "Content 3")?;
            ctx.attach_directory("testdir", None)?;
            Ok(None)
        })
        .unwrap(),
    );

    let job = rt.compute(&JobRef::new("files", 20).unwrap()).await.unwrap();

    let (bytes, mime) = job.get_blob("test.png").unwrap();
    assert_eq!(bytes, b"1234");
    assert_eq!(mime, "image/png");
    let (bytes, mime) = job.get_blob("aaa").unwrap();
    assert_eq!(bytes, b"1234");
    assert_eq!(mime, "application/zzz");

    let target = dir.path().join("extracted");
    job.extract_tar("testdir", &target).unwrap();
    assert_eq!(
        std::fs::read_to_string(target.join("aa.txt")).unwrap(),
        "Content 1"
    );
    assert_eq!(
        std::fs::read_to_string(target.join("subdir/cc.txt")).unwrap(),
        "Content 3"
    );

    // Saving a blob to an explicit path.
    let out = dir.path().join("saved.png");
    job.save_blob_to_file("test.png", &out).unwrap();
    assert_eq!(std::fs::read(out).unwrap(), b"1234");
}

#[tokio::test]
async fn captured_output_lands_in_the_output_blob() {
    let dir = TempDir::new().unwrap();
    let mut rt = runtime(&dir);
    rt.register_builder(
        Builder::new("chatty", |ctx| {
            ctx.write_output("step one");
            ctx.write_output("step two");
            Ok(Some(PackedValue::pack(&"done")?))
        })
        .unwrap(),
    );

    let job = rt.compute(&JobRef::new("chatty", 1).unwrap()).await.unwrap();
    let (output, mime) = job.get_blob("!output").unwrap();
    assert_eq!(mime, MIME_TEXT);
    assert_eq!(String::from_utf8(output).unwrap(), "step one\nstep two\n");
}

#[tokio::test]
async fn failing_jobs_keep_their_captured_output() {
    let dir = TempDir::new().unwrap();
    let mut rt = runtime(&dir);
    rt.register_builder(
        Builder::new("talky_fail", |ctx| {
            ctx.write_output("made it this far");
            Err(GranaryError::builder("and no further"))
        })
        .unwrap(),
    );

    let err = rt
        .compute(&JobRef::new("talky_fail", 1).unwrap())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("and no further"));

    let rows = rt.read_jobs(&JobRef::new("talky_fail", 1).unwrap()).unwrap();
    assert_eq!(rows[0].state(), JobState::Error);
    assert_eq!(rows[0].get_text("!output").unwrap(), "made it this far\n");
    assert!(rows[0].get_text("!message").unwrap().contains("and no further"));
}

#[tokio::test]
async fn timeouts_are_recorded_as_errors() {
    let dir = TempDir::new().unwrap();
    let mut rt = runtime(&dir);
    rt.register_builder(
        Builder::new("sleepy", |_ctx| {
            std::thread::sleep(Duration::from_secs(5));
            Ok(None)
        })
        .unwrap()
        .job_setup(JobSetup::default().timeout(Duration::from_millis(200))),
    );

    let err = rt
        .compute(&JobRef::new("sleepy", 1).unwrap())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timeouted"));

    let rows = rt.read_jobs(&JobRef::new("sleepy", 1).unwrap()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state(), JobState::Error);
    assert!(rows[0].get_text("!message").unwrap().contains("timeouted"));
}

#[tokio::test]
async fn panicking_builders_become_job_errors() {
    let dir = TempDir::new().unwrap();
    let mut rt = runtime(&dir);
    rt.register_builder(
        Builder::new("boom", |_ctx| panic!("kaboom"))
            .unwrap(),
    );

    let err = rt.compute(&JobRef::new("boom", 1).unwrap()).await.unwrap_err();
    assert!(err.to_string().contains("kaboom"));
    let rows = rt.read_jobs(&JobRef::new("boom", 1).unwrap()).unwrap();
    assert_eq!(rows[0].state(), JobState::Error);
}

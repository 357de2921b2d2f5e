// SPDX-License-Identifier: MIT OR Apache-2.0
//! The full-phase job context.
//!
//! A [`JobContext`] is handed to a builder's full phase. It carries the
//! config, the resolved dependency handles (in emission order), a fresh
//! working directory, an output-capture sink, and the attachment helpers for
//! side artifacts. There is no way to emit new dependencies from here; the
//! dependency set was fixed during planning.

use crate::builder::PackedValue;
use crate::error::GranaryError;
use crate::job::{Job, JobRef};
use granary_core::{ConfigValue, JobId, Key, MIME_BYTES, MIME_TEXT, MIME_VALUE};
use granary_store::Store;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared buffer collecting a job's captured output.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputCapture {
    buffer: Arc<Mutex<String>>,
}

impl OutputCapture {
    pub(crate) fn append(&self, text: &str) {
        let mut buffer = self.buffer.lock().expect("output buffer poisoned");
        buffer.push_str(text);
        if !text.ends_with('\n') {
            buffer.push('\n');
        }
    }

    /// Snapshot the captured output; `None` when nothing was written.
    pub(crate) fn snapshot(&self) -> Option<String> {
        let buffer = self.buffer.lock().expect("output buffer poisoned");
        if buffer.is_empty() {
            None
        } else {
            Some(buffer.clone())
        }
    }
}

fn validate_name(name: &str) -> Result<(), GranaryError> {
    if name.is_empty() {
        return Err(GranaryError::InvalidBlobName {
            reason: "name has to be a non-empty string".to_string(),
        });
    }
    if name.starts_with('!') {
        return Err(GranaryError::InvalidBlobName {
            reason: format!("name '{name}' cannot start with '!'"),
        });
    }
    Ok(())
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("txt") | Some("log") | Some("md") => MIME_TEXT,
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        _ => MIME_BYTES,
    }
}

/// Execution context of one running job.
pub struct JobContext {
    config: ConfigValue,
    job_id: JobId,
    store: Arc<Store>,
    inputs: Vec<Job>,
    input_index: HashMap<Key, usize>,
    workdir: PathBuf,
    output: OutputCapture,
    relay: bool,
}

impl JobContext {
    pub(crate) fn new(
        config: ConfigValue,
        job_id: JobId,
        store: Arc<Store>,
        inputs: Vec<Job>,
        workdir: PathBuf,
        output: OutputCapture,
        relay: bool,
    ) -> JobContext {
        let input_index = inputs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.key().clone(), i))
            .collect();
        JobContext {
            config,
            job_id,
            store,
            inputs,
            input_index,
            workdir,
            output,
            relay,
        }
    }

    /// The job's config.
    pub fn config(&self) -> &ConfigValue {
        &self.config
    }

    /// Dependency handles, in the order the dependency phase emitted them
    /// (duplicates preserved).
    pub fn inputs(&self) -> &[Job] {
        &self.inputs
    }

    /// Resolve a dependency declared during the dependency phase.
    ///
    /// # Errors
    ///
    /// Fails when `job` was not emitted by the dependency phase.
    pub fn input(&self, job: &JobRef) -> Result<&Job, GranaryError> {
        self.input_index
            .get(job.key())
            .map(|i| &self.inputs[*i])
            .ok_or_else(|| GranaryError::UndeclaredDependency {
                job: job.to_string(),
            })
    }

    /// The job's fresh working directory; torn down when the job returns.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Append a line to the job's captured output.
    ///
    /// With `relay` set in the job setup, the line also goes to the
    /// executor's console; otherwise the capture ends up as the `!output`
    /// blob.
    pub fn write_output(&self, text: &str) {
        self.output.append(text);
        if self.relay {
            eprintln!("{text}");
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    /// Attach a serialized object under `name`.
    pub fn attach_object<T: serde::Serialize>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), GranaryError> {
        validate_name(name)?;
        let packed = PackedValue::pack(value)?;
        self.store.insert_blob(
            self.job_id,
            Some(name),
            packed.bytes(),
            MIME_VALUE,
            Some(&packed.repr),
        )?;
        Ok(())
    }

    /// Attach a UTF-8 text under `name`.
    pub fn attach_text(&self, name: &str, text: &str) -> Result<(), GranaryError> {
        validate_name(name)?;
        self.store
            .insert_blob(self.job_id, Some(name), text.as_bytes(), MIME_TEXT, None)?;
        Ok(())
    }

    /// Attach raw bytes under `name`.
    pub fn attach_bytes(
        &self,
        name: &str,
        data: &[u8],
        mime: &str,
        repr: Option<&str>,
    ) -> Result<(), GranaryError> {
        validate_name(name)?;
        self.store
            .insert_blob(self.job_id, Some(name), data, mime, repr)?;
        Ok(())
    }

    /// Attach a file; relative paths resolve against the working directory.
    ///
    /// The blob name defaults to the path as given, the mime tag to a guess
    /// from the extension.
    pub fn attach_file(
        &self,
        path: impl AsRef<Path>,
        name: Option<&str>,
        mime: Option<&str>,
    ) -> Result<(), GranaryError> {
        let path = path.as_ref();
        let fallback = path.to_string_lossy();
        let name = name.unwrap_or(fallback.as_ref());
        validate_name(name)?;
        let data = std::fs::read(self.resolve(path))?;
        let mime = mime.unwrap_or_else(|| guess_mime(path));
        self.store
            .insert_blob(self.job_id, Some(name), &data, mime, None)?;
        Ok(())
    }

    /// Attach a directory as a tar archive; relative paths resolve against
    /// the working directory. The blob name defaults to the path as given.
    pub fn attach_directory(
        &self,
        path: impl AsRef<Path>,
        name: Option<&str>,
    ) -> Result<(), GranaryError> {
        let path = path.as_ref();
        let fallback = path.to_string_lossy();
        let name = name.unwrap_or(fallback.as_ref());
        validate_name(name)?;
        let resolved = self.resolve(path);
        if !resolved.is_dir() {
            return Err(GranaryError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("path '{}' is not a directory", path.display()),
            )));
        }
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", &resolved)?;
        let bytes = archive.into_inner()?;
        self.store.insert_blob(
            self.job_id,
            Some(name),
            &bytes,
            granary_core::MIME_TAR,
            None,
        )?;
        Ok(())
    }
}

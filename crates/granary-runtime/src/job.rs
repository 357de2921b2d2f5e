// SPDX-License-Identifier: MIT OR Apache-2.0
//! User-facing job handles.
//!
//! A [`JobRef`] names a job — builder plus config, with the content-hash key
//! derived eagerly. A [`Job`] is a ref that may additionally be *attached* to
//! a stored row, giving access to the value and the attached blobs.

use crate::error::GranaryError;
use granary_core::{
    ConfigValue, JobId, JobMetadata, JobState, Key, MIME_TAR, MIME_TEXT, MIME_VALUE, canonical_key,
};
use granary_store::Store;
use serde::de::DeserializeOwned;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

/// A reference to one job: builder name, config, and the derived key.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRef {
    builder: String,
    key: Key,
    config: ConfigValue,
}

impl JobRef {
    /// Build a reference, deriving the content-hash key.
    ///
    /// # Errors
    ///
    /// Fails when the builder name is not a valid identifier.
    pub fn new(
        builder: impl Into<String>,
        config: impl Into<ConfigValue>,
    ) -> Result<JobRef, GranaryError> {
        let builder = builder.into();
        let config = config.into();
        let key = canonical_key(&builder, &config)?;
        Ok(JobRef {
            builder,
            key,
            config,
        })
    }

    /// Reassemble a reference from stored parts, trusting the stored key.
    ///
    /// Needed for history rows whose configs predate a key upgrade.
    pub(crate) fn from_parts(builder: String, key: Key, config: ConfigValue) -> JobRef {
        JobRef {
            builder,
            key,
            config,
        }
    }

    /// The builder name.
    pub fn builder_name(&self) -> &str {
        &self.builder
    }

    /// The content-hash key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The full config.
    pub fn config(&self) -> &ConfigValue {
        &self.config
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = serde_json::to_string(&self.config).unwrap_or_else(|_| "?".to_string());
        write!(f, "{}({})", self.builder, config)
    }
}

#[derive(Clone)]
struct Attachment {
    job_id: JobId,
    state: JobState,
    store: Arc<Store>,
}

/// A job handle: a [`JobRef`] plus, once computed or read, the stored row it
/// resolved to.
#[derive(Clone)]
pub struct Job {
    job_ref: JobRef,
    attachment: Option<Attachment>,
}

impl Job {
    /// A handle not yet bound to any stored row.
    pub fn detached(job_ref: JobRef) -> Job {
        Job {
            job_ref,
            attachment: None,
        }
    }

    pub(crate) fn attached(job_ref: JobRef, job_id: JobId, state: JobState, store: Arc<Store>) -> Job {
        Job {
            job_ref,
            attachment: Some(Attachment {
                job_id,
                state,
                store,
            }),
        }
    }

    /// The underlying reference.
    pub fn job_ref(&self) -> &JobRef {
        &self.job_ref
    }

    /// The builder name.
    pub fn builder_name(&self) -> &str {
        self.job_ref.builder_name()
    }

    /// The content-hash key.
    pub fn key(&self) -> &Key {
        self.job_ref.key()
    }

    /// The full config.
    pub fn config(&self) -> &ConfigValue {
        self.job_ref.config()
    }

    /// Lifecycle state; `Detached` when the handle is unbound.
    pub fn state(&self) -> JobState {
        self.attachment
            .as_ref()
            .map_or(JobState::Detached, |a| a.state)
    }

    /// `true` once the handle is bound to a stored row.
    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// The stored row id, if attached.
    pub fn job_id(&self) -> Option<JobId> {
        self.attachment.as_ref().map(|a| a.job_id)
    }

    fn require_attached(&self) -> Result<&Attachment, GranaryError> {
        self.attachment.as_ref().ok_or_else(|| GranaryError::NotAttached {
            job: self.job_ref.to_string(),
        })
    }

    /// Raw bytes of the primary value; `None` when the builder returned no
    /// value.
    ///
    /// # Errors
    ///
    /// Fails when the handle is detached or the job is not `Finished`.
    pub fn value_bytes(&self) -> Result<Option<Vec<u8>>, GranaryError> {
        let attachment = self.require_attached()?;
        if attachment.state != JobState::Finished {
            return Err(GranaryError::NotFinished {
                job: self.job_ref.to_string(),
                state: attachment.state,
            });
        }
        Ok(attachment
            .store
            .get_blob(attachment.job_id, None)?
            .map(|(bytes, _)| bytes))
    }

    /// Decode the primary value.
    ///
    /// # Errors
    ///
    /// Fails when the job has no value or the payload does not decode as `T`.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, GranaryError> {
        let bytes = self
            .value_bytes()?
            .ok_or_else(|| GranaryError::MissingBlob {
                name: "<primary>".to_string(),
            })?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Fetch a named blob's payload and mime tag.
    pub fn get_blob(&self, name: &str) -> Result<(Vec<u8>, String), GranaryError> {
        let attachment = self.require_attached()?;
        attachment
            .store
            .get_blob(attachment.job_id, Some(name))?
            .ok_or_else(|| GranaryError::MissingBlob {
                name: name.to_string(),
            })
    }

    /// Decode a blob attached with `attach_object`.
    pub fn get_object<T: DeserializeOwned>(&self, name: &str) -> Result<T, GranaryError> {
        let (bytes, mime) = self.get_blob(name)?;
        if mime != MIME_VALUE {
            return Err(GranaryError::WrongMime {
                name: name.to_string(),
                expected: MIME_VALUE,
                actual: mime,
            });
        }
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Read a blob attached with `attach_text`.
    pub fn get_text(&self, name: &str) -> Result<String, GranaryError> {
        let (bytes, mime) = self.get_blob(name)?;
        if mime != MIME_TEXT {
            return Err(GranaryError::WrongMime {
                name: name.to_string(),
                expected: MIME_TEXT,
                actual: mime,
            });
        }
        String::from_utf8(bytes).map_err(|e| GranaryError::Internal {
            reason: format!("text blob '{name}' is not valid UTF-8: {e}"),
        })
    }

    /// Sorted names of the job's named blobs.
    pub fn blob_names(&self) -> Result<Vec<String>, GranaryError> {
        let attachment = self.require_attached()?;
        Ok(attachment.store.get_blob_names(attachment.job_id)?)
    }

    /// Write a blob's payload to a file.
    pub fn save_blob_to_file(&self, name: &str, target: &Path) -> Result<(), GranaryError> {
        let (bytes, _) = self.get_blob(name)?;
        std::fs::write(target, bytes)?;
        Ok(())
    }

    /// Unpack a blob attached with `attach_directory` into `target`.
    pub fn extract_tar(&self, name: &str, target: &Path) -> Result<(), GranaryError> {
        let (bytes, mime) = self.get_blob(name)?;
        if mime != MIME_TAR {
            return Err(GranaryError::WrongMime {
                name: name.to_string(),
                expected: MIME_TAR,
                actual: mime,
            });
        }
        std::fs::create_dir_all(target)?;
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        archive.unpack(target)?;
        Ok(())
    }

    /// Dates, timing, and setup of the stored row.
    pub fn metadata(&self) -> Result<JobMetadata, GranaryError> {
        let attachment = self.require_attached()?;
        attachment
            .store
            .read_metadata(attachment.job_id)?
            .ok_or_else(|| GranaryError::Internal {
                reason: format!("job row {} vanished", attachment.job_id),
            })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("ref", &self.job_ref)
            .field("state", &self.state())
            .field("job_id", &self.job_id())
            .finish()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_ref, self.state())
    }
}

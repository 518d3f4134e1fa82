//! Durable JSON documents.
//!
//! The queue, its archive, the supervisor snapshot and compliance history are
//! each one JSON document. Saves replace the whole file atomically (write a
//! temp file in the same directory, then rename over the target), so a crash
//! mid-save leaves the previous version intact.

use std::fs;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document at {path} is corrupt")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode document")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Load/save port for one document.
pub trait DocumentStore<T>: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<T>, StoreError>;
    fn save(&self, doc: &T) -> Result<(), StoreError>;
    /// Move an unreadable document out of the way so the next save starts
    /// fresh. Returns where it went, if anywhere.
    fn quarantine(&self) -> Result<Option<String>, StoreError>;
}

impl<T, S: DocumentStore<T> + ?Sized> DocumentStore<T> for Arc<S> {
    fn load(&self) -> Result<Option<T>, StoreError> {
        (**self).load()
    }

    fn save(&self, doc: &T) -> Result<(), StoreError> {
        (**self).save(doc)
    }

    fn quarantine(&self) -> Result<Option<String>, StoreError> {
        (**self).quarantine()
    }
}

/// A document stored as pretty JSON at a fixed path.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> DocumentStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::io(
                    format!("failed to read {}", self.path.display()),
                    e,
                ));
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })
    }

    fn save(&self, doc: &T) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .map_err(|e| StoreError::io(format!("failed to create {}", parent.display()), e))?;

        let json = serde_json::to_string_pretty(doc)?;
        let mut tmp = NamedTempFile::new_in(&parent)
            .map_err(|e| StoreError::io("failed to create temp file", e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.flush())
            .map_err(|e| StoreError::io("failed to write temp file", e))?;
        tmp.persist(&self.path).map_err(|e| {
            StoreError::io(format!("failed to replace {}", self.path.display()), e.error)
        })?;
        Ok(())
    }

    fn quarantine(&self) -> Result<Option<String>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut target = self.path.clone().into_os_string();
        target.push(".corrupt");
        let target = PathBuf::from(target);
        fs::rename(&self.path, &target).map_err(|e| {
            StoreError::io(format!("failed to quarantine {}", self.path.display()), e)
        })?;
        Ok(Some(target.display().to_string()))
    }
}

/// In-memory document, kept as its JSON text so corrupt input can be staged.
pub struct MemoryStore<T> {
    raw: Mutex<Option<String>>,
    quarantined: Mutex<Option<String>>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            raw: Mutex::new(None),
            quarantined: Mutex::new(None),
            _doc: PhantomData,
        }
    }
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw(raw: impl Into<String>) -> Self {
        let store = Self::default();
        *store.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw.into());
        store
    }

    pub fn raw(&self) -> Option<String> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Text moved aside by the last quarantine.
    pub fn quarantined(&self) -> Option<String> {
        self.quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> DocumentStore<T> for MemoryStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>, StoreError> {
        let raw = self.raw.lock().unwrap_or_else(PoisonError::into_inner);
        match raw.as_deref() {
            None => Ok(None),
            Some(text) if text.trim().is_empty() => Ok(None),
            Some(text) => serde_json::from_str(text)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    path: "<memory>".to_string(),
                    source,
                }),
        }
    }

    fn save(&self, doc: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(doc)?;
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(json);
        Ok(())
    }

    fn quarantine(&self) -> Result<Option<String>, StoreError> {
        let taken = self
            .raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let moved = taken.is_some();
        *self
            .quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = taken;
        Ok(moved.then(|| "<memory>.corrupt".to_string()))
    }
}

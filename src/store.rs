//! Durable record files: append-only JSON lines and atomically replaced JSON state.
//!
//! Every file has a single writer inside this process. Readers (reporting
//! tools, `tail -f`) never see a torn state file because replacement goes
//! through a temporary file and a rename.

use crate::errors::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only JSON lines file.
#[derive(Debug)]
pub struct JsonlLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, record: &T) -> Result<(), StoreError> {
        self.append_all(std::slice::from_ref(record)).await
    }

    /// Writes all records in one `write_all` so concurrent readers see whole lines.
    pub async fn append_all<T: Serialize>(&self, records: &[T]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|e| StoreError::Corrupt {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        ensure_parent(&self.path).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.write_err(e))?;
        file.write_all(&buf).await.map_err(|e| self.write_err(e))?;
        file.sync_data().await.map_err(|e| self.write_err(e))?;
        Ok(())
    }

    /// Parse every line. Used by tests and reporting.
    pub async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Read {
                    path: self.path.display().to_string(),
                    source: e,
                });
            }
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| StoreError::Corrupt {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn write_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.display().to_string(),
            source,
        }
    }
}

/// Replace `path` with `value` serialized as pretty JSON.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.display().to_string(),
        source,
    };
    let body = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    ensure_parent(path).await?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = fs::File::create(&tmp).await.map_err(write_err)?;
    file.write_all(&body).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);
    fs::rename(&tmp, path).await.map_err(write_err)?;
    Ok(())
}

/// `Ok(None)` when the file does not exist yet.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Read {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).await.map_err(|e| StoreError::Write {
                path: dir.display().to_string(),
                source: e,
            })
        }
        _ => Ok(()),
    }
}

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state io error: {0}")]
    Io(#[from] io::Error),
    #[error("state serialization error for {key}: {reason}")]
    Serialization { key: String, reason: String },
}

impl StoreError {
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Key-value persistence for per-tenant state documents.
pub trait StateBackend: Send + Sync {
    fn read(&self, key: &str) -> io::Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> io::Result<()>;
    /// Deletes the document; a missing key is not an error.
    fn remove(&self, key: &str) -> io::Result<()>;
}

/// One JSON file per key below `root`.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path.set_extension("json");
        path
    }
}

impl StateBackend for FileBackend {
    fn read(&self, key: &str) -> io::Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(path).map(Some)
    }

    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Readers never observe a half-written document.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(tmp, path)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for MemoryBackend {
    fn read(&self, key: &str) -> io::Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

pub fn sanitize_tenant(tenant: &str) -> String {
    let cleaned: String = tenant
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

pub fn tenant_key(tenant: &str, name: &str) -> String {
    format!("tenants/{}/{name}", sanitize_tenant(tenant))
}

enum WriteCommand {
    Put { key: String, value: String },
    Remove { key: String },
    Flush(Sender<()>),
}

/// Coalesces writes per key and persists them off the caller's thread.
///
/// A value handed to `submit` is written at most `delay` later. Dropping the
/// writer drains everything still pending before the thread exits.
pub struct DeferredWriter {
    tx: Option<Sender<WriteCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl DeferredWriter {
    pub fn spawn(backend: Arc<dyn StateBackend>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<WriteCommand>();
        let handle = thread::spawn(move || {
            let mut pending: HashMap<String, String> = HashMap::new();
            let mut deadline: Option<Instant> = None;
            loop {
                let command = match deadline {
                    Some(at) => {
                        let wait = at.saturating_duration_since(Instant::now());
                        match rx.recv_timeout(wait) {
                            Ok(command) => Some(command),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match rx.recv() {
                        Ok(command) => Some(command),
                        Err(_) => break,
                    },
                };

                match command {
                    Some(WriteCommand::Put { key, value }) => {
                        pending.insert(key, value);
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + delay);
                        }
                    }
                    Some(WriteCommand::Remove { key }) => {
                        pending.remove(&key);
                        match backend.remove(&key) {
                            Ok(()) => debug!(key = %key, "state removed"),
                            Err(e) => error!(key = %key, error = %e, "failed to remove state"),
                        }
                    }
                    Some(WriteCommand::Flush(ack)) => {
                        write_all(backend.as_ref(), &mut pending);
                        deadline = None;
                        let _ = ack.send(());
                    }
                    None => {
                        write_all(backend.as_ref(), &mut pending);
                        deadline = None;
                    }
                }
            }
            write_all(backend.as_ref(), &mut pending);
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn submit(&self, key: String, value: String) {
        if let Some(tx) = &self.tx
            && tx.send(WriteCommand::Put { key, value }).is_err()
        {
            error!("state writer thread is gone; write dropped");
        }
    }

    /// Drops any pending value for `key` and deletes the stored one.
    pub fn discard(&self, key: String) {
        if let Some(tx) = &self.tx
            && tx.send(WriteCommand::Remove { key }).is_err()
        {
            error!("state writer thread is gone; removal dropped");
        }
    }

    /// Blocks until every submitted value has reached the backend.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(WriteCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for DeferredWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_all(backend: &dyn StateBackend, pending: &mut HashMap<String, String>) {
    for (key, value) in pending.drain() {
        match backend.write(&key, &value) {
            Ok(()) => debug!(key = %key, bytes = value.len(), "state persisted"),
            Err(e) => error!(key = %key, error = %e, "failed to persist state"),
        }
    }
}

/// Shared handle used by the stores: synchronous reads, deferred writes.
#[derive(Clone)]
pub struct StateHandle {
    backend: Arc<dyn StateBackend>,
    writer: Arc<DeferredWriter>,
}

impl StateHandle {
    pub fn new(backend: Arc<dyn StateBackend>, delay: Duration) -> Self {
        let writer = Arc::new(DeferredWriter::spawn(backend.clone(), delay));
        Self { backend, writer }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Duration::ZERO)
    }

    pub fn load_json<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StoreError> {
        let Some(content) = self.backend.read(key)? else {
            return Ok(T::default());
        };
        serde_json::from_str(&content).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.writer.submit(key.to_string(), content);
        Ok(())
    }

    /// Queued behind earlier writes, so a pending save never resurrects the key.
    pub fn remove(&self, key: &str) {
        self.writer.discard(key.to_string());
    }

    pub fn flush(&self) {
        self.writer.flush();
    }
}

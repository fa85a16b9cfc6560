//! Background writer so snapshot upserts never run on the async runtime.

use std::sync::mpsc;
use std::thread;

use super::{DbError, Store};

/// Owns the store on a dedicated thread and writes the newest value for one
/// key. Values queued while a write is in progress collapse to the latest.
pub struct SnapshotWriter {
    tx: Option<mpsc::Sender<String>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn(store: Store, key: &'static str) -> Result<Self, DbError> {
        let (tx, rx) = mpsc::channel::<String>();
        let handle = thread::Builder::new()
            .name("netdiag-snapshot".to_string())
            .spawn(move || write_loop(store, key, rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue `value` for writing. Never blocks.
    pub fn submit(&self, value: String) {
        let sent = self.tx.as_ref().map(|tx| tx.send(value).is_ok());
        if sent != Some(true) {
            tracing::error!("SnapshotWriter: writer thread is gone, snapshot not saved");
        }
    }
}

impl Drop for SnapshotWriter {
    /// Flushes whatever is still queued.
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("SnapshotWriter: writer thread panicked");
            }
        }
    }
}

fn write_loop(store: Store, key: &str, rx: mpsc::Receiver<String>) {
    while let Ok(mut value) = rx.recv() {
        while let Ok(newer) = rx.try_recv() {
            value = newer;
        }
        if let Err(e) = store.put(key, &value) {
            tracing::error!("SnapshotWriter: failed to write {}: {}", key, e);
        }
    }
}

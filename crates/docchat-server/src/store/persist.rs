//! Write-behind JSON persistence
//!
//! One `<conversation-id>.json` file per conversation, in the same shape as the
//! JSON export. A single worker drains the queue so files are written in
//! mutation order.

use flume::{unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::StoreError;
use super::types::Conversation;

enum PersistCommand {
    Save(Box<Conversation>),
    Delete(Uuid),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct Persister {
    sender: Sender<PersistCommand>,
}

impl Persister {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(dir: PathBuf) -> Self {
        let (sender, receiver) = unbounded();
        info!("Starting conversation persister in {}", dir.display());

        tokio::spawn(async move {
            Self::worker_loop(dir, receiver).await;
        });

        Self { sender }
    }

    /// Queue a snapshot. Never blocks, so it is safe under the store lock.
    pub fn save(&self, conversation: Conversation) {
        if let Err(e) = self.sender.send(PersistCommand::Save(Box::new(conversation))) {
            error!("Persister is gone, snapshot dropped: {}", e);
        }
    }

    pub fn delete(&self, id: Uuid) {
        if let Err(e) = self.sender.send(PersistCommand::Delete(id)) {
            error!("Persister is gone, delete of {} dropped: {}", id, e);
        }
    }

    /// Resolves once everything queued before the call is on disk
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send_async(PersistCommand::Flush(ack))
            .await
            .map_err(|_| StoreError::Persistence("persister stopped".to_string()))?;
        done.await
            .map_err(|_| StoreError::Persistence("persister stopped before flushing".to_string()))
    }

    async fn worker_loop(dir: PathBuf, receiver: Receiver<PersistCommand>) {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!("Cannot create data dir {}: {}", dir.display(), e);
        }

        while let Ok(command) = receiver.recv_async().await {
            match command {
                PersistCommand::Save(conversation) => {
                    if let Err(e) = write_record(&dir, &conversation).await {
                        error!("Failed to persist conversation {}: {}", conversation.id, e);
                    }
                }
                PersistCommand::Delete(id) => {
                    let path = record_path(&dir, id);
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => debug!("Removed {}", path.display()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => error!("Failed to remove {}: {}", path.display(), e),
                    }
                }
                PersistCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        info!("Conversation persister shutting down (channel closed)");
    }
}

pub fn record_path(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("{}.json", id))
}

/// Temp file then rename, so a crash never leaves a half-written record
async fn write_record(dir: &Path, conversation: &Conversation) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(conversation)
        .map_err(|e| StoreError::Persistence(e.to_string()))?;
    let path = record_path(dir, conversation.id);
    let tmp = dir.join(format!("{}.json.tmp", conversation.id));

    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| StoreError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| StoreError::Persistence(format!("rename {}: {}", path.display(), e)))?;

    debug!("Persisted conversation {} ({} bytes)", conversation.id, bytes.len());
    Ok(())
}

/// Read every record in `dir`. Unreadable files are skipped with a warning.
pub async fn load_records(dir: &Path) -> Result<Vec<Conversation>, StoreError> {
    let mut records = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => {
            return Err(StoreError::Persistence(format!(
                "read dir {}: {}",
                dir.display(),
                e
            )))
        }
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::Persistence(e.to_string()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping unreadable record {}: {}", path.display(), e);
                continue;
            }
        };
        match serde_json::from_slice::<Conversation>(&bytes) {
            Ok(conversation) => records.push(conversation),
            Err(e) => warn!("Skipping corrupt record {}: {}", path.display(), e),
        }
    }

    Ok(records)
}

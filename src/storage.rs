use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::ChatEvent;
use crate::store::{Conversation, ConversationStore, Message, Role};

const USER_PREFIX: &str = "You: ";
const ASSISTANT_PREFIX: &str = "AI: ";

/// Encode the conversation list as the on-disk shape: an array of arrays
/// of prefixed message strings.
fn encode_snapshot(conversations: &[Conversation]) -> Vec<Vec<String>> {
    conversations
        .iter()
        .map(|conversation| {
            conversation
                .messages
                .iter()
                .map(|message| match message.role {
                    Role::User => format!("{USER_PREFIX}{}", message.text),
                    Role::Assistant => format!("{ASSISTANT_PREFIX}{}", message.text),
                })
                .collect()
        })
        .collect()
}

fn decode_snapshot(raw: Vec<Vec<String>>) -> Vec<Conversation> {
    raw.into_iter()
        .map(|messages| Conversation {
            messages: messages
                .into_iter()
                .map(|entry| {
                    if let Some(text) = entry.strip_prefix(USER_PREFIX) {
                        Message::user(text)
                    } else if let Some(text) = entry.strip_prefix(ASSISTANT_PREFIX) {
                        Message::assistant(text)
                    } else {
                        // Entries from older files without a prefix render
                        // as assistant messages.
                        Message::assistant(entry)
                    }
                })
                .collect(),
        })
        .collect()
}

/// Owns the conversations file on disk.
///
/// Reads happen once at startup; all writes go through the [`Saver`]
/// task, which is the only writer of the file.
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the persisted store. Never fails the caller: a missing file
    /// yields an empty store, and an unreadable or malformed file is left
    /// on disk untouched while we start from empty.
    pub fn load(&self) -> ConversationStore {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no conversations file yet");
                return ConversationStore::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read conversations, starting empty");
                return ConversationStore::new();
            }
        };

        match serde_json::from_str::<Vec<Vec<String>>>(&content) {
            Ok(raw) => ConversationStore::from_conversations(decode_snapshot(raw)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "conversations file is malformed, starting empty");
                ConversationStore::new()
            }
        }
    }

    /// Serialize and write the whole snapshot.
    ///
    /// Writes to a temp file in the target directory and renames it over
    /// the destination, so a failed write never leaves a truncated file.
    fn write_snapshot(&self, conversations: &[Conversation]) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("conversations path has no parent directory")?;
        fs::create_dir_all(parent).context("Failed to create state directory")?;

        let content = serde_json::to_string_pretty(&encode_snapshot(conversations))
            .context("Failed to serialize conversations")?;

        let mut tmp = NamedTempFile::new_in(parent)
            .context("Failed to create temporary snapshot file")?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write snapshot")?;
        tmp.persist(&self.path)
            .context("Failed to replace conversations file")?;
        Ok(())
    }
}

enum SaveRequest {
    Snapshot(Vec<Conversation>),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget entry point for saves, cloneable into streaming tasks
#[derive(Clone)]
pub struct SaverHandle {
    tx: mpsc::UnboundedSender<SaveRequest>,
}

impl SaverHandle {
    /// Queue a save of the given snapshot. Returns immediately; the
    /// saver task writes it (or a newer snapshot that superseded it).
    pub fn save(&self, snapshot: Vec<Conversation>) {
        let _ = self.tx.send(SaveRequest::Snapshot(snapshot));
    }

    /// Wait until every save queued before this call has hit the disk
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SaveRequest::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Background task serializing all writes of the conversations file.
///
/// At most one write is ever in progress; requests that pile up while a
/// write runs are coalesced down to the newest snapshot, so the file
/// always settles on the most recently requested state.
pub struct Saver {
    handle: SaverHandle,
    task: JoinHandle<()>,
}

impl Saver {
    pub fn spawn(storage: Storage, events: mpsc::UnboundedSender<ChatEvent>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let mut pending_acks = Vec::new();
                let mut snapshot = match request {
                    SaveRequest::Snapshot(snapshot) => Some(snapshot),
                    SaveRequest::Flush(ack) => {
                        pending_acks.push(ack);
                        None
                    }
                };

                // Coalesce everything already queued to the newest state.
                while let Ok(next) = rx.try_recv() {
                    match next {
                        SaveRequest::Snapshot(newer) => snapshot = Some(newer),
                        SaveRequest::Flush(ack) => pending_acks.push(ack),
                    }
                }

                if let Some(snapshot) = snapshot {
                    if let Err(e) = storage.write_snapshot(&snapshot) {
                        error!(error = %e, "failed to save conversations");
                        let _ = events.send(ChatEvent::SaveFailed { error: e.to_string() });
                    } else {
                        debug!(conversations = snapshot.len(), "saved conversations");
                    }
                }

                for ack in pending_acks {
                    let _ = ack.send(());
                }
            }
        });

        Self { handle: SaverHandle { tx }, task }
    }

    pub fn handle(&self) -> SaverHandle {
        self.handle.clone()
    }

    /// Flush the last queued snapshot and stop the task
    pub async fn shutdown(self) {
        self.handle.flush().await;
        drop(self.handle);
        self.task.abort();
        let _ = self.task.await;
    }
}

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{ChatEvent, SessionId};
use crate::ollama::{OllamaClient, TransportEvent};
use crate::storage::{Saver, SaverHandle, Storage};
use crate::store::{Conversation, Message, StoreError, StoreHandle};
use crate::stream::StreamAccumulator;

/// Why a prompt was rejected before any I/O happened
#[derive(Debug, Error)]
pub enum SendError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle of one request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Sending,
    Streaming,
    Completed,
    Failed,
}

/// The chat core: owns the conversation store, the HTTP client, and the
/// saver task, and raises [`ChatEvent`]s for the UI collaborator.
///
/// Every `send` spawns a streaming session bound to the conversation
/// index captured at that moment, so switching or creating conversations
/// while a response streams in never misroutes its updates.
pub struct ChatSession {
    store: StoreHandle,
    client: OllamaClient,
    saver: Saver,
    events_tx: mpsc::UnboundedSender<ChatEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ChatEvent>>,
}

impl ChatSession {
    /// Load persisted conversations and wire up the core.
    ///
    /// If storage was empty (or unreadable), starts with one fresh
    /// conversation selected so there is always somewhere to type.
    pub fn load(config: Config) -> Result<Self> {
        let storage = Storage::new(config.conversations_file.clone());
        let mut store = storage.load();
        if store.is_empty() {
            store.create_new();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let saver = Saver::spawn(storage, events_tx.clone());
        let client = OllamaClient::new(config)?;

        Ok(Self {
            store: StoreHandle::new(store),
            client,
            saver,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// Hand the UI side the receiving half of the event channel.
    /// Events arrive in the order the core raised them.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<ChatEvent> {
        self.events_rx.take().expect("event receiver already taken")
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.store.conversations()
    }

    pub fn active_index(&self) -> Option<usize> {
        self.store.active_index()
    }

    pub fn create_new(&self) -> usize {
        let index = self.store.create_new();
        let _ = self.events_tx.send(ChatEvent::StoreChanged);
        self.saver.handle().save(self.store.conversations());
        index
    }

    pub fn select(&self, index: usize) -> Result<(), StoreError> {
        self.store.select(index)?;
        let _ = self.events_tx.send(ChatEvent::StoreChanged);
        Ok(())
    }

    pub fn delete(&self, index: usize) -> Result<(), StoreError> {
        self.store.delete(index)?;
        let _ = self.events_tx.send(ChatEvent::StoreChanged);
        self.saver.handle().save(self.store.conversations());
        Ok(())
    }

    /// Send `prompt` to conversation `index` and stream the reply into it.
    ///
    /// Appends the user message plus an empty assistant placeholder, then
    /// returns; a spawned task drives the network read and grows the
    /// placeholder in place. The caller is never blocked on the server.
    pub fn send(&self, prompt: &str, index: usize) -> Result<SessionId, SendError> {
        if prompt.trim().is_empty() {
            return Err(SendError::EmptyPrompt);
        }

        self.store.append_message(index, Message::user(prompt))?;
        self.store.append_message(index, Message::assistant(""))?;
        let _ = self.events_tx.send(ChatEvent::StoreChanged);

        let session_id = Uuid::new_v4();
        debug!(%session_id, conversation = index, "sending prompt");

        let rx = self.client.generate(prompt.to_string());
        tokio::spawn(run_stream(
            session_id,
            index,
            rx,
            self.store.clone(),
            self.saver.handle(),
            self.events_tx.clone(),
        ));

        Ok(session_id)
    }

    /// Flush a final save and wait for it to land on disk.
    pub async fn shutdown(self) {
        self.saver.handle().save(self.store.conversations());
        self.saver.shutdown().await;
    }
}

/// Drive one streaming session to a terminal state.
///
/// Bound to the conversation index captured at send time; emits exactly
/// one terminal event (`Completed` or `Failed`), which is also the UI's
/// signal to re-enable input, and triggers exactly one save.
async fn run_stream(
    session_id: SessionId,
    index: usize,
    mut rx: mpsc::Receiver<TransportEvent>,
    store: StoreHandle,
    saver: SaverHandle,
    events: mpsc::UnboundedSender<ChatEvent>,
) {
    let mut state = SessionState::Sending;
    let mut accumulator = StreamAccumulator::new();

    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Token(token) => {
                if state == SessionState::Sending {
                    state = SessionState::Streaming;
                    debug!(%session_id, "first chunk received");
                }

                let accumulated = accumulator.feed(&token);
                if let Err(e) = store.replace_last_message(index, accumulated.text.clone()) {
                    // The conversation was deleted out from under us.
                    state = SessionState::Failed;
                    warn!(%session_id, ?state, error = %e, "streaming target vanished");
                    let _ = events.send(ChatEvent::Failed { session_id, error: e.to_string() });
                    saver.save(store.conversations());
                    return;
                }
                let _ = events.send(ChatEvent::StreamDelta {
                    session_id,
                    text: accumulated.text,
                });

                if accumulated.done {
                    break;
                }
            }
            TransportEvent::Failed(error) => {
                // The error marker replaces any partial text.
                if let Err(e) = store.replace_last_message(index, format!("Error: {error}")) {
                    warn!(%session_id, error = %e, "could not record stream failure");
                }
                state = SessionState::Failed;
                debug!(%session_id, ?state, "session failed");
                let _ = events.send(ChatEvent::Failed { session_id, error });
                saver.save(store.conversations());
                return;
            }
        }
    }

    // Final token seen, or the stream ended gracefully.
    state = SessionState::Completed;
    debug!(%session_id, ?state, "session completed");
    let _ = events.send(ChatEvent::Completed { session_id });
    saver.save(store.conversations());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;
    use crate::testutil::spawn_fake_ollama;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    const HAPPY_LINES: [&str; 3] = [
        r#"{"response":"Hi","done":false}"#,
        r#"{"response":" there","done":false}"#,
        r#"{"response":"","done":true}"#,
    ];

    fn config_for(base_url: String, dir: &std::path::Path) -> Config {
        Config {
            base_url,
            conversations_file: dir.join("conversations.json"),
            request_timeout_secs: 5,
            ..Config::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> ChatEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Drain events until the session terminates, then verify no second
    /// terminal event follows. Returns (completed, failed) counts.
    async fn drain_until_terminal(
        rx: &mut mpsc::UnboundedReceiver<ChatEvent>,
        session_id: SessionId,
    ) -> (usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        loop {
            match next_event(rx).await {
                ChatEvent::Completed { session_id: id } if id == session_id => completed += 1,
                ChatEvent::Failed { session_id: id, .. } if id == session_id => failed += 1,
                _ => continue,
            }
            break;
        }

        // A session must terminate exactly once.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = rx.try_recv() {
            match event {
                ChatEvent::Completed { session_id: id } if id == session_id => completed += 1,
                ChatEvent::Failed { session_id: id, .. } if id == session_id => failed += 1,
                _ => {}
            }
        }
        (completed, failed)
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_state_change() {
        let dir = tempdir().unwrap();
        let config = config_for("http://127.0.0.1:1".into(), dir.path());
        let session = ChatSession::load(config).unwrap();

        assert!(matches!(session.send("   \t ", 0), Err(SendError::EmptyPrompt)));
        assert!(session.conversations()[0].messages.is_empty());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_invalid_index_surfaces_store_error() {
        let dir = tempdir().unwrap();
        let config = config_for("http://127.0.0.1:1".into(), dir.path());
        let session = ChatSession::load(config).unwrap();

        assert!(matches!(
            session.send("hello", 7),
            Err(SendError::Store(StoreError::IndexOutOfRange(7)))
        ));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn startup_creates_a_default_conversation_when_storage_is_empty() {
        let dir = tempdir().unwrap();
        let config = config_for("http://127.0.0.1:1".into(), dir.path());
        let session = ChatSession::load(config).unwrap();

        assert_eq!(session.conversations().len(), 1);
        assert_eq!(session.active_index(), Some(0));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn streamed_reply_lands_in_the_conversation_and_persists() {
        let dir = tempdir().unwrap();
        let base_url = spawn_fake_ollama(
            HAPPY_LINES.iter().map(|s| s.to_string()).collect(),
            Duration::ZERO,
            false,
        )
        .await;
        let config = config_for(base_url, dir.path());
        let path = config.conversations_file.clone();

        let mut session = ChatSession::load(config).unwrap();
        let mut events = session.take_events();

        let session_id = session.send("Hello", 0).unwrap();
        let (completed, failed) = drain_until_terminal(&mut events, session_id).await;
        assert_eq!((completed, failed), (1, 0));

        let conversation = &session.conversations()[0];
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[0].text, "Hello");
        assert_eq!(conversation.messages[1].role, Role::Assistant);
        assert_eq!(conversation.messages[1].text, "Hi there");

        session.shutdown().await;

        let saved = Storage::new(path).load();
        assert_eq!(saved.conversations()[0].messages[1].text, "Hi there");
    }

    #[tokio::test]
    async fn deltas_grow_monotonically_in_arrival_order() {
        let dir = tempdir().unwrap();
        let base_url = spawn_fake_ollama(
            HAPPY_LINES.iter().map(|s| s.to_string()).collect(),
            Duration::ZERO,
            false,
        )
        .await;
        let mut session = ChatSession::load(config_for(base_url, dir.path())).unwrap();
        let mut events = session.take_events();

        let session_id = session.send("Hello", 0).unwrap();

        let mut texts = Vec::new();
        loop {
            match next_event(&mut events).await {
                ChatEvent::StreamDelta { session_id: id, text } if id == session_id => {
                    texts.push(text);
                }
                ChatEvent::Completed { session_id: id } if id == session_id => break,
                ChatEvent::Failed { error, .. } => panic!("unexpected failure: {error}"),
                _ => {}
            }
        }

        assert_eq!(texts, ["Hi", "Hi there", "Hi there"]);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn mid_stream_disconnect_records_error_marker() {
        let dir = tempdir().unwrap();
        let base_url = spawn_fake_ollama(
            vec![r#"{"response":"Par","done":false}"#.into()],
            Duration::ZERO,
            true,
        )
        .await;
        let config = config_for(base_url, dir.path());
        let path = config.conversations_file.clone();

        let mut session = ChatSession::load(config).unwrap();
        let mut events = session.take_events();

        let session_id = session.send("Hello", 0).unwrap();
        let (completed, failed) = drain_until_terminal(&mut events, session_id).await;
        assert_eq!((completed, failed), (0, 1));

        let conversation = &session.conversations()[0];
        let last = conversation.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(
            last.text.starts_with("Error: "),
            "partial text must be replaced by the error marker, got {:?}",
            last.text
        );

        session.shutdown().await;

        let saved = Storage::new(path).load();
        let last = saved.conversations()[0].messages.last().unwrap().clone();
        assert!(last.text.starts_with("Error: "));
    }

    #[tokio::test]
    async fn connection_refused_fails_the_session() {
        let dir = tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut session = ChatSession::load(config_for(base_url, dir.path())).unwrap();
        let mut events = session.take_events();

        let session_id = session.send("Hello", 0).unwrap();
        let (completed, failed) = drain_until_terminal(&mut events, session_id).await;
        assert_eq!((completed, failed), (0, 1));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn creating_a_conversation_mid_stream_does_not_misroute_updates() {
        let dir = tempdir().unwrap();
        let base_url = spawn_fake_ollama(
            HAPPY_LINES.iter().map(|s| s.to_string()).collect(),
            Duration::from_millis(40),
            false,
        )
        .await;
        let mut session = ChatSession::load(config_for(base_url, dir.path())).unwrap();
        let mut events = session.take_events();

        let session_id = session.send("Hello", 0).unwrap();

        // Switch away while the reply is still streaming in.
        let new_index = session.create_new();
        assert_eq!(new_index, 1);
        assert_eq!(session.active_index(), Some(1));

        let (completed, failed) = drain_until_terminal(&mut events, session_id).await;
        assert_eq!((completed, failed), (1, 0));

        let conversations = session.conversations();
        assert_eq!(conversations[0].messages.last().unwrap().text, "Hi there");
        assert!(conversations[1].messages.is_empty());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn create_select_delete_raise_store_changed() {
        let dir = tempdir().unwrap();
        let config = config_for("http://127.0.0.1:1".into(), dir.path());
        let mut session = ChatSession::load(config).unwrap();
        let mut events = session.take_events();

        session.create_new();
        session.select(0).unwrap();
        session.delete(1).unwrap();

        for _ in 0..3 {
            assert!(matches!(next_event(&mut events).await, ChatEvent::StoreChanged));
        }

        session.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_persists_the_latest_state() {
        let dir = tempdir().unwrap();
        let config = config_for("http://127.0.0.1:1".into(), dir.path());
        let path = config.conversations_file.clone();

        let session = ChatSession::load(config).unwrap();
        session.create_new();
        session.shutdown().await;

        let saved = Storage::new(path).load();
        assert_eq!(saved.conversations().len(), 2);
    }
}

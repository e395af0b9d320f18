use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// A single message in a conversation.
///
/// Assistant messages grow in place while their response is streaming
/// and are never touched again after the stream finishes or fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

/// An ordered sequence of messages, insertion order = chronological order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

/// Contract violations on store operations, surfaced to the caller
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conversation index {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("conversation {0} has no messages")]
    EmptyConversation(usize),
}

/// The in-memory conversation list plus the index of the active one.
///
/// Invariant: `active`, when present, is a valid index into
/// `conversations`.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    active: Option<usize>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conversations(conversations: Vec<Conversation>) -> Self {
        let active = if conversations.is_empty() { None } else { Some(0) };
        Self { conversations, active }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn conversation(&self, index: usize) -> Result<&Conversation, StoreError> {
        self.conversations
            .get(index)
            .ok_or(StoreError::IndexOutOfRange(index))
    }

    /// Append an empty conversation, make it active, return its index
    pub fn create_new(&mut self) -> usize {
        self.conversations.push(Conversation::default());
        let index = self.conversations.len() - 1;
        self.active = Some(index);
        index
    }

    pub fn select(&mut self, index: usize) -> Result<(), StoreError> {
        if index >= self.conversations.len() {
            return Err(StoreError::IndexOutOfRange(index));
        }
        self.active = Some(index);
        Ok(())
    }

    /// Remove the conversation at `index`.
    ///
    /// The active index follows the surviving conversations: deleting the
    /// active one clears it (the caller re-selects), deleting an earlier
    /// one shifts it down, deleting a later one leaves it alone.
    pub fn delete(&mut self, index: usize) -> Result<(), StoreError> {
        if index >= self.conversations.len() {
            return Err(StoreError::IndexOutOfRange(index));
        }
        self.conversations.remove(index);
        self.active = match self.active {
            Some(active) if active == index => None,
            Some(active) if active > index => Some(active - 1),
            other => other,
        };
        Ok(())
    }

    pub fn append_message(&mut self, index: usize, message: Message) -> Result<(), StoreError> {
        let conversation = self
            .conversations
            .get_mut(index)
            .ok_or(StoreError::IndexOutOfRange(index))?;
        conversation.messages.push(message);
        Ok(())
    }

    /// Replace the text of the last message in conversation `index`,
    /// keeping its role. This is how a streaming response grows in place.
    pub fn replace_last_message(&mut self, index: usize, text: String) -> Result<(), StoreError> {
        let conversation = self
            .conversations
            .get_mut(index)
            .ok_or(StoreError::IndexOutOfRange(index))?;
        let last = conversation
            .messages
            .last_mut()
            .ok_or(StoreError::EmptyConversation(index))?;
        last.text = text;
        Ok(())
    }
}

/// Shared handle to the store.
///
/// The streaming task mutates the store while the UI side reads it for
/// rendering; every operation takes the lock for its own duration only
/// and never holds it across I/O.
#[derive(Clone, Default)]
pub struct StoreHandle {
    inner: Arc<Mutex<ConversationStore>>,
}

impl StoreHandle {
    pub fn new(store: ConversationStore) -> Self {
        Self { inner: Arc::new(Mutex::new(store)) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConversationStore> {
        self.inner.lock().expect("conversation store lock poisoned")
    }

    pub fn create_new(&self) -> usize {
        self.lock().create_new()
    }

    pub fn select(&self, index: usize) -> Result<(), StoreError> {
        self.lock().select(index)
    }

    pub fn delete(&self, index: usize) -> Result<(), StoreError> {
        self.lock().delete(index)
    }

    pub fn append_message(&self, index: usize, message: Message) -> Result<(), StoreError> {
        self.lock().append_message(index, message)
    }

    pub fn replace_last_message(&self, index: usize, text: String) -> Result<(), StoreError> {
        self.lock().replace_last_message(index, text)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.lock().active_index()
    }

    /// Read-only copy of the conversation list, for rendering and for
    /// snapshotting by the persistence layer
    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().conversations().to_vec()
    }

    #[allow(dead_code)]
    pub fn conversation(&self, index: usize) -> Result<Conversation, StoreError> {
        self.lock().conversation(index).cloned()
    }
}

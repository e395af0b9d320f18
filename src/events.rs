use uuid::Uuid;

/// Identifies one request/response cycle across its events
pub type SessionId = Uuid;

/// Events raised by the core for the UI collaborator.
///
/// The core never touches presentation state directly; everything the UI
/// needs to show travels through one channel, drained in arrival order by
/// whichever thread owns the display.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// The streamed response for `session_id` grew; `text` is the full
    /// cumulative text so far, not a delta
    StreamDelta { session_id: SessionId, text: String },

    /// The stream finished cleanly. Terminal for the session: the UI
    /// re-enables input on this event.
    Completed { session_id: SessionId },

    /// The stream failed at the transport level. Terminal for the
    /// session, same input re-enable contract as `Completed`.
    Failed { session_id: SessionId, error: String },

    /// The conversation list or active selection changed
    /// (create/select/delete, or a prompt being appended)
    StoreChanged,

    /// A save could not be written; the previous on-disk snapshot is
    /// still intact
    SaveFailed { error: String },
}

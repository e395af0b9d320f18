use serde::Deserialize;
use thiserror::Error;

/// One decoded unit of the streamed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamToken {
    /// Text fragment for this chunk (may be empty)
    pub delta: String,
    /// Whether the server marked this chunk as the last one
    pub done: bool,
}

/// A response line that could not be parsed as a generate chunk
#[derive(Debug, Error)]
#[error("invalid stream chunk: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Wire shape of one line of the `/api/generate` response.
/// Only `response` and `done` are load-bearing; everything else
/// the server sends (model, timings, context) is ignored.
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Decode one line of the response body.
///
/// Blank lines are transport padding, not chunks; they decode to `None`
/// and the caller skips them. Anything else must parse as a JSON chunk
/// object or the line is rejected with a `DecodeError`.
pub fn decode_line(line: &str) -> Result<Option<StreamToken>, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: GenerateChunk = serde_json::from_str(line)?;
    Ok(Some(StreamToken {
        delta: chunk.response,
        done: chunk.done,
    }))
}

/// Snapshot of the accumulated response after feeding a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatedState {
    /// Concatenation of every delta fed so far, in arrival order
    pub text: String,
    /// True once a token with `done = true` has been fed
    pub done: bool,
}

/// Folds stream tokens into the cumulative response text.
///
/// Pure state machine over an ordered token sequence: no network or
/// storage knowledge, so it is testable with a literal list of tokens.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one token into the accumulated text.
    ///
    /// Feeding after a final token is a caller bug; tokens must stop
    /// once `done` comes back true.
    pub fn feed(&mut self, token: &StreamToken) -> AccumulatedState {
        debug_assert!(!self.done, "fed a token after the stream finished");
        self.text.push_str(&token.delta);
        if token.done {
            self.done = true;
        }
        AccumulatedState {
            text: self.text.clone(),
            done: self.done,
        }
    }
}

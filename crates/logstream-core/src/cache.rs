//! Per-stream replay buffer.
//!
//! A [`LogBuffer`] is the append-only record of everything a stream has
//! broadcast so far, plus the upstream offset the next fetch starts from.
//! Serialization of access is provided by the owning
//! [`crate::streams::StreamRegistry`] slot lock.

use crate::error::StreamError;
use serde::{Deserialize, Serialize};

/// Point-in-time copy of a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub text: String,
    pub offset: u64,
    pub completed: bool,
}

/// Append-only text buffer with a monotonic offset cursor.
#[derive(Debug, Default)]
pub struct LogBuffer {
    text: String,
    last_offset: u64,
    completed: bool,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sanitized chunk and move the cursor to `new_offset`.
    ///
    /// An empty chunk still advances the cursor. A cursor that would move
    /// backwards is rejected and leaves the buffer untouched.
    pub fn append(
        &mut self,
        stream_key: &str,
        chunk: &str,
        new_offset: u64,
    ) -> Result<(), StreamError> {
        if new_offset < self.last_offset {
            return Err(StreamError::OffsetRegression {
                stream_key: stream_key.to_string(),
                current: self.last_offset,
                requested: new_offset,
            });
        }
        self.text.push_str(chunk);
        self.last_offset = new_offset;
        Ok(())
    }

    pub fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            text: self.text.clone(),
            offset: self.last_offset,
            completed: self.completed,
        }
    }

    /// Mark the stream finished. Calling it again is a no-op.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn offset(&self) -> u64 {
        self.last_offset
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

//! Remote audio sink
//!
//! There is no speaker to play the model's voice on, so while audio is enabled
//! the session keeps every payload the remote side sends on the negotiated
//! audio track. Stopping the session hands the chunks back as a [`Recording`].
//! Nothing local is captured; the local audio line stays muted.

use chrono::{DateTime, Utc};

pub const OPUS_MIME: &str = "audio/opus";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub mime: &'static str,
    pub started_at: DateTime<Utc>,
    pub chunks: Vec<Vec<u8>>,
}

impl Recording {
    pub fn len_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

#[derive(Debug)]
pub struct AudioRecorder {
    started_at: DateTime<Utc>,
    chunks: Vec<Vec<u8>>,
}

impl AudioRecorder {
    pub fn start() -> AudioRecorder {
        Self {
            started_at: Utc::now(),
            chunks: vec![],
        }
    }

    /// Empty payloads are skipped.
    pub fn push(&mut self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.chunks.push(chunk.to_vec());
        }
    }

    pub fn stop(self) -> Recording {
        Recording {
            mime: OPUS_MIME,
            started_at: self.started_at,
            chunks: self.chunks,
        }
    }
}

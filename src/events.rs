//! Progress events streamed server→client during a build invocation.
//!
//! Same shape as the persisted model but flattened for the wire: one
//! tagged enum, serialized as JSON and delivered over SSE. Clients must
//! treat `file_complete` as authoritative and discard buffered chunks for
//! that path.

use serde::{Deserialize, Serialize};

use crate::models::GeneratedFile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    FileStart {
        path: String,
    },
    FileChunk {
        path: String,
        text: String,
    },
    FileComplete {
        path: String,
        content: String,
    },
    Verify {
        message: String,
        iteration: u32,
    },
    VerifyFailed {
        errors: String,
        iteration: u32,
        #[serde(rename = "maxIterations")]
        max_iterations: u32,
    },
    Fixing {
        iteration: u32,
    },
    Done {
        #[serde(rename = "buildId")]
        build_id: i64,
        files: Vec<GeneratedFile>,
        #[serde(rename = "fileCount")]
        file_count: usize,
    },
    Error {
        message: String,
    },
}

/// Sends progress events toward the connected client.
///
/// A closed receiver means the client went away: emission stops (the
/// cancellation signal the pipeline cooperates with), but nothing already
/// persisted is touched.
pub struct EventSink {
    tx: tokio::sync::mpsc::UnboundedSender<BuildEvent>,
    cancelled: bool,
}

impl EventSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<BuildEvent>) -> Self {
        Self {
            tx,
            cancelled: false,
        }
    }

    /// Emit one event. Returns false once the client has disconnected.
    pub fn emit(&mut self, event: BuildEvent) -> bool {
        if self.cancelled {
            return false;
        }
        if self.tx.send(event).is_err() {
            self.cancelled = true;
        }
        !self.cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

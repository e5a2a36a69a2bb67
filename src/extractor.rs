//! Incremental extraction of `(path, content)` files from a model stream.
//!
//! The generation stream frames files with literal markers:
//!
//! ```text
//! ===FILE: src/App.tsx===
//! ...content...
//! ===END FILE===
//! ```
//!
//! The extractor is a synchronous state machine driven by `feed(delta)`,
//! which makes it testable across arbitrary chunk boundaries. A trailing
//! buffer at least as long as the end marker is withheld from chunk
//! emission, so a marker split across two deltas is still recognized
//! instead of leaking into file content.

use crate::models::GeneratedFile;

const FILE_START_PREFIX: &str = "===FILE:";
const MARKER_CLOSE: &str = "===";
const FILE_END_MARKER: &str = "===END FILE===";

/// Held back from chunk emission while inside a file, so a partially
/// received end marker is never emitted as content.
const HOLDBACK: usize = FILE_END_MARKER.len();

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractEvent {
    /// A file path has been announced; content follows.
    FileStart { path: String },
    /// A slice of content confirmed not to straddle a delimiter.
    FileChunk { path: String, text: String },
    /// Full trimmed content; authoritative and final for this path.
    FileComplete { path: String, content: String },
}

#[derive(Debug, PartialEq)]
enum State {
    ScanningForStart,
    InsideFile,
}

pub struct StreamingFileExtractor {
    state: State,
    buffer: String,
    current_path: Option<String>,
    current_content: String,
    /// Leading whitespace after the start marker is skipped before the
    /// first chunk, so chunks line up with the trimmed final content.
    content_started: bool,
    files: Vec<GeneratedFile>,
}

impl Default for StreamingFileExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingFileExtractor {
    pub fn new() -> Self {
        Self {
            state: State::ScanningForStart,
            buffer: String::new(),
            current_path: None,
            current_content: String::new(),
            content_started: false,
            files: Vec::new(),
        }
    }

    /// Advance the scan with one stream delta, returning any events it
    /// produced. Events preserve file-start order.
    pub fn feed(&mut self, delta: &str) -> Vec<ExtractEvent> {
        self.buffer.push_str(delta);
        let mut events = Vec::new();

        loop {
            match self.state {
                State::ScanningForStart => {
                    if !self.scan_for_start(&mut events) {
                        break;
                    }
                }
                State::InsideFile => {
                    if !self.scan_for_end(&mut events) {
                        break;
                    }
                }
            }
        }

        events
    }

    /// Terminate the stream (normal end, truncation, or deadline abort).
    /// An open file is flushed as a best-effort `FileComplete` rather than
    /// discarded.
    pub fn finish(&mut self) -> Vec<ExtractEvent> {
        let mut events = Vec::new();
        if self.state == State::InsideFile {
            let remainder = std::mem::take(&mut self.buffer);
            self.append_content(&remainder);
            self.complete_current(&mut events);
        }
        self.buffer.clear();
        events
    }

    /// Final ordered file list: first-start order, one entry per path.
    pub fn files(&self) -> &[GeneratedFile] {
        &self.files
    }

    pub fn into_files(self) -> Vec<GeneratedFile> {
        self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Look for a complete start marker. Returns true if state advanced.
    fn scan_for_start(&mut self, events: &mut Vec<ExtractEvent>) -> bool {
        let Some(prefix_idx) = self.buffer.find(FILE_START_PREFIX) else {
            // No marker prefix: retain only a tail that could still be the
            // beginning of one; anything before it is inter-file noise.
            let keep = FILE_START_PREFIX.len() - 1;
            if self.buffer.len() > keep {
                let cut = floor_char_boundary(&self.buffer, self.buffer.len() - keep);
                self.buffer.drain(..cut);
            }
            return false;
        };

        let path_start = prefix_idx + FILE_START_PREFIX.len();
        let Some(close_rel) = self.buffer[path_start..].find(MARKER_CLOSE) else {
            // Prefix seen but the path is not fully terminated yet. Drop
            // the noise before the prefix and wait for more input.
            self.buffer.drain(..prefix_idx);
            return false;
        };

        let path = self.buffer[path_start..path_start + close_rel]
            .trim()
            .to_string();
        let consumed = path_start + close_rel + MARKER_CLOSE.len();
        self.buffer.drain(..consumed);

        // A path appears at most once per pass: a repeated announcement
        // replaces the earlier content without a second FileStart.
        if !self.files.iter().any(|f| f.path == path) {
            events.push(ExtractEvent::FileStart { path: path.clone() });
        }
        self.current_path = Some(path);
        self.current_content.clear();
        self.content_started = false;
        self.state = State::InsideFile;
        true
    }

    /// Look for the end marker; emit safe chunks while waiting for it.
    /// Returns true if state advanced.
    fn scan_for_end(&mut self, events: &mut Vec<ExtractEvent>) -> bool {
        if let Some(idx) = self.buffer.find(FILE_END_MARKER) {
            let content_piece: String = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + FILE_END_MARKER.len());
            self.append_content(&content_piece);
            self.complete_current(events);
            self.state = State::ScanningForStart;
            return true;
        }

        // Emit everything except the holdback tail as a confirmed chunk.
        if self.buffer.len() > HOLDBACK {
            let cut = floor_char_boundary(&self.buffer, self.buffer.len() - HOLDBACK);
            let piece: String = self.buffer.drain(..cut).collect();
            let emitted = self.append_content(&piece);
            if !emitted.is_empty() {
                if let Some(path) = &self.current_path {
                    events.push(ExtractEvent::FileChunk {
                        path: path.clone(),
                        text: emitted,
                    });
                }
            }
        }
        false
    }

    /// Append a piece to the captured content, skipping whitespace that
    /// precedes the first real content char. Returns what a chunk event
    /// should carry for this piece.
    fn append_content(&mut self, piece: &str) -> String {
        let effective = if self.content_started {
            piece
        } else {
            let trimmed = piece.trim_start();
            if trimmed.is_empty() {
                return String::new();
            }
            self.content_started = true;
            trimmed
        };
        self.current_content.push_str(effective);
        effective.to_string()
    }

    fn complete_current(&mut self, events: &mut Vec<ExtractEvent>) {
        let Some(path) = self.current_path.take() else {
            return;
        };
        let content = std::mem::take(&mut self.current_content)
            .trim()
            .to_string();
        self.content_started = false;

        if let Some(existing) = self.files.iter_mut().find(|f| f.path == path) {
            existing.content = content.clone();
        } else {
            self.files.push(GeneratedFile::new(path.clone(), content.clone()));
        }
        events.push(ExtractEvent::FileComplete { path, content });
    }
}

/// Largest index `<= idx` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

//! Incremental `text/event-stream` parser.
//!
//! Bytes arrive in arbitrary chunks, so incomplete lines are buffered until
//! their terminating newline shows up. A line longer than [`MAX_LINE_LEN`]
//! is skipped up to its newline.

use log::warn;

pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// One server-sent event as received from upstream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame {
    /// Event name (`event:` field), if the server sent one.
    pub event: Option<String>,
    /// Event id (`id:` field), if the server sent one.
    pub id: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    discarding: bool,
    data: String,
    has_data: bool,
    event: Option<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body, returning every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if let Some(frame) = self.process_line(&String::from_utf8_lossy(&line)) {
                    frames.push(frame);
                }
            } else if self.discarding {
                continue;
            } else if self.line.len() >= MAX_LINE_LEN {
                warn!("[Stream] Dropping event-stream line over {} bytes", MAX_LINE_LEN);
                self.line = Vec::new();
                self.discarding = true;
            } else {
                self.line.push(byte);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // comment
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawFrame> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(RawFrame {
            event,
            id: self.id.take(),
            data: std::mem::take(&mut self.data),
        })
    }
}

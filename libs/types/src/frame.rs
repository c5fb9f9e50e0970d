//! Event-stream framing.
//!
//! Both the agent's HTTP event stream and the agent<->container control
//! socket use text/event-stream framing: an `event:` line, one or more
//! `data:` lines, and a blank line terminating the frame. This module
//! holds the encoder and an incremental decoder usable on any byte
//! stream.

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Encode to wire form.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str("event: ");
        out.push_str(&self.event);
        out.push('\n');
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental frame decoder.
///
/// Feed arbitrary byte chunks; complete frames pop out as they close.
/// Unknown field lines and comments are skipped, per the event-stream
/// format.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: String,
    event: String,
    data_lines: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);

            if line.is_empty() {
                // Blank line closes the frame, if one accumulated.
                if !self.event.is_empty() || !self.data_lines.is_empty() {
                    frames.push(Frame {
                        event: std::mem::take(&mut self.event),
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                }
                continue;
            }

            if let Some(rest) = field_value(&line, "event") {
                self.event = rest.to_string();
            } else if let Some(rest) = field_value(&line, "data") {
                self.data_lines.push(rest.to_string());
            }
            // comments (leading ':') and unknown fields are dropped
        }

        frames
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

use std::fmt::Write as _;

/// One Server-Sent-Events frame as written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `: {text}` comment line, ignored by `EventSource` clients.
    Comment(String),
    /// Dispatched event with an optional `id:` line.
    Event {
        /// Value of the `event:` line.
        event: &'static str,
        /// Value of the `id:` line, the envelope sequence.
        id: Option<u64>,
        /// Payload, usually JSON.
        data: String,
    },
}

impl SseFrame {
    /// Comment frame; one `:` line per input line.
    pub fn comment(text: impl Into<String>) -> Self {
        Self::Comment(text.into())
    }

    /// The `: keep-alive` heartbeat.
    #[must_use]
    pub fn keep_alive() -> Self {
        Self::Comment("keep-alive".into())
    }

    /// Named event; multi-line `data` becomes several `data:` lines.
    pub fn event(event: &'static str, id: Option<u64>, data: impl Into<String>) -> Self {
        Self::Event {
            event,
            id,
            data: data.into(),
        }
    }

    /// Renders the frame, terminated by the blank line that dispatches it.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            Self::Comment(text) => {
                for line in text.lines() {
                    let _ = writeln!(out, ": {line}");
                }
                if text.is_empty() {
                    out.push_str(":\n");
                }
            }
            Self::Event { event, id, data } => {
                let _ = writeln!(out, "event: {event}");
                if let Some(id) = id {
                    let _ = writeln!(out, "id: {id}");
                }
                if data.is_empty() {
                    out.push_str("data: \n");
                }
                for line in data.lines() {
                    let _ = writeln!(out, "data: {line}");
                }
            }
        }
        out.push('\n');
        out
    }
}

//! Sequence-numbered stream events.

use serde::{Deserialize, Serialize};

/// What a [`StreamEvent`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A token-text delta.
    Token,
    /// The stream failed; payload is the reason. Terminal.
    Error,
    /// The stream finished normally. Terminal.
    Complete,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventKind::Token)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Token => "token",
            EventKind::Error => "error",
            EventKind::Complete => "complete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of a session's broadcast.
///
/// Sequence numbers start at 0 and increase by one per event, so every
/// consumer can verify it has seen a gap-free prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub sequence: u64,
    pub kind: EventKind,
    pub payload: String,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_kinds() {
        assert!(!EventKind::Token.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(EventKind::Complete.is_terminal());
    }

    #[test]
    fn test_event_serialization() {
        let event = StreamEvent {
            sequence: 3,
            kind: EventKind::Token,
            payload: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["kind"], "token");
        assert_eq!(json["payload"], "hi");
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

pub type MessageId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    /// Status line generated locally; never transmitted.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Me,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub sender: Sender,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.sender) {
            (MessageKind::System, _) => write!(f, "* {}", self.content),
            (MessageKind::Text, Sender::Me) => write!(f, "me: {}", self.content),
            (MessageKind::Text, Sender::Peer) => write!(f, "peer: {}", self.content),
            (MessageKind::Image, Sender::Me) => write!(f, "me: [image]"),
            (MessageKind::Image, Sender::Peer) => write!(f, "peer: [image]"),
        }
    }
}

/// Application frame carried over the data channel as UTF-8 JSON:
/// `{"type": "text" | "image", "content": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum WireFrame {
    Text(String),
    Image(String),
}

impl WireFrame {
    pub fn kind(&self) -> MessageKind {
        match self {
            WireFrame::Text(_) => MessageKind::Text,
            WireFrame::Image(_) => MessageKind::Image,
        }
    }

    pub fn into_parts(self) -> (MessageKind, String) {
        match self {
            WireFrame::Text(content) => (MessageKind::Text, content),
            WireFrame::Image(content) => (MessageKind::Image, content),
        }
    }
}

pub fn encode_frame(frame: &WireFrame) -> Result<String, SessionError> {
    serde_json::to_string(frame).map_err(|err| SessionError::Transfer(err.to_string()))
}

pub fn decode_frame(payload: &str) -> Result<WireFrame, SessionError> {
    serde_json::from_str(payload).map_err(|err| SessionError::Parse(err.to_string()))
}

/// Append-only conversation log owned by one session.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a fresh id and appends. Ids are minted here and nowhere else.
    pub fn append(&mut self, kind: MessageKind, content: String, sender: Sender) -> &Message {
        self.entries.push(Message {
            id: Uuid::new_v4(),
            kind,
            content,
            sender,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn system(&mut self, content: impl Into<String>) -> &Message {
        self.append(MessageKind::System, content.into(), Sender::Me)
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::collections::HashSet;

    #[test]
    fn frames_use_flat_type_and_content() {
        let encoded = encode_frame(&WireFrame::Text("hi".into())).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({"type": "text", "content": "hi"}));

        let image = WireFrame::Image("data:image/png;base64,AAAA".into());
        let value: Value = serde_json::from_str(&encode_frame(&image).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "image", "content": "data:image/png;base64,AAAA"})
        );
    }

    #[test]
    fn decodes_frames_from_browser_peers() {
        let frame = decode_frame(r#"{"content":"héllo","type":"text"}"#).unwrap();
        assert_eq!(frame, WireFrame::Text("héllo".into()));
    }

    #[test]
    fn rejects_malformed_and_system_frames() {
        assert!(matches!(decode_frame("not json"), Err(SessionError::Parse(_))));
        assert!(matches!(
            decode_frame(r#"{"type":"system","content":"Peer connected!"}"#),
            Err(SessionError::Parse(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"text"}"#),
            Err(SessionError::Parse(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"text","content":42}"#),
            Err(SessionError::Parse(_))
        ));
    }

    #[test]
    fn log_preserves_order_and_mints_unique_ids() {
        let mut log = MessageLog::new();
        for i in 0..64 {
            let sender = if i % 2 == 0 { Sender::Me } else { Sender::Peer };
            log.append(MessageKind::Text, format!("m{i}"), sender);
        }
        assert_eq!(log.len(), 64);
        let contents: Vec<_> = log.entries().iter().map(|m| m.content.clone()).collect();
        let expected: Vec<_> = (0..64).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);
        let ids: HashSet<_> = log.entries().iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn system_entries_are_local() {
        let mut log = MessageLog::new();
        let entry = log.system("Peer connected!").clone();
        assert_eq!(entry.kind, MessageKind::System);
        assert_eq!(entry.sender, Sender::Me);
        log.clear();
        assert!(log.is_empty());
    }
}

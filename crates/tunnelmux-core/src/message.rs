//! Tunnel message model.
//!
//! A [`Message`] is the unit carried by one frame on the tunnel link. On the
//! wire it is a flat JSON record:
//!
//! ```text
//! {"message_class":"upstream","message_type":"data","uuid":"…",
//!  "ip_str":"","length":5,"data":"aGVsbG8="}
//! ```
//!
//! `data` holds the payload as standard base64; an empty payload is written
//! as `null`.

use crate::error::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side has to act on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    /// Produced inside the edge process by a client read loop.
    Local,
    /// Edge → gateway.
    Upstream,
    /// Gateway → edge.
    Downstream,
}

impl MessageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle phase a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Connect,
    Disconnect,
    Data,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One multiplexed tunnel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub class: MessageClass,
    pub kind: MessageType,
    /// UUID string naming the client connection.
    pub session_id: String,
    /// Original destination as `ip:port`, only set on `connect`.
    pub destination: Option<String>,
    /// Raw bytes for `data`; empty otherwise.
    pub payload: Vec<u8>,
}

impl Message {
    pub fn connect(
        class: MessageClass,
        session_id: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            class,
            kind: MessageType::Connect,
            session_id: session_id.into(),
            destination: Some(destination.into()),
            payload: Vec::new(),
        }
    }

    pub fn data(class: MessageClass, session_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            class,
            kind: MessageType::Data,
            session_id: session_id.into(),
            destination: None,
            payload,
        }
    }

    pub fn disconnect(class: MessageClass, session_id: impl Into<String>) -> Self {
        Self {
            class,
            kind: MessageType::Disconnect,
            session_id: session_id.into(),
            destination: None,
            payload: Vec::new(),
        }
    }

    /// Re-tag the message for the other side, keeping everything else.
    pub fn with_class(mut self, class: MessageClass) -> Self {
        self.class = class;
        self
    }

    /// Byte length of the payload, as carried in the `length` field.
    pub fn length(&self) -> usize {
        self.payload.len()
    }
}

/// Flat record layout used on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireRecord {
    message_class: MessageClass,
    message_type: MessageType,
    uuid: String,
    #[serde(default)]
    ip_str: String,
    #[serde(default)]
    length: u64,
    #[serde(default, with = "base64_bytes")]
    data: Vec<u8>,
}

impl From<&Message> for WireRecord {
    fn from(msg: &Message) -> Self {
        Self {
            message_class: msg.class,
            message_type: msg.kind,
            uuid: msg.session_id.clone(),
            ip_str: msg.destination.clone().unwrap_or_default(),
            length: msg.payload.len() as u64,
            data: msg.payload.clone(),
        }
    }
}

impl TryFrom<WireRecord> for Message {
    type Error = TunnelError;

    fn try_from(record: WireRecord) -> TunnelResult<Self> {
        if record.length != record.data.len() as u64 {
            return Err(TunnelError::Protocol(format!(
                "length field {} does not match payload of {} bytes",
                record.length,
                record.data.len()
            )));
        }
        if record.uuid.is_empty() {
            return Err(TunnelError::Protocol("message without uuid".into()));
        }

        let destination = match record.message_type {
            MessageType::Connect if !record.ip_str.is_empty() => Some(record.ip_str),
            MessageType::Connect => {
                return Err(TunnelError::Protocol(format!(
                    "connect for {} without ip_str",
                    record.uuid
                )))
            }
            _ => None,
        };

        Ok(Self {
            class: record.message_class,
            kind: record.message_type,
            session_id: record.uuid,
            destination,
            payload: record.data,
        })
    }
}

/// Payload bytes as an optional base64 string.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if bytes.is_empty() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&STANDARD.encode(bytes))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

//
// jupyter_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The version of the Jupyter messaging protocol written into every header.
pub const PROTOCOL_VERSION: &str = "5.0";

/// The set of all Jupyter channels over which messages are sent and received.
///
/// These are logical channels multiplexed onto a single websocket; there is no
/// heartbeat channel on the websocket transport.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel
    Shell,

    /// The control channel
    Control,

    /// The stdin channel
    Stdin,

    /// The iopub channel
    IOPub,
}

impl std::fmt::Display for JupyterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JupyterChannel::Shell => write!(f, "shell"),
            JupyterChannel::Control => write!(f, "control"),
            JupyterChannel::Stdin => write!(f, "stdin"),
            JupyterChannel::IOPub => write!(f, "iopub"),
        }
    }
}

impl std::str::FromStr for JupyterChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(JupyterChannel::Shell),
            "control" => Ok(JupyterChannel::Control),
            "stdin" => Ok(JupyterChannel::Stdin),
            "iopub" => Ok(JupyterChannel::IOPub),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// The header of a Jupyter message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JupyterMessageHeader {
    /// The message ID; unique for the lifetime of the session
    pub msg_id: String,

    /// The type of the message
    pub msg_type: String,

    /// The user sending the message
    #[serde(default)]
    pub username: String,

    /// The ID of the session sending the message
    #[serde(default)]
    pub session: String,

    /// ISO 8601 timestamp for when the message was created
    #[serde(default)]
    pub date: String,

    /// The messaging protocol version
    #[serde(default)]
    pub version: String,
}

/// A Jupyter message.
///
/// The `buffers` field carries raw binary payloads; it is not part of the JSON
/// body and is attached by the wire codec when a message is framed for the
/// websocket.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this
    /// message); serialized as an empty object when absent
    #[serde(
        default,
        serialize_with = "serialize_parent_header",
        deserialize_with = "deserialize_parent_header"
    )]
    pub parent_header: Option<JupyterMessageHeader>,

    /// The channel on which the message was sent (or is to be sent)
    pub channel: JupyterChannel,

    /// The message payload
    #[serde(default)]
    pub content: serde_json::Value,

    /// Additional metadata
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Binary buffers attached to the message
    #[serde(skip)]
    pub buffers: Vec<Vec<u8>>,
}

/// Options controlling message creation.
#[derive(Clone, Debug)]
pub struct MessageOptions {
    /// The type of the message to create
    pub msg_type: String,

    /// The channel the message will be sent on
    pub channel: JupyterChannel,

    /// The user creating the message
    pub username: String,

    /// The client session ID
    pub session: String,

    /// An explicit message ID; one is generated when absent
    pub msg_id: Option<String>,
}

impl JupyterMessage {
    /// Create a well-formed message with a populated header and an empty
    /// parent header. Pure construction; no I/O.
    pub fn create(
        options: MessageOptions,
        content: serde_json::Value,
        metadata: serde_json::Value,
        buffers: Vec<Vec<u8>>,
    ) -> Self {
        let msg_id = options
            .msg_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        JupyterMessage {
            header: JupyterMessageHeader {
                msg_id,
                msg_type: options.msg_type,
                username: options.username,
                session: options.session,
                date: Utc::now().to_rfc3339(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: None,
            channel: options.channel,
            content,
            metadata,
            buffers,
        }
    }

    /// Whether this is an iopub kernel status message.
    pub fn is_status(&self) -> bool {
        self.channel == JupyterChannel::IOPub && self.header.msg_type == "status"
    }

    /// The execution state carried by an iopub status message, if any.
    pub fn execution_state(&self) -> Option<&str> {
        if !self.is_status() {
            return None;
        }
        self.content.get("execution_state").and_then(|v| v.as_str())
    }
}

fn serialize_parent_header<S>(
    value: &Option<JupyterMessageHeader>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn deserialize_parent_header<'de, D>(
    deserializer: D,
) -> Result<Option<JupyterMessageHeader>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(msg_type: &str) -> MessageOptions {
        MessageOptions {
            msg_type: msg_type.to_string(),
            channel: JupyterChannel::Shell,
            username: "testuser".to_string(),
            session: "c1".to_string(),
            msg_id: None,
        }
    }

    #[test]
    fn test_create_populates_header() {
        let msg = JupyterMessage::create(
            options("kernel_info_request"),
            serde_json::json!({}),
            serde_json::json!({}),
            vec![],
        );
        assert_eq!(msg.header.msg_type, "kernel_info_request");
        assert_eq!(msg.header.username, "testuser");
        assert_eq!(msg.header.session, "c1");
        assert_eq!(msg.header.version, PROTOCOL_VERSION);
        assert!(!msg.header.msg_id.is_empty());
        assert!(!msg.header.date.is_empty());
        assert!(msg.parent_header.is_none());
    }

    #[test]
    fn test_create_honors_explicit_msg_id() {
        let mut opts = options("execute_request");
        opts.msg_id = Some("m-42".to_string());
        let msg = JupyterMessage::create(opts, serde_json::json!({}), serde_json::json!({}), vec![]);
        assert_eq!(msg.header.msg_id, "m-42");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = JupyterMessage::create(
            options("execute_request"),
            serde_json::json!({}),
            serde_json::json!({}),
            vec![],
        );
        let b = JupyterMessage::create(
            options("execute_request"),
            serde_json::json!({}),
            serde_json::json!({}),
            vec![],
        );
        assert_ne!(a.header.msg_id, b.header.msg_id);
    }

    #[test]
    fn test_empty_parent_header_round_trips() {
        let msg = JupyterMessage::create(
            options("execute_request"),
            serde_json::json!({"code": "1 + 1"}),
            serde_json::json!({}),
            vec![],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["parent_header"].as_object().unwrap().is_empty());

        let parsed: JupyterMessage = serde_json::from_value(json).unwrap();
        assert!(parsed.parent_header.is_none());
    }

    #[test]
    fn test_execution_state() {
        let mut msg = JupyterMessage::create(
            options("status"),
            serde_json::json!({"execution_state": "idle"}),
            serde_json::json!({}),
            vec![],
        );
        msg.channel = JupyterChannel::IOPub;
        assert_eq!(msg.execution_state(), Some("idle"));
    }
}

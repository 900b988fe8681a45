//
// jupyter_messages.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use cmshared::jupyter_message::JupyterMessage;
use serde::Deserialize;

/// An enum of inbound message types the session dispatcher cares about. This
/// is in no way exhaustive; everything else passes through as `Other`.
pub enum JupyterMsg {
    Status(JupyterStatus),
    CommOpen(CommOpenContent),
    CommMsg(CommMsgContent),
    CommClose(CommCloseContent),
    Other,
}

/// Convert a JupyterMessage (generic type) into a JupyterMsg (specific type)
impl From<&JupyterMessage> for JupyterMsg {
    fn from(msg: &JupyterMessage) -> Self {
        match msg.header.msg_type.as_str() {
            "status" => match serde_json::from_value::<JupyterStatus>(msg.content.clone()) {
                Ok(content) => JupyterMsg::Status(content),
                Err(_) => JupyterMsg::Other,
            },
            "comm_open" => match serde_json::from_value::<CommOpenContent>(msg.content.clone()) {
                Ok(content) => JupyterMsg::CommOpen(content),
                Err(_) => JupyterMsg::Other,
            },
            "comm_msg" => match serde_json::from_value::<CommMsgContent>(msg.content.clone()) {
                Ok(content) => JupyterMsg::CommMsg(content),
                Err(_) => JupyterMsg::Other,
            },
            "comm_close" => match serde_json::from_value::<CommCloseContent>(msg.content.clone()) {
                Ok(content) => JupyterMsg::CommClose(content),
                Err(_) => JupyterMsg::Other,
            },
            _ => JupyterMsg::Other,
        }
    }
}

#[derive(Deserialize)]
pub struct JupyterStatus {
    pub execution_state: String,
}

#[derive(Deserialize)]
#[allow(dead_code)]
pub struct CommOpenContent {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub target_module: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Deserialize)]
#[allow(dead_code)]
pub struct CommMsgContent {
    pub comm_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Deserialize)]
#[allow(dead_code)]
pub struct CommCloseContent {
    pub comm_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

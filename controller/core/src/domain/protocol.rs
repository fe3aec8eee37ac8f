// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Handshake Frames
//!
//! The agent protocol is line-delimited UTF-8. A connection starts with the
//! peer sending a single JSON object of string properties:
//!
//! ```text
//! {"Agent-Name":"build-1","Cookie":"3fa1…","Protocol":"hangar-agent/1"}
//! ```
//!
//! The controller answers with one [`HandshakeResponse`] line. After an
//! approval the socket carries the channel's text frames.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::connection::AdmissionError;

/// Property carrying the claimed agent identity. Required.
pub const AGENT_NAME_PROPERTY: &str = "Agent-Name";
/// Property carrying the reconnection cookie, in both directions.
pub const COOKIE_PROPERTY: &str = "Cookie";
/// Property naming the protocol revision the peer speaks.
pub const PROTOCOL_PROPERTY: &str = "Protocol";

pub const PROTOCOL_NAME: &str = "hangar-agent/1";

pub const PING_FRAME: &str = "ping";
pub const PONG_FRAME: &str = "pong";

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeResponse {
    Approved { properties: BTreeMap<String, String> },
    Rejected { cause: String, message: String },
}

impl HandshakeResponse {
    pub fn rejected(error: &AdmissionError) -> Self {
        Self::Rejected {
            cause: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parse the peer's opening properties frame.
pub fn parse_properties(frame: &str) -> Result<HashMap<String, String>, AdmissionError> {
    let value: serde_json::Value = serde_json::from_str(frame.trim())
        .map_err(|e| AdmissionError::Protocol(format!("malformed properties frame: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| AdmissionError::Protocol("properties frame must be a JSON object".to_string()))?;

    object
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => Ok((key.clone(), s.clone())),
            other => Err(AdmissionError::Protocol(format!(
                "property '{}' must be a string, got {}",
                key, other
            ))),
        })
        .collect()
}

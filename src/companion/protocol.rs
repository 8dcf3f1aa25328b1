// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Message protocol definitions and serialization.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message types supported by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "TIME_REQ")]
    TimeRequest,
    #[serde(rename = "TIME_RESP")]
    TimeResponse,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ACK")]
    Ack,
}

impl MessageType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeRequest => "TIME_REQ",
            Self::TimeResponse => "TIME_RESP",
            Self::Heartbeat => "HEARTBEAT",
            Self::Ack => "ACK",
        }
    }
}

/// Protocol message structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version
    #[serde(rename = "v")]
    pub version: u8,

    /// Message type
    #[serde(rename = "t")]
    pub message_type: MessageType,

    /// Payload content
    #[serde(rename = "p")]
    pub payload: String,

    /// Timestamp in milliseconds
    #[serde(rename = "ts")]
    pub timestamp: u64,

    /// Checksum (first 8 chars of SHA-256)
    #[serde(rename = "cs")]
    pub checksum: String,
}

impl Message {
    /// Create a new signed message with automatic timestamp.
    pub fn new(message_type: MessageType, payload: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut msg = Self {
            version: PROTOCOL_VERSION,
            message_type,
            payload: payload.into(),
            timestamp,
            checksum: String::new(),
        };
        msg.sign();
        msg
    }

    /// Create a TIME_REQ message.
    pub fn time_request(request_id: impl Into<String>) -> Result<Self> {
        let payload = TimeRequestPayload {
            request_id: request_id.into(),
        };
        Ok(Self::new(MessageType::TimeRequest, payload.to_json()?))
    }

    /// Create a TIME_RESP message.
    pub fn time_response(payload: &TimeResponsePayload) -> Result<Self> {
        Ok(Self::new(MessageType::TimeResponse, payload.to_json()?))
    }

    /// Create a HEARTBEAT message.
    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, "")
    }

    /// Create an ACK message for a given timestamp.
    pub fn ack(original_timestamp: u64) -> Self {
        Self::new(MessageType::Ack, original_timestamp.to_string())
    }

    /// Recompute the checksum.
    pub fn sign(&mut self) {
        self.checksum = checksum(
            self.version,
            self.message_type.as_str(),
            &self.payload,
            self.timestamp,
        );
    }

    /// Verify the message checksum.
    pub fn verify(&self) -> bool {
        checksum(
            self.version,
            self.message_type.as_str(),
            &self.payload,
            self.timestamp,
        ) == self.checksum
    }

    /// Serialize to JSON string with newline delimiter.
    pub fn to_json(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }

    /// Parse from JSON string, rejecting unknown versions and bad checksums.
    pub fn from_json(json: &str) -> Result<Self> {
        let trimmed = json.trim();
        let msg: Self = serde_json::from_str(trimmed)?;

        if msg.version != PROTOCOL_VERSION {
            return Err(anyhow!("Unsupported protocol version {}", msg.version));
        }
        if !msg.verify() {
            return Err(anyhow!("Checksum verification failed"));
        }

        Ok(msg)
    }
}

/// Calculate message checksum.
pub fn checksum(version: u8, msg_type: &str, payload: &str, timestamp: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.to_string().as_bytes());
    hasher.update(msg_type.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());

    let hash = hasher.finalize();
    hex::encode(&hash[..4]) // First 4 bytes = 8 hex chars
}

/// Time request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRequestPayload {
    pub request_id: String,
}

impl TimeRequestPayload {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Time response payload. A response without `request_id` is a push
/// from the phone, e.g. after the user changed its clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,

    /// Phone wall-clock time in milliseconds since the UNIX epoch.
    pub time_millis: i64,

    /// IANA time zone of the phone.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time_zone: Option<String>,
}

impl TimeResponsePayload {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

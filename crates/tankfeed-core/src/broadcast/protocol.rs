//! Wire messages of the live channel.

use crate::mapping::CanonicalRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state reported to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TankDataPayload<'a> {
    pub records: &'a [CanonicalRecord],
    pub last_sync: DateTime<Utc>,
    pub connection_status: ConnectionStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub connection_status: ConnectionStatus,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Messages pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage<'a> {
    TankData { data: TankDataPayload<'a> },
    Status { data: StatusPayload },
    Error {
        source: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage<'_> {
    /// Serialize to the JSON text sent on the wire.
    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages a subscriber may send. Anything else is treated as plain
/// activity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    /// Application-level acknowledgment of a probe
    Pong,
    /// Application-level probe from the viewer
    Ping,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

//! Network events and their persisted form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::aggregate::NetworkStatus;
use crate::error::LoaderError;
use crate::types::LightBlock;

/// Everything that can happen to the network aggregate.
///
/// The same variants drive live application and replay, through one reducer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum NetworkEvent {
    /// The write side was reconciled with the read side's committed height.
    Initialized {
        request_id: String,
        status: NetworkStatus,
        /// Height the window was clamped to; `-1` when nothing is indexed.
        indexed_height: i64,
    },
    /// A validated batch was appended to the window.
    BlocksAdded {
        request_id: String,
        status: NetworkStatus,
        blocks: Vec<LightBlock>,
    },
    /// A common ancestor was found; forward ingestion is blocked.
    ReorganisationStarted {
        request_id: String,
        status: NetworkStatus,
        /// Last height where local and source chains agree.
        height: u64,
        /// Local blocks above `height`, ascending.
        blocks: Vec<LightBlock>,
    },
    /// The window was truncated to the common ancestor.
    ReorganisationFinished {
        request_id: String,
        status: NetworkStatus,
        height: u64,
        /// The rolled-back blocks, ascending.
        blocks: Vec<LightBlock>,
    },
}

impl NetworkEvent {
    /// The persisted type tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Initialized { .. } => "Initialized",
            Self::BlocksAdded { .. } => "BlocksAdded",
            Self::ReorganisationStarted { .. } => "ReorganisationStarted",
            Self::ReorganisationFinished { .. } => "ReorganisationFinished",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Initialized { request_id, .. }
            | Self::BlocksAdded { request_id, .. }
            | Self::ReorganisationStarted { request_id, .. }
            | Self::ReorganisationFinished { request_id, .. } => request_id,
        }
    }

    /// The status the aggregate holds after this event.
    pub fn status(&self) -> NetworkStatus {
        match self {
            Self::Initialized { status, .. }
            | Self::BlocksAdded { status, .. }
            | Self::ReorganisationStarted { status, .. }
            | Self::ReorganisationFinished { status, .. } => *status,
        }
    }
}

/// An event as stored in the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub aggregate_id: String,
    /// 1-based, strictly increasing per aggregate.
    pub version: u64,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Wrap `event` for persistence at `version`.
    pub fn new(
        aggregate_id: impl Into<String>,
        version: u64,
        event: &NetworkEvent,
    ) -> Result<Self, LoaderError> {
        let mut tagged = serde_json::to_value(event)?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            version,
            event_type: event.event_type().to_string(),
            payload,
            timestamp: Utc::now(),
        })
    }

    /// Decode the stored payload back into a [`NetworkEvent`].
    pub fn decode(&self) -> Result<NetworkEvent, LoaderError> {
        let tagged = json!({ "type": self.event_type, "payload": self.payload });
        Ok(serde_json::from_value(tagged)?)
    }
}

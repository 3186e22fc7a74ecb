//! JSON messages exchanged between tree clients and the relay.
//!
//! Requests carry a client-chosen `id` echoed back in the reply. A `watch`
//! request's id also names the subscription in later `event` messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DbRequest {
    Set { id: u64, path: String, value: Value },
    Get { id: u64, path: String },
    /// Reply value is the generated child key
    Push { id: u64, path: String, value: Value },
    Remove { id: u64, path: String },
    Watch { id: u64, path: String },
    /// Fire-and-forget
    Unwatch { watch_id: u64 },
    OnDisconnectRemove { id: u64, path: String },
}

impl DbRequest {
    /// Id the relay will answer to, if any
    pub fn id(&self) -> Option<u64> {
        match self {
            DbRequest::Set { id, .. }
            | DbRequest::Get { id, .. }
            | DbRequest::Push { id, .. }
            | DbRequest::Remove { id, .. }
            | DbRequest::Watch { id, .. }
            | DbRequest::OnDisconnectRemove { id, .. } => Some(*id),
            DbRequest::Unwatch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DbResponse {
    Ok {
        id: u64,
        #[serde(default)]
        value: Option<Value>,
    },
    Error {
        id: u64,
        message: String,
    },
    /// Value at a watched path after a change; `None` when absent
    Event {
        watch_id: u64,
        #[serde(default)]
        value: Option<Value>,
    },
}

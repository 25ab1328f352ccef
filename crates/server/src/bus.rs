// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed broadcast bus fanning events out to attached clients.
//!
//! Publishing never blocks: the bus rides a bounded `tokio::sync::broadcast`
//! channel, and a subscriber that falls more than the queue depth behind
//! observes `Lagged` on its receiver. The WebSocket layer treats that as a
//! drop-slowest disconnect rather than letting one client stall the fleet.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::registry::{Instance, Ordinal, PortForward};
use crate::status::Status;

/// Events delivered to attached clients. Tag strings double as the wire
/// protocol's frame types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    /// Raw terminal bytes. Hot path; per-instance source order is preserved
    /// because each instance has exactly one publishing pump. `offset` is
    /// the global scrollback byte offset of the first payload byte, letting
    /// attach replay and the live stream splice without duplication.
    #[serde(rename = "terminal:data")]
    TerminalData {
        id: String,
        #[serde(with = "b64")]
        data: Bytes,
        offset: u64,
    },
    #[serde(rename = "terminal:exit")]
    TerminalExit { id: String, code: i32 },
    #[serde(rename = "status:changed")]
    StatusChanged { id: String, status: Status },
    #[serde(rename = "port:forwarded")]
    PortForwarded { forward: PortForward },
    #[serde(rename = "port:closed")]
    PortClosed { forward: PortForward },
    #[serde(rename = "instance:created")]
    InstanceCreated { instance: Instance },
    #[serde(rename = "instance:updated")]
    InstanceUpdated { instance: Instance },
    #[serde(rename = "instance:deleted")]
    InstanceDeleted { id: String },
    /// Bulk reorder result carrying the new ordinals.
    #[serde(rename = "instance:reordered")]
    InstanceReordered { ordinals: Vec<Ordinal> },
}

impl BusEvent {
    /// Instance id for per-instance events, `None` for fleet-wide ones.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::TerminalData { id, .. }
            | Self::TerminalExit { id, .. }
            | Self::StatusChanged { id, .. }
            | Self::InstanceDeleted { id } => Some(id),
            Self::PortForwarded { forward } | Self::PortClosed { forward } => {
                Some(&forward.instance_id)
            }
            Self::InstanceCreated { instance } | Self::InstanceUpdated { instance } => {
                Some(&instance.id)
            }
            Self::InstanceReordered { .. } => None,
        }
    }
}

/// Cloneable handle to the process-wide event stream.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers. A send with no subscribers is fine.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Base64 (standard alphabet) serde adapter for terminal byte payloads.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;

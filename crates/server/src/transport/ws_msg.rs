// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Attach-protocol message types.
//!
//! Inbound frames are internally tagged (`{"type": "attach", ...}`).
//! Outbound terminal payloads (history and live `terminal:data`) carry
//! base64; inbound `terminal:input` carries plain text typed by the user.

use serde::{Deserialize, Serialize};

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Subscribe to an instance. The server replies with a
    /// `terminal:history` snapshot, then streams live events.
    #[serde(rename = "attach")]
    Attach {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },

    #[serde(rename = "detach")]
    Detach { id: String },

    /// Write bytes to the instance's shell.
    #[serde(rename = "terminal:input")]
    Input { id: String, data: String },

    #[serde(rename = "terminal:resize")]
    Resize { id: String, cols: u16, rows: u16 },

    #[serde(rename = "ping")]
    Ping {},
}

/// Server → client frames that are not bus events. Live events are
/// serialized [`crate::bus::BusEvent`]s and share the same `type` tagging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Scrollback snapshot sent first on attach. `data` is base64.
    #[serde(rename = "terminal:history")]
    History { id: String, data: String },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "pong")]
    Pong {},
}

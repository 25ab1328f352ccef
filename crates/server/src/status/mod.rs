// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance status domain: the four-valued state, its producers, and the
//! reconciliation pipeline that turns candidates into persisted transitions.

pub mod local_poll;
pub mod reconcile;
pub mod remote_poll;
pub mod window;

use serde::{Deserialize, Serialize};

/// Canonical instance status. Stored CHECK-constrained in the registry;
/// every transition goes through the [`reconcile::Reconciler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Working,
    Awaiting,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Awaiting => "awaiting",
            Self::Error => "error",
        }
    }

    /// Parse a stored or client-supplied status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "working" => Some(Self::Working),
            "awaiting" => Some(Self::Awaiting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a status candidate came from. Hooks are authoritative; pollers are
/// heuristic and defer to the hook-priority window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    Hook,
    LocalPoll,
    RemotePoll,
    Api,
}

impl StatusSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hook => "hook",
            Self::LocalPoll => "local-poll",
            Self::RemotePoll => "remote-poll",
            Self::Api => "api",
        }
    }
}

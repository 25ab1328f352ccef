// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hook-priority grace window.
//!
//! A stop/notification hook is authoritative, but the session log it refers
//! to keeps a fresh mtime for several seconds afterwards. Without a grace
//! window the next poll would flip `idle → working` right after an
//! authoritative `working → idle`. Pollers therefore defer to any hook
//! recorded within the TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Which authoritative hook set the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Stop,
    Notification,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Notification => "notification",
        }
    }
}

/// In-memory map instance → latest hook record. Process-local: a restart
/// forfeits the guarantee because hooks and pollers both restart with it.
pub struct HookWindow {
    ttl: Duration,
    entries: Mutex<HashMap<String, (HookKind, Instant)>>,
}

impl HookWindow {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Record a hook for the instance, overwriting any earlier entry.
    pub fn record(&self, instance_id: &str, kind: HookKind) {
        self.entries.lock().insert(instance_id.to_owned(), (kind, Instant::now()));
    }

    /// True while a hook recorded less than the TTL ago covers the instance.
    /// Expired entries are evicted on read.
    pub fn should_defer_to_hook(&self, instance_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(instance_id) {
            Some((_, at)) if at.elapsed() < self.ttl => true,
            Some(_) => {
                entries.remove(instance_id);
                false
            }
            None => false,
        }
    }

    /// Drop an instance's entry (on delete).
    pub fn forget(&self, instance_id: &str) {
        self.entries.lock().remove(instance_id);
    }

    /// Drop everything (shutdown).
    pub fn drain(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
#[path = "window_tests.rs"]
mod tests;

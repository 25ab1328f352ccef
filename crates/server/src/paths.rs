// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Path helpers: home-shorthand expansion and session-log directory naming.

use std::path::{Path, PathBuf};

/// Expand a leading `~` to the current user's home directory.
///
/// Idempotent: a path with no home-shorthand is returned unchanged, so
/// `expand_tilde(expand_tilde(p)) == expand_tilde(p)`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    PathBuf::from(path)
}

/// The session-log directory for a project working directory.
///
/// The log layout keys each project by its absolute path with separators
/// replaced by dashes (`/home/u/proj` → `-home-u-proj`), all under a single
/// per-user log root.
pub fn session_log_dir(log_root: &Path, working_dir: &str) -> PathBuf {
    let absolute = expand_tilde(working_dir);
    log_root.join(dashed_name(&absolute))
}

/// Flatten an absolute path into a single dashed component.
pub fn dashed_name(path: &Path) -> String {
    path.to_string_lossy().replace('/', "-")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn quote_passes_plain_paths_through() {
    assert_eq!(shell_quote("/srv/app"), "/srv/app");
    assert_eq!(shell_quote("a-b_c.d"), "a-b_c.d");
}

#[test]
fn quote_wraps_specials_and_escapes_single_quotes() {
    assert_eq!(shell_quote("my proj"), "'my proj'");
    assert_eq!(shell_quote("it's"), "'it'\\''s'");
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("$HOME"), "'$HOME'");
}

#[yare::parameterized(
    bare_tilde = { "~", "cd ~" },
    tilde_subdir = { "~/proj", "cd ~/proj" },
    tilde_with_space = { "~/my proj", "cd ~/'my proj'" },
    absolute = { "/srv/app", "cd /srv/app" },
    absolute_with_space = { "/srv/my app", "cd '/srv/my app'" },
)]
fn cd_preamble_leaves_tilde_unquoted(dir: &str, expected: &str) {
    assert_eq!(cd_command(dir), expected);
}

#[test]
#[serial_test::serial]
fn explicit_key_must_be_readable() {
    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("deploy_key");
    std::fs::write(&key, "not-really-a-key").unwrap();

    let found = select_key(Some(&key.to_string_lossy())).unwrap();
    assert_eq!(found, key);

    let missing = dir.path().join("absent");
    assert!(select_key(Some(&missing.to_string_lossy())).is_err());
}

#[test]
#[serial_test::serial]
fn default_keys_tried_in_canonical_order() {
    let home = tempfile::tempdir().unwrap();
    std::env::set_var("HOME", home.path());
    let ssh_dir = home.path().join(".ssh");
    std::fs::create_dir_all(&ssh_dir).unwrap();

    // No keys at all: selection fails.
    assert!(select_key(None).is_err());

    // Only the last-priority key present.
    std::fs::write(ssh_dir.join("id_rsa"), "k").unwrap();
    assert_eq!(select_key(None).unwrap(), ssh_dir.join("id_rsa"));

    // A higher-priority key wins once it exists.
    std::fs::write(ssh_dir.join("id_ed25519"), "k").unwrap();
    assert_eq!(select_key(None).unwrap(), ssh_dir.join("id_ed25519"));
}

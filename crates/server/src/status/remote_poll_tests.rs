// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn probe_parses_status_replies() {
    assert_eq!(parse_probe(r#"{"status":"working"}"#), Ok(Status::Working));
    assert_eq!(parse_probe(r#"{"status":"idle"}"#), Ok(Status::Idle));
    // Login-shell noise before the JSON is tolerated.
    assert_eq!(parse_probe("motd banner\n{\"status\":\"idle\"}"), Ok(Status::Idle));
}

#[test]
fn probe_errors_do_not_become_statuses() {
    assert!(parse_probe(r#"{"error":"stat: not found"}"#).is_err());
    assert!(parse_probe("").is_err());
    assert!(parse_probe("not json at all").is_err());
    assert!(parse_probe(r#"{"status":"sideways"}"#).is_err());
    assert!(parse_probe(r#"{}"#).is_err());
}

#[test]
fn probe_command_embeds_threshold_and_dashing() {
    let cmd = probe_command("~/.flotilla/projects", "~/proj", 60);
    assert!(cmd.contains("tr / -"));
    assert!(cmd.contains("-lt 60"));
    assert!(cmd.contains("$HOME/.flotilla/projects"));
    // The working dir ships quoted so the remote shell, not ours, expands it.
    assert!(cmd.contains("wd='~/proj'"));
    assert!(cmd.contains(r#"printf '{"status":"idle"}'"#));
}

#[test]
fn probe_command_quotes_awkward_working_dirs() {
    let cmd = probe_command("/var/logs", "/srv/my app", 60);
    assert!(cmd.contains("wd='/srv/my app'"));
    assert!(cmd.contains("/var/logs"));
}

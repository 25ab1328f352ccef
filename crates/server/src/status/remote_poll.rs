// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote status poller: the local poller's mtime heuristic, executed on the
//! remote host through an SSH exec probe.

use std::collections::HashMap;
use std::sync::Arc;

use russh::ChannelMsg;
use serde::Deserialize;

use crate::registry::{Instance, Machine};
use crate::state::AppState;
use crate::status::{Status, StatusSource};
use crate::term::ssh::{connect_with, shell_quote, ShellHandler};

/// Spawn the background remote poll loop.
///
/// Ticks are best-effort single-flight: the tick body runs inline and
/// `MissedTickBehavior::Skip` drops (never queues) fires that land while a
/// slow tick is still executing. Probe errors change nothing.
pub fn spawn_remote_poller(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let interval = state.config.remote_poll_interval();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            run_tick(&state).await;
        }
    })
}

async fn run_tick(state: &AppState) {
    let instances = match state.db.open_instances_by_binding(true) {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(err = %e, "remote poll: registry read failed, skipping tick");
            return;
        }
    };
    if instances.is_empty() {
        return;
    }

    // Group by machine so one connection serves every instance on the host.
    let mut by_machine: HashMap<String, Vec<Instance>> = HashMap::new();
    for instance in instances {
        if let Some(machine_id) = instance.machine_id.clone() {
            by_machine.entry(machine_id).or_default().push(instance);
        }
    }

    for (machine_id, group) in by_machine {
        let machine = match state.db.get_machine(&machine_id) {
            Ok(Some(m)) => m,
            Ok(None) => {
                tracing::warn!(machine = %machine_id, "remote poll: machine row missing");
                continue;
            }
            Err(e) => {
                tracing::warn!(machine = %machine_id, err = %e, "remote poll: machine read failed");
                continue;
            }
        };
        poll_machine(state, &machine, &group).await;
    }
}

async fn poll_machine(state: &AppState, machine: &Machine, group: &[Instance]) {
    let handle = match connect_with(machine, state.config.ssh_timeout(), ShellHandler).await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(host = %machine.host, err = %e, "remote poll: connect failed");
            if let Err(e) = state.db.set_machine_liveness(&machine.id, "offline") {
                tracing::warn!(machine = %machine.id, err = %e, "remote poll: liveness update failed");
            }
            return;
        }
    };
    if let Err(e) = state.db.set_machine_liveness(&machine.id, "online") {
        tracing::warn!(machine = %machine.id, err = %e, "remote poll: liveness update failed");
    }

    for instance in group {
        let cmd = probe_command(
            &state.config.log_root,
            &instance.working_dir,
            state.config.idle_after_secs,
        );
        let candidate = match run_probe(&handle, &cmd).await {
            Ok(output) => match parse_probe(&output) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(instance = %instance.id, err = %e, "remote probe unparseable");
                    continue;
                }
            },
            Err(e) => {
                tracing::warn!(instance = %instance.id, err = %e, "remote probe failed");
                continue;
            }
        };

        if let Err(e) = state
            .reconciler
            .submit_poll(&instance.id, candidate, StatusSource::RemotePoll)
            .await
        {
            tracing::warn!(instance = %instance.id, err = %e, "remote poll: submit failed");
        }
    }

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "poll complete", "en")
        .await;
}

/// Run one probe command on a fresh exec channel, collecting stdout.
async fn run_probe(
    handle: &russh::client::Handle<ShellHandler>,
    cmd: &str,
) -> anyhow::Result<String> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, cmd).await?;

    let mut output = Vec::new();
    let mut exit_code: Option<u32> = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    if let Some(code) = exit_code {
        if code != 0 {
            anyhow::bail!("probe exited with status {code}");
        }
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

/// Build the POSIX-sh probe. It reproduces the local classification on the
/// remote host — dashed session-log dir under the log root, newest file
/// mtime, inclusive-above idle threshold — and prints one JSON object.
pub fn probe_command(log_root: &str, working_dir: &str, idle_after_secs: u64) -> String {
    // A `~/`-style log root must expand against the *remote* home.
    let root = if log_root == "~" {
        "$HOME".to_owned()
    } else if let Some(rest) = log_root.strip_prefix("~/") {
        format!("$HOME/{}", shell_quote(rest))
    } else {
        shell_quote(log_root)
    };

    format!(
        concat!(
            "wd={wd}; ",
            "case \"$wd\" in \"~\") wd=\"$HOME\";; \"~/\"*) wd=\"$HOME/${{wd#??}}\";; esac; ",
            "name=$(printf %s \"$wd\" | tr / -); ",
            "d={root}/\"$name\"; ",
            "if [ ! -d \"$d\" ]; then printf '{{\"status\":\"idle\"}}'; exit 0; fi; ",
            "new=0; ",
            "for f in \"$d\"/*; do ",
            "[ -f \"$f\" ] || continue; ",
            "m=$(stat -c %Y \"$f\" 2>/dev/null || stat -f %m \"$f\" 2>/dev/null) || continue; ",
            "[ \"$m\" -gt \"$new\" ] && new=$m; ",
            "done; ",
            "if [ \"$new\" -eq 0 ]; then printf '{{\"status\":\"idle\"}}'; exit 0; fi; ",
            "age=$(( $(date +%s) - new )); ",
            "if [ \"$age\" -lt {secs} ]; then printf '{{\"status\":\"working\"}}'; ",
            "else printf '{{\"status\":\"idle\"}}'; fi"
        ),
        wd = shell_quote(working_dir),
        root = root,
        secs = idle_after_secs,
    )
}

#[derive(Debug, Deserialize)]
struct ProbeReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse the probe's JSON line into a status candidate.
pub fn parse_probe(output: &str) -> Result<Status, String> {
    let trimmed = output.trim();
    let json_start = trimmed.find('{').ok_or_else(|| "no JSON in probe output".to_owned())?;
    let reply: ProbeReply = serde_json::from_str(&trimmed[json_start..])
        .map_err(|e| format!("bad probe JSON: {e}"))?;

    if let Some(err) = reply.error {
        return Err(format!("probe reported error: {err}"));
    }
    let status = reply.status.ok_or_else(|| "probe reply missing status".to_owned())?;
    Status::parse(&status).ok_or_else(|| format!("probe reported unknown status {status:?}"))
}

#[cfg(test)]
#[path = "remote_poll_tests.rs"]
mod tests;

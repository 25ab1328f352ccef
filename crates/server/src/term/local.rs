// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local PTY backend: the user's login shell under `forkpty`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Backend, ExitStatus, SpawnSpec};
use crate::paths::expand_tilde;

/// PTY master registered with the tokio reactor.
///
/// Reads and writes go through readiness guards so the run loop never
/// blocks the runtime on a quiet or saturated fd.
struct Master {
    io: AsyncFd<OwnedFd>,
}

impl Master {
    /// Flip the fd to non-blocking mode and hand it to the reactor.
    fn new(fd: OwnedFd) -> anyhow::Result<Self> {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(errno_to_io)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(errno_to_io)?;
        Ok(Self { io: AsyncFd::new(fd).context("AsyncFd::new failed")? })
    }

    /// Read one chunk of shell output.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.io.readable().await?;
            match guard.try_io(|io| nix::unistd::read(io.as_raw_fd(), buf).map_err(errno_to_io)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer, waiting out partial writes.
    async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|io| nix::unistd::write(io.get_ref(), data).map_err(errno_to_io)) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Local backend owning one shell child on a PTY.
pub struct LocalPty {
    master: Master,
    child: Pid,
    cancel: CancellationToken,
}

impl LocalPty {
    /// Fork a login shell onto a fresh PTY with the configured grid.
    ///
    /// The child environment is the parent's plus the spawn contract:
    /// `TERM`, `COLORTERM`, and `INSTANCE_ID` (read by hook scripts to
    /// identify their session), then any per-spawn overrides.
    // forkpty requires unsafe: the child is partially initialized post-fork.
    #[allow(unsafe_code)]
    pub fn spawn(spec: &SpawnSpec, cancel: CancellationToken) -> anyhow::Result<Self> {
        let initial_dir = expand_tilde(&spec.working_dir);
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_owned());

        let winsize =
            Winsize { ws_col: spec.cols, ws_row: spec.rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty leaves the child in a partially-initialized state.
        // The child branch only sets env/cwd and execs.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;
        let ForkptyResult { master, fork_result } = result;

        match fork_result {
            nix::unistd::ForkResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("COLORTERM", "truecolor");
                std::env::set_var("INSTANCE_ID", &spec.instance_id);
                for (key, value) in &spec.env {
                    std::env::set_var(key, value);
                }
                let _ = std::env::set_current_dir(&initial_dir);

                let argv: Vec<CString> = vec![
                    CString::new(shell.as_bytes()).context("invalid shell path")?,
                    CString::new("-l").context("invalid shell arg")?,
                ];
                execvp(&argv[0], &argv).context("execvp failed")?;
                unreachable!();
            }
            nix::unistd::ForkResult::Parent { child } => {
                Ok(Self { master: Master::new(master)?, child, cancel })
            }
        }
    }

    // TIOCSWINSZ needs the raw ioctl.
    #[allow(unsafe_code)]
    fn apply_winsize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        // SAFETY: TIOCSWINSZ on the PTY master fd with an initialized Winsize.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for LocalPty {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
        mut resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        let pid = self.child;
        let cancel = self.cancel.clone();
        Box::pin(async move {
            let mut buf = vec![0u8; 8192];
            let mut killed = false;
            let mut input_open = true;
            let mut resize_open = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled(), if !killed => {
                        killed = true;
                        let _ = kill(pid, Signal::SIGTERM);
                        // Keep reading: the shell may flush final output
                        // before the fd reports EOF/EIO.
                    }
                    result = self.master.read(&mut buf) => {
                        match result {
                            Ok(0) => break,
                            Ok(n) => {
                                let data = Bytes::copy_from_slice(&buf[..n]);
                                if output_tx.send(data).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    input = input_rx.recv(), if input_open && !killed => {
                        match input {
                            Some(data) => self.master.write_all(&data).await?,
                            None => input_open = false,
                        }
                    }
                    resize = resize_rx.recv(), if resize_open => {
                        match resize {
                            Some((cols, rows)) => { let _ = self.apply_winsize(cols, rows); }
                            None => resize_open = false,
                        }
                    }
                }
            }

            // Reap on a blocking thread so the runtime is never parked.
            let status = tokio::task::spawn_blocking(move || wait_for_exit(pid))
                .await
                .context("join wait thread")??;
            Ok(status)
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.apply_winsize(cols, rows)
    }

    fn child_pid(&self) -> Option<u32> {
        Some(self.child.as_raw() as u32)
    }
}

impl Drop for LocalPty {
    fn drop(&mut self) {
        // Best-effort shutdown: SIGHUP, brief grace, SIGKILL.
        let _ = kill(self.child, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(self.child, Signal::SIGKILL);
        let _ = waitpid(self.child, Some(WaitPidFlag::WNOHANG));
    }
}

/// Block until the child exits and convert the wait status.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None })
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) })
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => {
                // Already reaped (e.g. via Drop); treat as signaled shutdown.
                return Ok(ExitStatus { code: None, signal: Some(Signal::SIGHUP as i32) });
            }
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

//! The exec bridge: runs a resolved command inside the workload via the
//! container runtime's exec entry point and pumps bytes between the
//! child and the SSH channel.
//!
//! Each accepted start-command becomes one independently scheduled
//! bridge task. The child is started as a session leader (and, with a
//! terminal, as the controlling process of that terminal) so it is
//! decoupled from the gateway's own process group. Exactly one
//! exit-status notification is sent per invocation, strictly before the
//! channel is closed.

use std::{os::fd::OwnedFd, process::Stdio};

use {
    russh::{ChannelId, CryptoVec, server::Handle},
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        process::Command,
        sync::mpsc,
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

/// Fixed interactive login shell used when no command text is supplied.
pub const DEFAULT_SHELL: &[&str] = &["/bin/bash", "-login"];

/// A resolved command to run inside the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInvocation {
    /// Argument vector handed to the runtime's exec entry point.
    pub argv: Vec<String>,
    /// Whether the child is attached to a pseudo-terminal.
    pub tty: bool,
}

impl ExecInvocation {
    /// Resolve optional command text with shell-style word splitting.
    ///
    /// Empty or absent text resolves to the default login shell.
    pub fn resolve(command: Option<&str>, tty: bool) -> Result<Self, shell_words::ParseError> {
        let argv = shell_words::split(command.unwrap_or_default())?;
        let argv = if argv.is_empty() {
            DEFAULT_SHELL.iter().map(|s| s.to_string()).collect()
        } else {
            argv
        };
        Ok(Self { argv, tty })
    }
}

/// The sandbox runtime and container a bridge execs into.
#[derive(Debug, Clone)]
pub struct ExecTarget {
    /// Container runtime CLI binary (e.g. `docker`).
    pub runtime: String,
    /// Identifier of the target container.
    pub container_id: String,
    /// Detach-key sequence forwarded to the runtime (may be empty).
    pub detach_keys: String,
}

/// Pty endpoints handed to a bridge when the channel has a terminal.
///
/// The master duplicates feed the two pump tasks; the peripheral
/// duplicates become the child's stdio.
pub struct PtyIo {
    pub master_read: std::fs::File,
    pub master_write: std::fs::File,
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Compute the status code reported to the remote caller.
///
/// 0 on clean success, the child's exit code otherwise, 1 when the
/// child could not be run (or was signal-terminated) or when stream
/// finalization failed without another explicit code.
fn exit_outcome(wait: &std::io::Result<std::process::ExitStatus>, finalize_failed: bool) -> u32 {
    let mut outcome = match wait {
        Ok(status) => status.code().unwrap_or(1) as u32,
        Err(_) => 1,
    };
    if outcome == 0 && finalize_failed {
        outcome = 1;
    }
    outcome
}

/// Run one invocation to completion and report it on the channel.
///
/// Ordering: output pumps are flushed, the outbound direction is
/// closed, one `exit-status` is sent, the channel is closed, and only
/// then are the remaining pump tasks joined.
pub async fn run_bridge(
    handle: Handle,
    channel: ChannelId,
    target: ExecTarget,
    invocation: ExecInvocation,
    term_env: Vec<(String, String)>,
    pty: Option<PtyIo>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut cmd = Command::new(&target.runtime);
    cmd.arg("exec")
        .arg("-i")
        .arg(format!("--detach-keys={}", target.detach_keys));
    if invocation.tty {
        cmd.arg("-t");
    }
    cmd.arg(&target.container_id).args(&invocation.argv);
    // The gateway's own environment plus the terminal markers; caller
    // environment is never merged in.
    cmd.envs(term_env);
    cmd.kill_on_drop(true);

    // Pumps joined before the outbound direction closes (pipe EOF at
    // child exit) and pumps joined after the channel closes (pty reads
    // wake only once every peripheral descriptor is gone).
    let mut flush_pumps: Vec<JoinHandle<()>> = Vec::new();
    let mut drain_pumps: Vec<JoinHandle<()>> = Vec::new();

    let wait_result = match pty {
        Some(io) => {
            cmd.stdin(Stdio::from(io.stdin));
            cmd.stdout(Stdio::from(io.stdout));
            cmd.stderr(Stdio::from(io.stderr));
            // SAFETY: setsid and ioctl are async-signal-safe.
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::other)?;
                    // stdin is the peripheral side; make it the
                    // controlling terminal of the new session.
                    if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            match cmd.spawn() {
                Ok(mut child) => {
                    let reader = tokio::fs::File::from_std(io.master_read);
                    let out = handle.clone();
                    drain_pumps.push(tokio::spawn(pump_to_channel(reader, out, channel, None)));
                    let writer = tokio::fs::File::from_std(io.master_write);
                    drain_pumps.push(tokio::spawn(async move {
                        pump_from_channel(&mut input_rx, writer).await;
                    }));
                    child.wait().await
                }
                Err(e) => Err(e),
            }
        }
        None => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            // SAFETY: setsid is async-signal-safe.
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::other)?;
                    Ok(())
                });
            }
            match cmd.spawn() {
                Ok(mut child) => {
                    if let Some(stdin) = child.stdin.take() {
                        drain_pumps.push(tokio::spawn(async move {
                            pump_from_channel(&mut input_rx, stdin).await;
                        }));
                    }
                    if let Some(stdout) = child.stdout.take() {
                        let out = handle.clone();
                        flush_pumps.push(tokio::spawn(pump_to_channel(stdout, out, channel, None)));
                    }
                    if let Some(stderr) = child.stderr.take() {
                        let out = handle.clone();
                        flush_pumps
                            .push(tokio::spawn(pump_to_channel(stderr, out, channel, Some(1))));
                    }
                    child.wait().await
                }
                Err(e) => Err(e),
            }
        }
    };

    // The command retains its stdio descriptors past spawn; release the
    // peripheral-side duplicates so the pump reads can observe closure.
    drop(cmd);

    if let Err(error) = &wait_result {
        warn!(runtime = %target.runtime, %error, "exec child could not be run");
    }

    for pump in flush_pumps {
        let _ = pump.await;
    }

    let finalize_failed = handle.eof(channel).await.is_err();
    let outcome = exit_outcome(&wait_result, finalize_failed);
    let _ = handle.exit_status_request(channel, outcome).await;
    let _ = handle.close(channel).await;

    for pump in drain_pumps {
        let _ = pump.await;
    }
    debug!(?channel, outcome, "exec bridge finished");
}

/// Copy child output onto the channel's data (or extended-data) stream.
async fn pump_to_channel<R>(mut reader: R, handle: Handle, channel: ChannelId, ext: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = CryptoVec::from_slice(&buf[..n]);
                let sent = match ext {
                    Some(code) => handle.extended_data(channel, code, data).await.is_ok(),
                    None => handle.data(channel, data).await.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Copy channel data into the child's input.
async fn pump_from_channel<W>(input_rx: &mut mpsc::Receiver<Vec<u8>>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = input_rx.recv().await {
        if writer.write_all(&data).await.is_err() {
            break;
        }
        let _ = writer.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_resolves_to_login_shell() {
        let inv = ExecInvocation::resolve(None, false).unwrap();
        assert_eq!(inv.argv, vec!["/bin/bash", "-login"]);
        let inv = ExecInvocation::resolve(Some(""), true).unwrap();
        assert_eq!(inv.argv, vec!["/bin/bash", "-login"]);
        assert!(inv.tty);
    }

    #[test]
    fn quoted_words_stay_together() {
        let inv = ExecInvocation::resolve(Some(r#"echo "a b""#), false).unwrap();
        assert_eq!(inv.argv, vec!["echo", "a b"]);
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        assert!(ExecInvocation::resolve(Some(r#"echo "a"#), false).is_err());
    }

    #[test]
    fn exit_outcome_reports_child_codes() {
        let ok = std::process::Command::new("true").status().unwrap();
        let fail = std::process::Command::new("false").status().unwrap();
        assert_eq!(exit_outcome(&Ok(ok), false), 0);
        assert_eq!(exit_outcome(&Ok(fail), false), 1);
    }

    #[test]
    fn exit_outcome_covers_spawn_and_finalize_failures() {
        let err = std::io::Error::other("no such runtime");
        assert_eq!(exit_outcome(&Err(err), false), 1);
        let ok = std::process::Command::new("true").status().unwrap();
        assert_eq!(exit_outcome(&Ok(ok), true), 1);
    }
}

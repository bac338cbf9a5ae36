//! Per-channel request dispatch.
//!
//! Requests arriving on one session channel are decoded into a closed
//! set of [`ChannelRequest`] variants and applied, in arrival order, to
//! that channel's [`ChannelState`]. The state carries the optional pty,
//! the terminal environment overrides, the diagnostic sink and the
//! tracked bridge task for the running invocation.

use std::io::Write;

use {
    russh::{ChannelId, CryptoVec, server::Session},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, warn},
};

use crate::{
    exec::{self, ExecInvocation, ExecTarget, PtyIo},
    pty::{PtyGeometry, PtyPair},
};

/// Buffered input chunks between the channel and the child.
const INPUT_BUFFER: usize = 64;

/// The closed set of session requests this gateway understands.
///
/// Anything outside this set is declined at the transport layer.
#[derive(Debug)]
pub enum ChannelRequest {
    /// `pty-req`: allocate a terminal with the given geometry.
    Pty { term: String, geometry: PtyGeometry },
    /// `window-change`: resize the existing terminal.
    WindowChange { geometry: PtyGeometry },
    /// `shell` / `exec`: start an invocation (`None` = default shell).
    Start { command: Option<String> },
    /// `env`: accepted, deliberately never applied to the child.
    Env { name: String, value: String },
}

/// Mutable state threaded through one channel's request sequence.
pub struct ChannelState {
    id: ChannelId,
    pty: Option<PtyPair>,
    /// Terminal markers added to the child environment (`TERM`, `USE_TTY`).
    term_env: Vec<(String, String)>,
    /// Line ending for diagnostics; `\r\n` once a terminal is allocated.
    eol: &'static str,
    /// Diagnostics go to the terminal once an interactive bridge runs.
    diag_to_pty: bool,
    /// Sender feeding channel data into the running invocation.
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Tracked bridge task for the running invocation.
    bridge: Option<JoinHandle<()>>,
}

impl ChannelState {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            pty: None,
            term_env: Vec::new(),
            eol: "\n",
            diag_to_pty: false,
            input_tx: None,
            bridge: None,
        }
    }

    /// Apply one request; the return value answers its reply flag.
    pub fn handle_request(
        &mut self,
        request: ChannelRequest,
        session: &mut Session,
        target: &ExecTarget,
    ) -> bool {
        match request {
            ChannelRequest::Pty { term, geometry } => match PtyPair::open(geometry) {
                Ok(pair) => {
                    debug!(channel = ?self.id, %term, ?geometry, "pty allocated");
                    self.pty = Some(pair);
                    self.eol = "\r\n";
                    self.term_env = vec![
                        ("TERM".to_string(), term),
                        ("USE_TTY".to_string(), "1".to_string()),
                    ];
                    true
                }
                Err(error) => {
                    warn!(channel = ?self.id, %error, "pty allocation failed");
                    self.diag(session, &format!("pty failed: {error}"));
                    false
                }
            },
            ChannelRequest::WindowChange { geometry } => match &self.pty {
                Some(pair) => match pair.resize(geometry) {
                    Ok(()) => true,
                    Err(error) => {
                        self.diag(session, &format!("window-change: {error}"));
                        false
                    }
                },
                None => {
                    self.diag(session, "window-change: no pty allocated");
                    false
                }
            },
            // Deliberately inert: caller environment never reaches the
            // child. The request still succeeds at the protocol level.
            ChannelRequest::Env { name, value } => {
                debug!(channel = ?self.id, %name, %value, "ignoring env request");
                true
            }
            ChannelRequest::Start { command } => self.start(command, session, target),
        }
    }

    fn start(
        &mut self,
        command: Option<String>,
        session: &mut Session,
        target: &ExecTarget,
    ) -> bool {
        if self.bridge.as_ref().is_some_and(|task| !task.is_finished()) {
            self.diag(session, "an invocation is already running on this channel");
            return false;
        }
        let invocation = match ExecInvocation::resolve(command.as_deref(), self.pty.is_some()) {
            Ok(invocation) => invocation,
            Err(error) => {
                self.diag(session, &format!("error parsing supplied command: {error}"));
                return false;
            }
        };
        let pty_io = match &self.pty {
            Some(pair) => match bridge_endpoints(pair) {
                Ok(io) => Some(io),
                Err(error) => {
                    self.diag(session, &format!("pty setup failed: {error}"));
                    return false;
                }
            },
            None => None,
        };
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        self.input_tx = Some(input_tx);
        if pty_io.is_some() {
            self.diag_to_pty = true;
        }
        debug!(
            channel = ?self.id,
            argv = ?invocation.argv,
            tty = invocation.tty,
            "starting invocation"
        );
        self.bridge = Some(tokio::spawn(exec::run_bridge(
            session.handle(),
            self.id,
            target.clone(),
            invocation,
            self.term_env.clone(),
            pty_io,
            input_rx,
        )));
        true
    }

    /// Forward channel data to the running invocation, with backpressure.
    pub async fn feed_input(&mut self, data: &[u8]) {
        let Some(tx) = self.input_tx.clone() else {
            return;
        };
        if tx.send(data.to_vec()).await.is_err() {
            self.input_tx = None;
        }
    }

    /// Client sent EOF: stop feeding the child so it observes end of input.
    pub fn close_input(&mut self) {
        self.input_tx = None;
    }

    /// Detach the bridge task, if any, from this channel's state.
    pub fn take_bridge(&mut self) -> Option<JoinHandle<()>> {
        self.bridge.take()
    }

    /// Abort the bridge task outright (connection teardown).
    pub fn abort_bridge(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
        }
    }

    /// Write a diagnostic line where the remote caller will see it:
    /// the channel's stderr stream, or the terminal once an interactive
    /// invocation is attached to one.
    fn diag(&self, session: &mut Session, message: &str) {
        let line = format!("{message}{}", self.eol);
        if self.diag_to_pty {
            if let Some(pair) = &self.pty {
                if let Ok(fd) = pair.dup_peripheral() {
                    let mut out = std::fs::File::from(fd);
                    let _ = out.write_all(line.as_bytes());
                    return;
                }
            }
        }
        let _ = session.extended_data(self.id, 1, CryptoVec::from_slice(line.as_bytes()));
    }
}

/// Duplicate the pair's descriptors for one bridge: two controlling-side
/// handles for the pumps, three peripheral handles for the child stdio.
fn bridge_endpoints(pair: &PtyPair) -> std::io::Result<PtyIo> {
    Ok(PtyIo {
        master_read: std::fs::File::from(pair.dup_master()?),
        master_write: std::fs::File::from(pair.dup_master()?),
        stdin: pair.dup_peripheral()?,
        stdout: pair.dup_peripheral()?,
        stderr: pair.dup_peripheral()?,
    })
}

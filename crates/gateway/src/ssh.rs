//! Embedded SSH transport over the upgraded stream.
//!
//! The tunnel itself can only be created by an authenticated caller
//! (the upgrade endpoint checked the shared secret), so the SSH layer
//! is wide open: any password or key is accepted. Only the claimed
//! login principal is pinned; commands always run as the fixed
//! administrative principal inside the workload.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    russh::{
        Channel, ChannelId, Pty,
        keys::{PrivateKey, PublicKey, ssh_key::Algorithm, ssh_key::rand_core::OsRng},
        server::{self, Auth, Handler, Msg, Session},
    },
    tokio::io::{AsyncRead, AsyncWrite},
    tracing::{debug, info, warn},
};

use crate::{
    channel::{ChannelRequest, ChannelState},
    exec::ExecTarget,
    pty::PtyGeometry,
};

/// The only login principal the transport accepts.
pub const ADMIN_PRINCIPAL: &str = "root";

/// Generate the per-process host identity.
///
/// One signing key per process start; every connection presents it.
pub fn generate_host_key() -> Result<PrivateKey, russh::keys::ssh_key::Error> {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
}

/// Transport configuration shared by all connections.
pub fn server_config(key: PrivateKey) -> server::Config {
    server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![key],
        ..Default::default()
    }
}

/// Drive one SSH connection over an upgraded stream to completion.
///
/// Negotiation failure is terminal for the connection: logged, dropped,
/// never retried. Other connections are unaffected.
pub async fn serve_connection<S>(config: Arc<server::Config>, stream: S, target: ExecTarget)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = ConnectionHandler::new(target);
    match server::run_stream(config, stream, handler).await {
        Ok(session) => {
            if let Err(error) = session.await {
                warn!(%error, "ssh session ended with error");
            }
        }
        Err(error) => warn!(%error, "ssh handshake failed"),
    }
}

/// Per-connection handler: owns the state of every open channel.
pub struct ConnectionHandler {
    target: ExecTarget,
    channels: HashMap<ChannelId, ChannelState>,
    /// Bridges whose channel already closed; terminated with the connection.
    orphans: Vec<tokio::task::JoinHandle<()>>,
}

impl ConnectionHandler {
    pub fn new(target: ExecTarget) -> Self {
        Self {
            target,
            channels: HashMap::new(),
            orphans: Vec::new(),
        }
    }

    fn check_principal(&self, user: &str, method: &str) -> Auth {
        if user == ADMIN_PRINCIPAL {
            debug!(user, method, "accepting login");
            Auth::Accept
        } else {
            info!(user, method, "unimplemented: cannot log in as non-root user");
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }

    /// Apply a decoded request to its channel's state and answer the
    /// reply flag.
    fn dispatch(
        &mut self,
        id: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let Self {
            channels, target, ..
        } = self;
        let ok = match channels.get_mut(&id) {
            Some(state) => state.handle_request(request, session, target),
            None => false,
        };
        if ok {
            session.channel_success(id)
        } else {
            session.channel_failure(id)
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.check_principal(user, "none"))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.check_principal(user, "password"))
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check_principal(user, "publickey"))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check_principal(user, "publickey"))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "session channel opened");
        self.channels
            .insert(channel.id(), ChannelState::new(channel.id()));
        Ok(true)
    }

    /// Only the interactive exec path is supported; no TCP forwarding.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            channel = ?channel.id(),
            host_to_connect,
            port_to_connect,
            "declining direct-tcpip channel"
        );
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
            geometry: PtyGeometry {
                cols: col_width,
                rows: row_height,
                pix_width,
                pix_height,
            },
        };
        self.dispatch(channel, request, session)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange {
            geometry: PtyGeometry {
                cols: col_width,
                rows: row_height,
                pix_width,
                pix_height,
            },
        };
        self.dispatch(channel, request, session)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Start { command: None }, session)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.dispatch(
            channel,
            ChannelRequest::Start {
                command: Some(command),
            },
            session,
        )?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.dispatch(channel, request, session)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, name, "declining subsystem request");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.feed_input(data).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.close_input();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, "channel closed");
        if let Some(mut state) = self.channels.remove(&channel) {
            // A still-running bridge keeps going (the child decides the
            // exit status); it is only torn down with the connection.
            if let Some(bridge) = state.take_bridge() {
                if !bridge.is_finished() {
                    self.orphans.push(bridge);
                }
            }
        }
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    /// Connection teardown: every pending invocation is bound to the
    /// lifetime of the originating request, so kill what is left.
    fn drop(&mut self) {
        for state in self.channels.values_mut() {
            state.abort_bridge();
        }
        for bridge in &self.orphans {
            bridge.abort();
        }
    }
}

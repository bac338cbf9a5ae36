//! The HTTP surface: one endpoint that upgrades an authorized request
//! into an SSH tunnel.
//!
//! Requests must be `GET /ssh` with an `Upgrade: ssh` header, a target
//! header naming this gateway's workload and an authorization header
//! carrying the shared secret. Everything else is answered without
//! upgrading. On success the raw stream is taken over, a 101 response
//! is written and the SSH handshake starts on the same bytes.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        body::Body,
        extract::{Request, State},
        http::{HeaderMap, HeaderValue, Method, StatusCode, header},
        response::{IntoResponse, Response},
        routing::any,
    },
    hyper::upgrade::OnUpgrade,
    hyper_util::rt::TokioIo,
    tokio::net::TcpListener,
    tower_http::trace::TraceLayer,
    tracing::{info, warn},
};

use hatchway_config::GatewayConfig;

use crate::{auth, exec::ExecTarget, ssh};

/// Fixed path of the upgrade endpoint.
pub const UPGRADE_PATH: &str = "/ssh";

/// Names the workload a request is meant for.
pub const HEADER_TARGET: &str = "x-hatchway-target";
/// Carries the shared authorization secret.
pub const HEADER_AUTHORIZATION: &str = "x-hatchway-authorization";
/// Optional detach-key sequence for the runtime (e.g. `ctrl-p,ctrl-q`).
pub const HEADER_DETACH_KEYS: &str = "x-hatchway-detach-keys";

struct GatewayShared {
    config: GatewayConfig,
    ssh_config: Arc<russh::server::Config>,
}

/// A bound gateway, ready to serve.
///
/// Binding and serving are split so the orchestrator can learn the
/// final `HOST:PORT` (the configured port may be `0` = auto-assign)
/// before traffic is accepted.
pub struct Gateway {
    listener: TcpListener,
    advertised: String,
    shared: Arc<GatewayShared>,
}

impl Gateway {
    /// Generate the host identity and bind the listener.
    pub async fn bind(config: GatewayConfig) -> anyhow::Result<Self> {
        let key = ssh::generate_host_key()?;
        let ssh_config = Arc::new(ssh::server_config(key));
        // Bind all interfaces; the configured host is how this machine
        // is reached from outside, not necessarily a local address.
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let port = listener.local_addr()?.port();
        let advertised = format!("{}:{}", config.listen_host, port);
        Ok(Self {
            listener,
            advertised,
            shared: Arc::new(GatewayShared { config, ssh_config }),
        })
    }

    /// The externally advertised `HOST:PORT`, with any auto-assigned
    /// port resolved.
    pub fn advertised_address(&self) -> &str {
        &self.advertised
    }

    /// The locally bound socket address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections until the process stops.
    pub async fn serve(self) -> anyhow::Result<()> {
        info!(address = %self.advertised, "gateway listening");
        let app = router(self.shared);
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

fn router(shared: Arc<GatewayShared>) -> Router {
    Router::new()
        .route(UPGRADE_PATH, any(upgrade_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "path not found\n").into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn upgrade_handler(
    State(shared): State<Arc<GatewayShared>>,
    mut req: Request,
) -> Response {
    let wants_ssh = header_str(req.headers(), "upgrade")
        .is_some_and(|proto| proto.eq_ignore_ascii_case("ssh"));
    if req.method() != Method::GET || !wants_ssh {
        return not_found().await;
    }

    let requested = header_str(req.headers(), HEADER_TARGET).unwrap_or_default();
    if requested != shared.config.workload_id {
        warn!(requested, "misdirected upgrade request");
        return (
            StatusCode::BAD_GATEWAY,
            format!(
                "misdirected request: meant for {:?} but received by gateway for {:?}\n",
                requested, shared.config.workload_id
            ),
        )
            .into_response();
    }

    if !auth::authorize(
        &shared.config.auth_secret,
        header_str(req.headers(), HEADER_AUTHORIZATION),
    ) {
        warn!("upgrade request with bad authorization header");
        return (StatusCode::UNAUTHORIZED, "bad authorization header\n").into_response();
    }

    let detach_keys = header_str(req.headers(), HEADER_DETACH_KEYS)
        .unwrap_or_default()
        .to_string();

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "connection does not support upgrade\n",
        )
            .into_response();
    };

    let target = ExecTarget {
        runtime: shared.config.runtime.clone(),
        container_id: shared.config.container_id.clone(),
        detach_keys,
    };
    let ssh_config = Arc::clone(&shared.ssh_config);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                info!("connection upgraded, starting ssh handshake");
                ssh::serve_connection(ssh_config, TokioIo::new(upgraded), target).await;
            }
            Err(error) => warn!(%error, "connection upgrade failed"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    response
        .headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static("ssh"));
    response
}

//! Server end of the tunnel: admission, both carrier variants, dialing.
//!
//! One axum route serves everything (the request path does not matter):
//!
//! - `Upgrade: http2tcp/1.0` requests authenticate, dial the destination
//!   from `?addr=` (or a POST form body), answer `101 Switching Protocols`
//!   and relay frames over the hijacked byte stream. No registry entry, no
//!   resume: when the carrier dies the session dies.
//! - `Upgrade: websocket` requests become resumable carriers. The first
//!   frame is a session-begin: id 0 creates a session (dial, allocate id,
//!   register, run the worker loops), a nonzero id rebinds the carrier to
//!   the session waiting for it.
//!
//! Admission failures never reach an existing session; a failing session
//! never takes the accept loop down.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, request::Parts, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use crate::auth;
use crate::carrier::stream::StreamCarrier;
use crate::carrier::ws::WsServerCarrier;
use crate::carrier::Carrier;
use crate::config::ServerConfig;
use crate::crypto::{self, Keypair};
use crate::frame::{BeginResponse, Frame};
use crate::registry::Registry;
use crate::session::Session;

/// Upper bound on a destination-carrying request body (sealed or form).
const MAX_BODY_LEN: usize = 4096;

/// Shared state behind the admission handler.
#[derive(Debug)]
pub struct ServerState {
    config: ServerConfig,
    keypair: Option<Keypair>,
    registry: Registry,
}

/// The tunnel server.
#[derive(Debug, Clone)]
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    /// Build a server from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured private key does not parse.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let keypair = match config.key.as_deref() {
            Some(key) => Some(Keypair::from_private_str(key).context("invalid server key")?),
            None => None,
        };
        Ok(Self {
            state: Arc::new(ServerState {
                config,
                keypair,
                registry: Registry::new(),
            }),
        })
    }

    /// The session registry, exposed for logging and tests.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// The admission router. Every path lands in the same handler.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(tunnel))
            .route("/{*path}", any(tunnel))
            .with_state(Arc::clone(&self.state))
    }

    /// Serve admissions on an already-bound listener until the process
    /// ends.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener breaks.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!(
            "server listening on {} ({})",
            listener.local_addr().context("listener address")?,
            serde_json::to_string(&self.state.config).unwrap_or_default()
        );
        axum::serve(listener, self.router())
            .await
            .context("server error")
    }
}

async fn tunnel(State(state): State<Arc<ServerState>>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();

    // Token auth comes first. In keyed mode the hijack variant replaces the
    // token with a sealed body, so the header check moves to the WebSocket
    // branch there.
    if state.keypair.is_none() && !authorized(&state, &parts) {
        return status_text(StatusCode::UNAUTHORIZED);
    }

    let upgrade = parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if upgrade == auth::UPGRADE_PROTOCOL {
        return serve_hijack(state, parts, body).await;
    }

    if upgrade == "websocket" {
        if state.keypair.is_some() && !authorized(&state, &parts) {
            return status_text(StatusCode::UNAUTHORIZED);
        }
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws.on_upgrade(move |socket| admit_ws(state, socket)),
            Err(rejection) => rejection.into_response(),
        };
    }

    (StatusCode::BAD_REQUEST, "upgrade error").into_response()
}

fn authorized(state: &ServerState, parts: &Parts) -> bool {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    auth::authorize(value, &state.config.token)
}

fn status_text(status: StatusCode) -> Response {
    (status, status.canonical_reason().unwrap_or_default()).into_response()
}

/// The stateless variant: authenticate, resolve the destination, dial it,
/// hijack the connection, relay until either side closes.
async fn serve_hijack(state: Arc<ServerState>, mut parts: Parts, body: Body) -> Response {
    let addr = if let Some(keypair) = &state.keypair {
        // Keyed mode: decrypting the body is the authentication.
        match sealed_destination(keypair, body).await {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("rejecting hijack: {e:#}");
                return (StatusCode::BAD_REQUEST, "bad destination").into_response();
            }
        }
    } else {
        match plain_destination(&parts, body).await {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("rejecting hijack: {e:#}");
                return (StatusCode::BAD_REQUEST, "missing destination").into_response();
            }
        }
    };

    let remote = match TcpStream::connect(&addr).await {
        Ok(remote) => remote,
        Err(e) => {
            log::warn!("failed to dial {addr}: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
        log::error!("connection to {addr} is not upgradable");
        return status_text(StatusCode::INTERNAL_SERVER_ERROR);
    };

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                log::error!("upgrade failed: {e}");
                return;
            }
        };

        let live = state.registry.connection_opened();
        log::info!("hijack tunnel towards {addr} established ({live} live)");

        let carrier = Arc::new(StreamCarrier::new(
            TokioIo::new(upgraded),
            Some(state.config.write_timeout),
        ));
        let session = Session::stateless(0, true, carrier);
        let (remote_reader, remote_writer) = remote.into_split();
        session
            .run(Box::new(remote_reader), Box::new(remote_writer))
            .await;

        let live = state.registry.connection_closed();
        log::info!("hijack tunnel towards {addr} ended ({live} live)");
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, auth::UPGRADE_PROTOCOL)
        .header(header::CONTENT_LENGTH, "0")
        .body(Body::empty())
        .expect("static response parts are valid")
}

/// Destination from `?addr=` or, failing that, a POST form body.
async fn plain_destination(parts: &Parts, body: Body) -> Result<String> {
    if let Some(query) = parts.uri.query() {
        let params: Vec<(String, String)> =
            serde_urlencoded::from_str(query).context("malformed query string")?;
        if let Some((_, addr)) = params.iter().find(|(name, _)| name == "addr") {
            if !addr.is_empty() {
                return Ok(addr.clone());
            }
        }
    }

    let is_form = parts.method == Method::POST
        && parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        let bytes = axum::body::to_bytes(body, MAX_BODY_LEN)
            .await
            .context("failed to read form body")?;
        let params: Vec<(String, String)> =
            serde_urlencoded::from_bytes(&bytes).context("malformed form body")?;
        if let Some((_, addr)) = params.into_iter().find(|(name, _)| name == "addr") {
            if !addr.is_empty() {
                return Ok(addr);
            }
        }
    }

    anyhow::bail!("no destination address in query or form")
}

/// Destination sealed against our public key (keyed mode).
async fn sealed_destination(keypair: &Keypair, body: Body) -> Result<String> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_LEN)
        .await
        .context("failed to read sealed body")?;
    crypto::open_destination(keypair, &bytes)
}

/// The resumable variant: session-begin exchange, then either run a new
/// session or rebind the carrier to a waiting one.
async fn admit_ws(state: Arc<ServerState>, socket: WebSocket) {
    let carrier: Arc<dyn Carrier> = Arc::new(WsServerCarrier::new(
        socket,
        Some(state.config.write_timeout),
    ));

    let begin = match carrier.read().await {
        Ok(Frame::Begin(begin)) => begin,
        Ok(other) => {
            log::warn!(
                "carrier {}: expected begin, got {} frame",
                carrier.id(),
                other.kind()
            );
            carrier.close().await;
            return;
        }
        Err(e) => {
            log::warn!("carrier {}: failed to read begin: {e}", carrier.id());
            carrier.close().await;
            return;
        }
    };

    if begin.session_id > 0 {
        resume_session(state, carrier, begin.session_id).await;
        return;
    }

    // New session: dial first so a refusal carries the dial error.
    let remote = match TcpStream::connect(&begin.connect).await {
        Ok(remote) => remote,
        Err(e) => {
            log::warn!(
                "carrier {}: failed to dial {}: {e}",
                carrier.id(),
                begin.connect
            );
            refuse(carrier.as_ref(), &format!("failed to dial {}: {e}", begin.connect)).await;
            return;
        }
    };

    let id = state.registry.allocate_id().await;
    let session = Session::server(id, Arc::clone(&carrier), state.config.resume_timeout);
    state.registry.insert(Arc::clone(&session)).await;

    let ack = Frame::BeginAck(BeginResponse {
        session_id: id,
        reason: String::new(),
    });
    if let Err(e) = carrier.write(&ack).await {
        log::warn!("session {id}: failed to acknowledge begin: {e}");
        state.registry.remove(id).await;
        carrier.close().await;
        return;
    }

    let live = state.registry.connection_opened();
    log::info!(
        "session {id}: admitted towards {} over carrier {} ({live} live)",
        begin.connect,
        carrier.id()
    );

    let (remote_reader, remote_writer) = remote.into_split();
    session
        .run(Box::new(remote_reader), Box::new(remote_writer))
        .await;

    state.registry.remove(id).await;
    let live = state.registry.connection_closed();
    log::info!("session {id}: removed ({live} live)");
}

/// Hand a resuming carrier to the session that owns the id.
async fn resume_session(state: Arc<ServerState>, carrier: Arc<dyn Carrier>, id: i64) {
    let Some(session) = state.registry.get(id).await else {
        log::warn!("carrier {}: resume for unknown session {id}", carrier.id());
        refuse(carrier.as_ref(), "session not found").await;
        return;
    };

    let ack = Frame::BeginAck(BeginResponse {
        session_id: id,
        reason: String::new(),
    });
    if let Err(e) = carrier.write(&ack).await {
        log::warn!("session {id}: failed to acknowledge resume: {e}");
        carrier.close().await;
        return;
    }

    log::info!("session {id}: rebinding carrier {}", carrier.id());
    if session.bind_carrier(Arc::clone(&carrier)).await.is_err() {
        // The session ended between lookup and rebind.
        log::warn!("session {id}: ended before the carrier could rebind");
        carrier.close().await;
    }
}

async fn refuse(carrier: &dyn Carrier, reason: &str) {
    let ack = Frame::BeginAck(BeginResponse {
        session_id: 0,
        reason: reason.to_string(),
    });
    if let Err(e) = carrier.write(&ack).await {
        log::warn!("carrier {}: failed to send refusal: {e}", carrier.id());
    }
    carrier.close().await;
}

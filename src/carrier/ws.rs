//! WebSocket carriers for the resumable tunnel variant.
//!
//! The client side wraps `tokio-tungstenite`, the server side wraps the
//! `axum` WebSocket handed over by the admission handler. Both carry one
//! encoded [`Frame`] per binary message; pings are answered inline and
//! anything textual is a protocol violation.
//!
//! [`dial`] performs the whole client-side carrier establishment: WebSocket
//! handshake with the `Authorization` header, then the session-begin
//! exchange. It is used both for a session's first carrier and for every
//! reset after a carrier failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::ws::{self, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::carrier::{next_carrier_id, Carrier, CarrierError};
use crate::frame::{self, BeginRequest, Frame, SessionId};

/// Concrete client-side WebSocket stream type.
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket close code for a planned close.
const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code for a fault.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Why a [`dial`] failed.
#[derive(Debug)]
pub enum DialError {
    /// The server answered the session-begin with id 0: it actively refused
    /// the session (unknown resume id, unreachable destination, shutdown).
    Refused(String),
    /// Transport-level failure; worth retrying.
    Transport(anyhow::Error),
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refused(reason) => write!(f, "server refused session: {reason}"),
            Self::Transport(e) => write!(f, "carrier dial failed: {e:#}"),
        }
    }
}

impl std::error::Error for DialError {}

/// Client-side WebSocket carrier.
pub struct WsClientCarrier {
    id: u64,
    reader: Mutex<SplitStream<WsStream>>,
    writer: Mutex<SplitSink<WsStream, tungstenite::Message>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for WsClientCarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClientCarrier")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WsClientCarrier {
    fn new(stream: WsStream) -> Self {
        let (writer, reader) = stream.split();
        Self {
            id: next_carrier_id(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Carrier for WsClientCarrier {
    async fn read(&self) -> Result<Frame, CarrierError> {
        let mut reader = self.reader.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Err(CarrierError::Closed),
                next = reader.next() => next,
            };
            match next {
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return frame::decode(&data).map_err(|e| CarrierError::Decode(e.to_string()));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    let mut writer = self.writer.lock().await;
                    let _ = writer.send(tungstenite::Message::Pong(data)).await;
                }
                Some(Ok(tungstenite::Message::Pong(_))) => continue,
                Some(Ok(tungstenite::Message::Text(_))) => {
                    return Err(CarrierError::Protocol(
                        "expected a binary message".to_string(),
                    ));
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    return Err(CarrierError::Closed);
                }
                Some(Ok(tungstenite::Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(CarrierError::Io(e.to_string())),
            }
        }
    }

    async fn write(&self, frame: &Frame) -> Result<(), CarrierError> {
        let bytes = frame::encode(frame).map_err(|e| CarrierError::Io(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let send = writer.send(tungstenite::Message::Binary(bytes));
        tokio::select! {
            _ = self.closed.cancelled() => Err(CarrierError::Closed),
            result = send => result.map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    CarrierError::Closed
                }
                other => CarrierError::Io(other.to_string()),
            }),
        }
    }

    async fn close(&self) {
        // Cancel first so a loop parked in read/write releases its half.
        self.closed.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.send(tungstenite::Message::Close(None)).await;
            let _ = writer.close().await;
        }
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Establish a client carrier and run the session-begin exchange.
///
/// `session_id == 0` asks the server to create a session towards `connect`;
/// a nonzero id resumes that session (`connect` is ignored by the server).
/// On success, returns the carrier and the server-confirmed session id.
///
/// # Errors
///
/// [`DialError::Refused`] when the server answers with session id 0,
/// [`DialError::Transport`] for every handshake or I/O failure.
pub async fn dial(
    endpoint: &str,
    token: &str,
    user_agent: Option<&str>,
    session_id: SessionId,
    connect: &str,
) -> Result<(WsClientCarrier, SessionId), DialError> {
    use tungstenite::client::IntoClientRequest;

    let mut request = endpoint
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {endpoint}"))
        .map_err(DialError::Transport)?;

    let authorization = auth::format_authorization(token)
        .parse()
        .context("token is not a valid header value")
        .map_err(DialError::Transport)?;
    request.headers_mut().insert("Authorization", authorization);
    if let Some(agent) = user_agent {
        let value = agent
            .parse()
            .context("user agent is not a valid header value")
            .map_err(DialError::Transport)?;
        request.headers_mut().insert("User-Agent", value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")
        .map_err(DialError::Transport)?;
    let carrier = WsClientCarrier::new(stream);

    carrier
        .write(&Frame::Begin(BeginRequest {
            session_id,
            connect: connect.to_string(),
        }))
        .await
        .map_err(|e| DialError::Transport(anyhow::anyhow!("begin request: {e}")))?;

    let ack = match carrier.read().await {
        Ok(Frame::BeginAck(ack)) => ack,
        Ok(other) => {
            carrier.close().await;
            return Err(DialError::Transport(anyhow::anyhow!(
                "expected begin-ack, got {} frame",
                other.kind()
            )));
        }
        Err(e) => {
            carrier.close().await;
            return Err(DialError::Transport(anyhow::anyhow!("begin response: {e}")));
        }
    };

    if ack.session_id == 0 {
        carrier.close().await;
        return Err(DialError::Refused(ack.reason));
    }

    Ok((carrier, ack.session_id))
}

/// Server-side WebSocket carrier over an admitted axum socket.
///
/// Tracks whether it failed so that close can pick the WebSocket status:
/// 1000 for a planned close, 1011 after a fault.
pub struct WsServerCarrier {
    id: u64,
    reader: Mutex<SplitStream<WebSocket>>,
    writer: Mutex<SplitSink<WebSocket, ws::Message>>,
    write_timeout: Option<Duration>,
    faulted: AtomicBool,
    closed: CancellationToken,
}

impl std::fmt::Debug for WsServerCarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServerCarrier")
            .field("id", &self.id)
            .field("faulted", &self.faulted.load(Ordering::Relaxed))
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WsServerCarrier {
    /// Wrap an admitted WebSocket. `write_timeout` bounds each write so a
    /// stalled peer cannot block a session loop forever.
    pub fn new(socket: WebSocket, write_timeout: Option<Duration>) -> Self {
        let (writer, reader) = socket.split();
        Self {
            id: next_carrier_id(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            write_timeout,
            faulted: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    fn fault<T>(&self, err: CarrierError) -> Result<T, CarrierError> {
        self.faulted.store(true, Ordering::Relaxed);
        Err(err)
    }
}

#[async_trait]
impl Carrier for WsServerCarrier {
    async fn read(&self) -> Result<Frame, CarrierError> {
        let mut reader = self.reader.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Err(CarrierError::Closed),
                next = reader.next() => next,
            };
            match next {
                Some(Ok(ws::Message::Binary(data))) => {
                    return match frame::decode(&data) {
                        Ok(frame) => Ok(frame),
                        Err(e) => self.fault(CarrierError::Decode(e.to_string())),
                    };
                }
                Some(Ok(ws::Message::Ping(data))) => {
                    let mut writer = self.writer.lock().await;
                    let _ = writer.send(ws::Message::Pong(data)).await;
                }
                Some(Ok(ws::Message::Pong(_))) => continue,
                Some(Ok(ws::Message::Text(_))) => {
                    return self.fault(CarrierError::Protocol(
                        "expected a binary message".to_string(),
                    ));
                }
                Some(Ok(ws::Message::Close(_))) | None => return Err(CarrierError::Closed),
                Some(Err(e)) => return self.fault(CarrierError::Io(e.to_string())),
            }
        }
    }

    async fn write(&self, frame: &Frame) -> Result<(), CarrierError> {
        let bytes = frame::encode(frame).map_err(|e| CarrierError::Io(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let send = writer.send(ws::Message::Binary(bytes.into()));
        let send = async {
            match self.write_timeout {
                Some(limit) => match tokio::time::timeout(limit, send).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(CarrierError::Io(e.to_string())),
                    Err(_) => Err(CarrierError::Timeout),
                },
                None => send.await.map_err(|e| CarrierError::Io(e.to_string())),
            }
        };
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(CarrierError::Closed),
            result = send => result,
        };
        match result {
            Ok(()) => Ok(()),
            Err(CarrierError::Closed) => Err(CarrierError::Closed),
            Err(e) => self.fault(e),
        }
    }

    async fn close(&self) {
        let code = if self.faulted.load(Ordering::Relaxed) {
            CLOSE_INTERNAL_ERROR
        } else {
            CLOSE_NORMAL
        };
        // Cancel first so a loop parked in read/write releases its half.
        self.closed.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer
                .send(ws::Message::Close(Some(ws::CloseFrame {
                    code,
                    reason: ws::Utf8Bytes::from_static("close()"),
                })))
                .await;
            let _ = writer.close().await;
        }
    }

    fn id(&self) -> u64 {
        self.id
    }
}

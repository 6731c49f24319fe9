//! Per-connection session state and worker loops.
//!
//! A session owns one local byte stream (the accepted TCP connection or
//! stdio on the client, the dialed destination on the server) and relays it
//! through whatever carrier is currently bound. Two worker loops run per
//! session:
//!
//! - `loop_reads` - carrier to local: validates sequence numbers, writes
//!   payloads to the local peer, prunes the retransmit queue with the
//!   peer's piggybacked acknowledgement.
//! - `loop_writes` - local to carrier: chunks local bytes into RelayData
//!   frames, enqueues them for retransmission, and writes them out.
//!
//! When the bound carrier fails, resumable sessions replace it without the
//! local peers noticing: the client re-dials and resumes by session id, the
//! server parks on a rendezvous until the client's fresh carrier arrives.
//! Stateless sessions treat any carrier failure as the end.
//!
//! Either loop exiting cancels the other; the session then closes the
//! carrier and returns from [`Session::run`], at which point the caller
//! removes it from the registry.

pub mod queue;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::carrier::ws::{self, DialError};
use crate::carrier::{Carrier, CarrierError};
use crate::constants::{QUEUE_WARN_DEPTH, READ_BUF_SIZE, RESET_RETRY_DELAY, STALE_FRAME_AGE};
use crate::frame::{self, Frame, RelayData, SessionId};
use queue::RetransmitQueue;

/// Local byte-stream halves a session relays for.
pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
/// See [`LocalReader`].
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which end of the tunnel this session lives on. The client end knows how
/// to re-dial the server; the server end waits to be re-dialed.
enum Role {
    Client {
        endpoint: String,
        token: String,
        user_agent: Option<String>,
    },
    Server,
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Client { .. } => "client",
            Role::Server => "server",
        }
    }
}

/// Terminal vs retryable outcome of a carrier reset.
#[derive(Debug)]
enum ResetError {
    /// The peer (or a timeout) actively closed the session; the loops must
    /// exit.
    ActivelyClosed(String),
    /// Transient failure; reset again after a delay.
    Retry(anyhow::Error),
}

impl std::fmt::Display for ResetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActivelyClosed(reason) => write!(f, "actively closed: {reason}"),
            Self::Retry(e) => write!(f, "carrier reset failed: {e:#}"),
        }
    }
}

/// One logical TCP tunnel, spanning zero or more successive carriers.
pub struct Session {
    id: SessionId,
    role: Role,
    /// Stateless sessions keep the sequence counters for log correlation
    /// but have no retransmit queue and no carrier replacement.
    resumable: bool,
    /// Next sequence to assign to an outbound frame.
    tx_seq: AtomicI64,
    /// Next sequence expected on an inbound frame.
    rx_seq: AtomicI64,
    /// The currently bound carrier. Loops clone it under the read lock;
    /// reset swaps it under the write lock.
    carrier: RwLock<Arc<dyn Carrier>>,
    queue: Mutex<RetransmitQueue>,
    resume_tx: mpsc::Sender<Arc<dyn Carrier>>,
    resume_rx: Mutex<mpsc::Receiver<Arc<dyn Carrier>>>,
    resume_timeout: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role.name())
            .field("resumable", &self.resumable)
            .field("tx_seq", &self.tx_seq.load(Ordering::SeqCst))
            .field("rx_seq", &self.rx_seq.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        id: SessionId,
        role: Role,
        resumable: bool,
        carrier: Arc<dyn Carrier>,
        resume_timeout: Duration,
    ) -> Arc<Self> {
        let (resume_tx, resume_rx) = mpsc::channel(1);
        Arc::new(Self {
            id,
            role,
            resumable,
            tx_seq: AtomicI64::new(1),
            rx_seq: AtomicI64::new(1),
            carrier: RwLock::new(carrier),
            queue: Mutex::new(RetransmitQueue::new()),
            resume_tx,
            resume_rx: Mutex::new(resume_rx),
            resume_timeout,
            cancel: CancellationToken::new(),
        })
    }

    /// Establish a resumable client session: dial the first carrier, ask
    /// the server to create a session towards `connect`, and return the
    /// admitted session.
    ///
    /// # Errors
    ///
    /// Returns an error when the dial fails or the server refuses the
    /// session (unreachable destination, bad endpoint).
    pub async fn connect(
        endpoint: &str,
        token: &str,
        user_agent: Option<&str>,
        connect: &str,
    ) -> Result<Arc<Self>> {
        let (carrier, id) = ws::dial(endpoint, token, user_agent, 0, connect)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create first session carrier: {e}"))?;
        log::info!("session {id}: created towards {connect} over carrier {}", carrier.id());
        Ok(Self::new(
            id,
            Role::Client {
                endpoint: endpoint.to_string(),
                token: token.to_string(),
                user_agent: user_agent.map(str::to_string),
            },
            true,
            Arc::new(carrier),
            Duration::ZERO,
        ))
    }

    /// Create the server half of a resumable session around an admitted
    /// carrier.
    pub fn server(
        id: SessionId,
        carrier: Arc<dyn Carrier>,
        resume_timeout: Duration,
    ) -> Arc<Self> {
        Self::new(id, Role::Server, true, carrier, resume_timeout)
    }

    /// Create a stateless session (either end of the Upgrade variant).
    /// Carrier failure ends it; `id` is only used in logs.
    pub fn stateless(id: SessionId, server_side: bool, carrier: Arc<dyn Carrier>) -> Arc<Self> {
        let role = if server_side {
            Role::Server
        } else {
            Role::Client {
                endpoint: String::new(),
                token: String::new(),
                user_agent: None,
            }
        };
        Self::new(id, role, false, carrier, Duration::ZERO)
    }

    /// Session id, fixed at admission.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Hand a freshly admitted carrier to this session's waiting reset
    /// (server side of a resume). Blocks until the session picks it up.
    ///
    /// # Errors
    ///
    /// Returns an error when the session has already ended.
    pub async fn bind_carrier(&self, carrier: Arc<dyn Carrier>) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("session {} is gone", self.id);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => anyhow::bail!("session {} is gone", self.id),
            sent = self.resume_tx.send(carrier) => {
                sent.map_err(|_| anyhow::anyhow!("session {} is gone", self.id))
            }
        }
    }

    /// Run both worker loops to completion, then close the carrier. The
    /// local halves are dropped (and with them the local TCP closed) as
    /// the loops exit.
    pub async fn run(self: &Arc<Self>, local_reader: LocalReader, local_writer: LocalWriter) {
        let reads = {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.loop_reads(local_writer).await;
                log::debug!("session {}: loop_reads exited", session.id);
            })
        };
        let writes = {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.loop_writes(local_reader).await;
                log::debug!("session {}: loop_writes exited", session.id);
            })
        };

        let _ = reads.await;
        let _ = writes.await;

        self.current_carrier().await.close().await;
        log::info!("session {} ended ({})", self.id, self.role.name());
    }

    async fn current_carrier(&self) -> Arc<dyn Carrier> {
        self.carrier.read().await.clone()
    }

    /// Carrier to local peer.
    async fn loop_reads(&self, mut local: LocalWriter) {
        // Set when a received frame looks stale; the next iteration then
        // replaces the carrier even though it still nominally works.
        let mut reset_pending = false;

        loop {
            let mut carrier = self.current_carrier().await;

            if reset_pending {
                match self.replace_carrier(carrier).await {
                    Ok(fresh) => carrier = fresh,
                    Err(()) => break,
                }
                reset_pending = false;
            }

            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = carrier.read() => match read {
                    Ok(frame) => frame,
                    Err(e) if e.is_violation() => {
                        log::error!("session {}: {e}, exiting", self.id);
                        carrier.close().await;
                        break;
                    }
                    Err(e) => {
                        log::warn!(
                            "session {}: carrier {} read failed, resetting: {e}",
                            self.id,
                            carrier.id()
                        );
                        // Reset with the handle that failed, not whatever
                        // is current by now - the sibling loop may already
                        // have bound a fresh carrier.
                        match self.replace_carrier(carrier).await {
                            Ok(_) => continue,
                            Err(()) => break,
                        }
                    }
                },
            };

            let data = match frame {
                Frame::Relay(data) => data,
                other => {
                    log::error!(
                        "session {}: unexpected {} frame mid-session, exiting",
                        self.id,
                        other.kind()
                    );
                    carrier.close().await;
                    break;
                }
            };

            let expected = self.rx_seq.load(Ordering::SeqCst);
            if data.tx_seq < expected {
                // Normal during a resume: the peer replays its whole queue.
                log::debug!(
                    "session {}: redundant seq {} (expecting {}), dropping",
                    self.id,
                    data.tx_seq,
                    expected
                );
                continue;
            }
            if data.tx_seq > expected {
                log::error!(
                    "session {}: future seq {} (expecting {}), exiting",
                    self.id,
                    data.tx_seq,
                    expected
                );
                carrier.close().await;
                break;
            }

            if let Err(e) = local.write_all(&data.data).await {
                log::warn!("session {}: failed to write local peer, exiting: {e}", self.id);
                break;
            }
            log::debug!("session {}: recv seq {} ({} bytes)", self.id, expected, data.data.len());
            self.rx_seq.store(expected + 1, Ordering::SeqCst);

            if self.resumable {
                let pruned = self.queue.lock().await.prune(data.rx_seq);
                if pruned > 0 {
                    log::debug!(
                        "session {}: peer acknowledged {pruned} frames (rx_seq {})",
                        self.id,
                        data.rx_seq
                    );
                }

                if data.age_ms(frame::now_ms()) > STALE_FRAME_AGE.as_millis() as i64 {
                    log::warn!(
                        "session {}: frame seq {} is stale, requesting carrier reset",
                        self.id,
                        data.tx_seq
                    );
                    reset_pending = true;
                }
            }
        }

        self.cancel.cancel();
    }

    /// Local peer to carrier.
    async fn loop_writes(&self, mut local: LocalReader) {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        'session: loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = local.read(&mut buf) => match read {
                    Ok(0) => {
                        log::debug!("session {}: local peer EOF", self.id);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!(
                            "session {}: failed to read local peer, exiting: {e}",
                            self.id
                        );
                        break;
                    }
                },
            };

            let tx_seq = self.tx_seq.load(Ordering::SeqCst);
            let data = RelayData {
                tx_seq,
                rx_seq: self.rx_seq.load(Ordering::SeqCst),
                data: buf[..n].to_vec(),
                time_ms: frame::now_ms(),
            };
            self.tx_seq.store(tx_seq + 1, Ordering::SeqCst);

            if self.resumable {
                let mut queue = self.queue.lock().await;
                queue.push(data.clone());
                if queue.len() > QUEUE_WARN_DEPTH {
                    log::warn!(
                        "session {}: retransmit queue at {} frames, peer is not acknowledging",
                        self.id,
                        queue.len()
                    );
                }
            }

            // Deliver the frame, surviving carrier failures. After every
            // successful reset the whole queue is replayed; the peer drops
            // what it has already seen, so a reset mid-replay is safe.
            let mut replaying = false;
            loop {
                let carrier = self.current_carrier().await;
                let deliver = async {
                    if replaying {
                        self.replay_pending(carrier.as_ref()).await
                    } else {
                        carrier.write(&Frame::Relay(data.clone())).await
                    }
                };
                let result = tokio::select! {
                    _ = self.cancel.cancelled() => break 'session,
                    result = deliver => result,
                };

                match result {
                    Ok(()) => {
                        log::debug!("session {}: sent seq {tx_seq} ({n} bytes)", self.id);
                        break;
                    }
                    Err(e) => {
                        log::warn!(
                            "session {}: carrier {} write failed, resetting: {e}",
                            self.id,
                            carrier.id()
                        );
                        match self.replace_carrier(carrier).await {
                            Ok(_) => replaying = true,
                            Err(()) => break 'session,
                        }
                    }
                }
            }
        }

        self.cancel.cancel();
    }

    async fn replay_pending(&self, carrier: &dyn Carrier) -> Result<(), CarrierError> {
        let frames = self.queue.lock().await.snapshot();
        log::info!(
            "session {}: replaying {} queued frames over carrier {}",
            self.id,
            frames.len(),
            carrier.id()
        );
        for data in frames {
            carrier.write(&Frame::Relay(data)).await?;
        }
        Ok(())
    }

    /// Replace a failed carrier, retrying transient failures until a fresh
    /// carrier is bound or the reset is terminal. `Err(())` means the
    /// session must end.
    async fn replace_carrier(&self, failed: Arc<dyn Carrier>) -> Result<Arc<dyn Carrier>, ()> {
        loop {
            match self.reset_carrier(failed.as_ref()).await {
                Ok(()) => return Ok(self.current_carrier().await),
                Err(ResetError::ActivelyClosed(reason)) => {
                    log::info!("session {}: actively closed: {reason}", self.id);
                    return Err(());
                }
                Err(ResetError::Retry(e)) => {
                    log::warn!(
                        "session {}: failed to reset carrier, trying again: {e:#}",
                        self.id
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(()),
                        () = tokio::time::sleep(RESET_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    /// One reset attempt under the exclusive carrier slot lock.
    async fn reset_carrier(&self, failed: &dyn Carrier) -> Result<(), ResetError> {
        if !self.resumable {
            return Err(ResetError::ActivelyClosed("carrier closed".to_string()));
        }

        let mut slot = self.carrier.write().await;

        // Closing twice is harmless; the failed handle must not linger.
        failed.close().await;

        if slot.id() != failed.id() {
            log::debug!(
                "session {}: carrier already reset to {}, using it",
                self.id,
                slot.id()
            );
            return Ok(());
        }

        match self.role {
            Role::Client {
                ref endpoint,
                ref token,
                ref user_agent,
            } => {
                let (carrier, sid) =
                    ws::dial(endpoint, token, user_agent.as_deref(), self.id, "")
                        .await
                        .map_err(|e| match e {
                            DialError::Refused(reason) => ResetError::ActivelyClosed(reason),
                            DialError::Transport(err) => ResetError::Retry(err),
                        })?;
                if sid != self.id {
                    // The server confirmed a different session than we
                    // asked to resume.
                    carrier.close().await;
                    return Err(ResetError::ActivelyClosed(format!(
                        "resume confirmed wrong session id {sid}, expected {}",
                        self.id
                    )));
                }
                log::info!("session {}: carrier reset, now {}", self.id, carrier.id());
                *slot = Arc::new(carrier);
                Ok(())
            }
            Role::Server => {
                let mut rx = self.resume_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        Err(ResetError::ActivelyClosed("session closed".to_string()))
                    }
                    received = tokio::time::timeout(self.resume_timeout, rx.recv()) => {
                        match received {
                            Ok(Some(fresh)) => {
                                log::info!(
                                    "session {}: client rebound carrier {}",
                                    self.id,
                                    fresh.id()
                                );
                                *slot = fresh;
                                Ok(())
                            }
                            Ok(None) => {
                                Err(ResetError::ActivelyClosed("rendezvous gone".to_string()))
                            }
                            Err(_) => Err(ResetError::ActivelyClosed(
                                "timed out waiting for the client to resume".to_string(),
                            )),
                        }
                    }
                }
            }
        }
    }
}

//! Length-prefixed frame carrier over a raw byte stream.
//!
//! The stateless tunnel variant hijacks the TCP connection under an HTTP
//! `Upgrade: http2tcp/1.0` exchange and then speaks frames directly over
//! the socket. Frame boundaries come from a length prefix
//! ([`LengthDelimitedCodec`]), which keeps the codec self-delimiting as a
//! byte-stream carrier requires.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::carrier::{next_carrier_id, Carrier, CarrierError};
use crate::constants::MAX_FRAME_SIZE;
use crate::frame::{self, Frame};

/// A [`Carrier`] over any `AsyncRead + AsyncWrite` transport.
///
/// `close` cancels in-flight reads and writes, so a session loop parked on
/// a half-open socket observes the close instead of blocking forever.
pub struct StreamCarrier<S> {
    id: u64,
    reader: Mutex<FramedRead<ReadHalf<S>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>,
    write_timeout: Option<Duration>,
    closed: CancellationToken,
}

impl<S> std::fmt::Debug for StreamCarrier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCarrier")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

impl<S> StreamCarrier<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a byte stream. `write_timeout` bounds each `write` call; the
    /// server passes one, the client does not.
    pub fn new(io: S, write_timeout: Option<Duration>) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            id: next_carrier_id(),
            reader: Mutex::new(FramedRead::new(read_half, codec())),
            writer: Mutex::new(FramedWrite::new(write_half, codec())),
            write_timeout,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<S> Carrier for StreamCarrier<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self) -> Result<Frame, CarrierError> {
        let mut reader = self.reader.lock().await;
        let next = tokio::select! {
            _ = self.closed.cancelled() => return Err(CarrierError::Closed),
            next = reader.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                frame::decode(&bytes).map_err(|e| CarrierError::Decode(e.to_string()))
            }
            Some(Err(e)) => Err(CarrierError::Io(e.to_string())),
            None => Err(CarrierError::Closed),
        }
    }

    async fn write(&self, frame: &Frame) -> Result<(), CarrierError> {
        let bytes = frame::encode(frame).map_err(|e| CarrierError::Io(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let send = writer.send(Bytes::from(bytes));
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
        tokio::select! {
            _ = self.closed.cancelled() => Err(CarrierError::Closed),
            result = send => result,
        }
    }

    async fn close(&self) {
        // Cancel first so a loop parked in read/write releases its half.
        self.closed.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.close().await;
        }
    }

    fn id(&self) -> u64 {
        self.id
    }
}

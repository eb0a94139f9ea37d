//! Outbound connection to a peer agent.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::debug;

use beam_core::error::{BeamError, Result};
use beam_core::wire;

use crate::protocol::PREFIX;

/// A live connection to one peer. Request/response exchanges are
/// serialized on the socket; any failure closes the connection.
#[derive(Debug)]
pub struct PeerConnection {
    peer: String,
    addr: String,
    stream: Mutex<Option<TcpStream>>,
    closed: watch::Sender<bool>,
    io_timeout: Duration,
    max_frame_len: usize,
}

impl PeerConnection {
    /// Dial `addr` (`host:port`) for the peer named `peer`.
    pub async fn dial(
        peer: &str,
        addr: &str,
        dial_timeout: Duration,
        io_timeout: Duration,
        max_frame_len: usize,
    ) -> Result<Self> {
        let stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BeamError::Timeout(dial_timeout))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            peer: peer.to_string(),
            addr: addr.to_string(),
            stream: Mutex::new(Some(stream)),
            closed: watch::Sender::new(false),
            io_timeout,
            max_frame_len,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request frame and wait at most `io_timeout` for its
    /// response frame.
    pub async fn request(&self, payload: &[u8]) -> Result<Bytes> {
        self.exchange(payload, Some(self.io_timeout)).await
    }

    /// Send a CAST frame and wait for its ack for as long as the peer
    /// needs. The peer answers once the target mailbox has room, so only
    /// the write is bounded by `io_timeout`; a hung exchange still ends
    /// when the connection is closed or the peer goes away.
    pub async fn cast(&self, payload: &[u8]) -> Result<Bytes> {
        self.exchange(payload, None).await
    }

    async fn exchange(&self, payload: &[u8], reply_timeout: Option<Duration>) -> Result<Bytes> {
        let mut closed = self.closed.subscribe();
        let mut guard = tokio::select! {
            guard = self.stream.lock() => guard,
            _ = closed.wait_for(|c| *c) => {
                return Err(BeamError::ConnectionClosed(self.peer.clone()));
            }
        };
        if self.is_closed() {
            return Err(BeamError::ConnectionClosed(self.peer.clone()));
        }
        let Some(stream) = guard.as_mut() else {
            return Err(BeamError::ConnectionClosed(self.peer.clone()));
        };

        let exchange = async {
            timeout(self.io_timeout, wire::write_frame(&mut *stream, PREFIX, payload))
                .await
                .map_err(|_| BeamError::Timeout(self.io_timeout))??;
            let read = wire::read_frame(&mut *stream, PREFIX, self.max_frame_len);
            let frame = match reply_timeout {
                Some(limit) => timeout(limit, read)
                    .await
                    .map_err(|_| BeamError::Timeout(limit))??,
                None => read.await?,
            };
            frame.ok_or_else(|| BeamError::ConnectionClosed(self.peer.clone()))
        };
        let result = tokio::select! {
            result = exchange => result,
            _ = closed.wait_for(|c| *c) => Err(BeamError::ConnectionClosed(self.peer.clone())),
        };

        if let Err(e) = &result {
            debug!("Connection to {} failed, closing: {e}", self.peer);
            self.closed.send_replace(true);
            guard.take();
        }
        result
    }

    /// Close the socket, cutting short any exchange in flight.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
            debug!("Closed connection to {}", self.peer);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

//! Client side of the GPMD protocol. Each request uses its own connection.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use beam_core::error::{BeamError, Result};
use beam_core::identity::NodeIdentity;
use beam_core::wire;

use crate::protocol::{self, MAX_FRAME_LEN, Opcode, PREFIX, QueryReply, RegistryStatus, Request};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GpmdClient {
    addr: String,
    dial_timeout: Duration,
    io_timeout: Duration,
}

impl GpmdClient {
    /// `addr` is a `host:port` string, resolved on every dial.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, dial_timeout: Duration, io_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self.io_timeout = io_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn register(&self, identity: &NodeIdentity) -> Result<RegistryStatus> {
        let reply = self.exchange(&Request::Register(identity.clone())).await?;
        let (status, _) = protocol::decode_status(Opcode::Register, reply)?;
        Ok(status)
    }

    pub async fn unregister(&self, name: &str) -> Result<RegistryStatus> {
        let reply = self
            .exchange(&Request::Unregister {
                name: name.to_string(),
            })
            .await?;
        let (status, _) = protocol::decode_status(Opcode::Unregister, reply)?;
        Ok(status)
    }

    /// Look up `name`. `None` when the registry does not know it.
    pub async fn query(&self, name: &str) -> Result<Option<QueryReply>> {
        let reply = self
            .exchange(&Request::Query {
                name: name.to_string(),
            })
            .await?;
        let (status, mut body) = protocol::decode_status(Opcode::Query, reply)?;
        if status != RegistryStatus::Ok {
            return Ok(None);
        }

        let port = body.get_u16()?;
        let echoed = body.get_str16()?;
        if echoed != name {
            warn!("GPMD at {} answered query for {name} with {echoed}", self.addr);
            return Ok(None);
        }
        Ok(Some(QueryReply { port, name: echoed }))
    }

    async fn exchange(&self, request: &Request) -> Result<Bytes> {
        let payload = request.encode()?;

        let mut stream = match timeout(self.dial_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BeamError::RegistryUnreachable {
                    addr: self.addr.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(BeamError::RegistryUnreachable {
                    addr: self.addr.clone(),
                    reason: format!("dial timed out after {:?}", self.dial_timeout),
                });
            }
        };

        debug!("GPMD {:?} -> {}", request.opcode(), self.addr);
        let io = async {
            wire::write_frame(&mut stream, PREFIX, &payload).await?;
            wire::read_frame(&mut stream, PREFIX, MAX_FRAME_LEN)
                .await?
                .ok_or_else(|| BeamError::ConnectionClosed(self.addr.clone()))
        };
        timeout(self.io_timeout, io)
            .await
            .map_err(|_| BeamError::Timeout(self.io_timeout))?
    }
}

//! The GPMD registry server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beam_core::config::GpmdConfig;
use beam_core::error::{BeamError, Result};
use beam_core::lifecycle::{self, ListenerControl, ServiceState};
use beam_core::wire;

use crate::protocol::{
    self, MAX_FRAME_LEN, Opcode, PREFIX, QueryReply, RegistryStatus, Request,
};
use crate::table::RegistryTable;

/// A bound registry service.
///
/// ```ignore
/// let server = GpmdServer::bind(&GpmdConfig::default()).await?;
/// server.serve()?;
/// // ...
/// server.stop();
/// server.stopped().await;
/// ```
pub struct GpmdServer {
    table: Arc<RegistryTable>,
    control: Arc<ListenerControl>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    io_timeout: Duration,
}

impl GpmdServer {
    /// Resolve and bind the configured address. Failure here is fatal for
    /// the service.
    pub async fn bind(config: &GpmdConfig) -> Result<Self> {
        let addr = config.bind_address();
        let resolved = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| BeamError::Resolve {
                addr: addr.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| BeamError::Resolve {
                addr: addr.clone(),
                reason: "no addresses".into(),
            })?;

        let listener = TcpListener::bind(resolved).await?;
        let local_addr = listener.local_addr()?;
        info!("GPMD listening on {local_addr}");

        Ok(Self {
            table: Arc::new(RegistryTable::new()),
            control: ListenerControl::new("gpmd"),
            listener: Mutex::new(Some(listener)),
            local_addr,
            io_timeout: config.io_timeout,
        })
    }

    /// Start the self-healing accept loop on a background task.
    pub fn serve(&self) -> Result<JoinHandle<()>> {
        let listener = self.listener.lock().take().ok_or(BeamError::NotListening)?;
        let table = Arc::clone(&self.table);
        let io_timeout = self.io_timeout;

        Ok(tokio::spawn(lifecycle::run_accept_loop(
            Arc::clone(&self.control),
            self.local_addr,
            listener,
            move |stream, peer| {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    handle_connection(stream, peer, table, io_timeout).await;
                });
            },
        )))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn table(&self) -> &Arc<RegistryTable> {
        &self.table
    }

    pub fn state(&self) -> ServiceState {
        self.control.state()
    }

    pub fn restart_count(&self) -> u64 {
        self.control.restart_count()
    }

    /// Stop accepting for good. Safe to call more than once.
    pub fn stop(&self) {
        if self.control.request_stop() {
            // A listener that was never served is released here.
            self.listener.lock().take();
        }
    }

    pub async fn stopped(&self) {
        self.control.stopped().await
    }

    /// Resolves after the next listener re-creation.
    pub fn restarted(&self) -> impl Future<Output = u64> + Send + 'static {
        self.control.restarted()
    }

    /// Drop and re-create the listening socket.
    pub fn restart_listener(&self) {
        self.control.request_restart();
    }
}

/// Serve requests on one connection until EOF, idle timeout, or a
/// protocol error. Errors are local to the connection.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    table: Arc<RegistryTable>,
    io_timeout: Duration,
) {
    debug!("GPMD connection from {peer}");
    loop {
        let payload =
            match tokio::time::timeout(io_timeout, wire::read_frame(&mut stream, PREFIX, MAX_FRAME_LEN))
                .await
            {
                Ok(Ok(Some(payload))) => payload,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    debug!("GPMD read from {peer} failed: {e}");
                    break;
                }
                Err(_) => {
                    debug!("GPMD connection from {peer} idle, closing");
                    break;
                }
            };

        let reply = match dispatch(&table, payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Dropping GPMD connection from {peer}: {e}");
                break;
            }
        };

        if let Err(e) = wire::write_frame(&mut stream, PREFIX, &reply).await {
            debug!("GPMD write to {peer} failed: {e}");
            break;
        }
    }
}

/// Apply one request to the table and build its response payload.
pub fn dispatch(table: &RegistryTable, payload: Bytes) -> Result<Bytes> {
    let reply = match Request::decode(payload)? {
        Request::Register(identity) => {
            let name = identity.name.clone();
            let status = if table.register(identity) {
                info!("Registered node {name}");
                RegistryStatus::Ok
            } else {
                debug!("Node {name} already registered");
                RegistryStatus::NodeExist
            };
            protocol::encode_status(Opcode::Register, status)
        }
        Request::Unregister { name } => {
            let status = if table.unregister(&name) {
                info!("Unregistered node {name}");
                RegistryStatus::Ok
            } else {
                RegistryStatus::NodeNotExist
            };
            protocol::encode_status(Opcode::Unregister, status)
        }
        Request::Query { name } => {
            let reply = table.find(&name).map(|identity| QueryReply {
                port: identity.port,
                name: identity.name,
            });
            protocol::encode_query_reply(reply.as_ref())?
        }
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beam_core::identity::NodeIdentity;

    #[test]
    fn test_dispatch_register_then_query() {
        let table = RegistryTable::new();
        let register = Request::Register(NodeIdentity::new("agent_name", "localhost", 26130));

        let reply = dispatch(&table, register.encode().unwrap()).unwrap();
        assert_eq!(&reply[..], &[0x01, 0x00]);
        let reply = dispatch(&table, register.encode().unwrap()).unwrap();
        assert_eq!(&reply[..], &[0x01, 0x01]);

        let query = Request::Query {
            name: "agent_name".into(),
        };
        let reply = dispatch(&table, query.encode().unwrap()).unwrap();
        assert_eq!(&reply[..4], &[0x03, 0x00, 0x12, 0x66]);
    }

    #[test]
    fn test_dispatch_unknown_opcode_is_error() {
        let table = RegistryTable::new();
        assert!(dispatch(&table, Bytes::from_static(&[0x09])).is_err());
    }
}

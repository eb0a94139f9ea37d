//! Registry registration, peer lookup and connection establishment.

use std::sync::Arc;

use tracing::{debug, info, warn};

use beam_core::error::{BeamError, Result};
use beam_core::identity::{NodeIdentity, split_node_name};
use beam_gpmd::{GpmdClient, RegistryStatus};

use crate::agent::Agent;
use crate::connection::PeerConnection;
use crate::protocol::{self, AgentStatus, Opcode, Request};

impl Agent {
    /// Register this node with the local registry. Fails if the registry
    /// cannot be reached or refuses the name.
    pub async fn register(&self) -> Result<()> {
        if self.port() == 0 {
            return Err(BeamError::NotListening);
        }
        let identity = self.identity();
        match self.gpmd().register(&identity).await? {
            RegistryStatus::Ok => {
                self.set_registered(true);
                info!("Registered {identity} with GPMD at {}", self.gpmd().addr());
                Ok(())
            }
            status => Err(BeamError::RegistrationRejected {
                name: identity.name,
                status: status as u8,
            }),
        }
    }

    /// Remove this node from the local registry. Failures are logged only.
    pub async fn unregister(&self) {
        self.set_registered(false);
        match self.gpmd().unregister(self.name()).await {
            Ok(RegistryStatus::Ok) => info!("Unregistered {} from GPMD", self.node_name()),
            Ok(status) => warn!("GPMD refused to unregister {}: {status:?}", self.node_name()),
            Err(e) => warn!("Cannot unregister {}: {e}", self.node_name()),
        }
    }

    /// Learn the port of `name@host` from the registry running on `host`.
    /// Does nothing for this node or an already known peer.
    pub async fn query_node(&self, node: &str) {
        let (name, host) = split_node_name(node);
        if name == self.name() || self.knows_peer(name) {
            return;
        }
        let Some(host) = host else {
            warn!("Cannot query {node}: no host given");
            return;
        };

        let config = self.config();
        let client = GpmdClient::new(format!("{host}:{}", config.gpmd_port))
            .with_timeouts(config.dial_timeout, config.io_timeout);
        match client.query(name).await {
            Ok(Some(reply)) => {
                self.peer_table()
                    .insert(NodeIdentity::new(reply.name, host, reply.port));
            }
            Ok(None) => debug!("{node} is not registered at {}", client.addr()),
            Err(e) => warn!("Query for {node} failed: {e}"),
        }
    }

    /// Open a connection to a known peer. The peer connects back on its
    /// own, so either side can cast afterwards.
    pub async fn connect_to(&self, node: &str) {
        self.connect(node, false).await
    }

    pub(crate) async fn connect(&self, node: &str, is_return: bool) {
        let (name, _) = split_node_name(node);
        if name == self.name() {
            return;
        }
        let Some(peer) = self.peer(name) else {
            debug!("Not connecting to unknown peer {name}");
            return;
        };
        if let Err(e) = self.open_connection(&peer, is_return).await {
            warn!("Connect to {peer} failed: {e}");
        }
    }

    async fn open_connection(&self, peer: &NodeIdentity, is_return: bool) -> Result<()> {
        let config = self.config();
        let conn = PeerConnection::dial(
            &peer.name,
            &peer.address(),
            config.dial_timeout,
            config.io_timeout,
            config.max_frame_len,
        )
        .await?;

        let handshake = Request::Conn {
            is_return,
            identity: self.identity(),
        }
        .encode()?;
        let reply = conn.request(&handshake).await?;
        let (status, _) = protocol::decode_status(Opcode::Conn, reply)?;
        if status != AgentStatus::ConnOk {
            conn.close().await;
            return Err(BeamError::UnexpectedReply {
                expected: AgentStatus::ConnOk as u8,
                got: status as u8,
            });
        }

        let conn = Arc::new(conn);
        if self.control().is_stop_requested() {
            conn.close().await;
            return Ok(());
        }
        if let Some(old) = self.connection_table().insert(&peer.name, conn) {
            info!("Replacing connection to {}", peer.name);
            old.close().await;
        }
        info!(
            "{} connected to {peer}{}",
            self.node_name(),
            if is_return { " (return)" } else { "" }
        );
        Ok(())
    }

    /// Ask a connected peer for every node it knows, record them, and
    /// connect to those not yet connected.
    pub async fn query_all_node(&self, node: &str) {
        let (name, _) = split_node_name(node);
        if name == self.name() {
            return;
        }
        let Some(conn) = self.connection(name) else {
            debug!("Not connected to {name}, cannot query its peers");
            return;
        };

        let peers = match self.fetch_peers(&conn).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("QUERY_ALL to {name} failed: {e}");
                return;
            }
        };

        for peer in peers {
            let full_name = peer.full_name();
            let peer_name = peer.name.clone();
            self.peer_table().insert(peer);
            if peer_name != self.name() && !self.is_connected(&peer_name) {
                let agent = self.clone();
                tokio::spawn(async move {
                    agent.connect_to(&full_name).await;
                });
            }
        }
    }

    async fn fetch_peers(&self, conn: &PeerConnection) -> Result<Vec<NodeIdentity>> {
        let request = Request::QueryAll {
            requester: self.name().to_string(),
        }
        .encode()?;
        let reply = conn.request(&request).await?;
        let (status, mut body) = protocol::decode_status(Opcode::QueryAll, reply)?;
        match status {
            AgentStatus::QueryAllOk => protocol::decode_peer_list(&mut body),
            other => Err(BeamError::UnexpectedReply {
                expected: AgentStatus::QueryAllOk as u8,
                got: other as u8,
            }),
        }
    }

    /// Look `name@host` up in its registry, then connect to it.
    pub async fn join(&self, node: &str) {
        self.query_node(node).await;
        self.connect_to(node).await;
    }
}

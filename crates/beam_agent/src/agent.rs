//! The per-node agent: directories, lifecycle and message casting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beam_core::config::AgentConfig;
use beam_core::error::{BeamError, Result};
use beam_core::identity::{NodeIdentity, NodeName, split_node_name};
use beam_core::lifecycle::{self, ListenerControl, ServiceState};
use beam_gpmd::GpmdClient;

use crate::connection::PeerConnection;
use crate::directory::{ConnectionTable, MailboxTable, PeerTable};
use crate::handler;
use crate::mailbox::{Mailbox, RoutineId};
use crate::process::Process;
use crate::protocol::{self, AgentStatus, Opcode, Request};

/// A node's agent. Cloning is cheap; all clones share one node.
///
/// Lifecycle: [`Agent::listen`] → [`Agent::serve`] (or [`Agent::start`]
/// for both) → [`Agent::register`] → ... → [`Agent::stop`] →
/// [`Agent::stopped`].
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    node: NodeName,
    config: AgentConfig,
    // 0 until `listen` succeeds.
    port: AtomicU16,
    peers: PeerTable,
    connections: ConnectionTable,
    mailboxes: MailboxTable,
    control: Arc<ListenerControl>,
    listener: Mutex<Option<TcpListener>>,
    registered: AtomicBool,
    gpmd: GpmdClient,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("node", &self.inner.node)
            .field("port", &self.port())
            .field("state", &self.state())
            .finish()
    }
}

impl Agent {
    /// Create an agent for `name@host`. Nothing is bound yet.
    pub fn new(node: &str, config: AgentConfig) -> Result<Self> {
        let node = NodeName::parse(node)?;
        let gpmd = GpmdClient::new(config.gpmd_address())
            .with_timeouts(config.dial_timeout, config.io_timeout);
        let control = ListenerControl::new(format!("agent {node}"));
        Ok(Self {
            inner: Arc::new(AgentInner {
                node,
                config,
                port: AtomicU16::new(0),
                peers: PeerTable::default(),
                connections: ConnectionTable::default(),
                mailboxes: MailboxTable::default(),
                control,
                listener: Mutex::new(None),
                registered: AtomicBool::new(false),
                gpmd,
            }),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.inner.node.name
    }

    pub fn host(&self) -> &str {
        &self.inner.node.host
    }

    pub fn node_name(&self) -> &NodeName {
        &self.inner.node
    }

    /// Bound port, or 0 before [`Agent::listen`].
    pub fn port(&self) -> u16 {
        self.inner.port.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.name(), self.host(), self.port())
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServiceState {
        self.inner.control.state()
    }

    pub fn restart_count(&self) -> u64 {
        self.inner.control.restart_count()
    }

    pub fn restarted(&self) -> impl Future<Output = u64> + Send + 'static {
        self.inner.control.restarted()
    }

    /// Drop and re-create the listening socket.
    pub fn restart_listener(&self) {
        self.inner.control.request_restart();
    }

    pub fn knows_peer(&self, name: &str) -> bool {
        self.inner.peers.contains(name)
    }

    pub fn peer(&self, name: &str) -> Option<NodeIdentity> {
        self.inner.peers.get(name)
    }

    /// Every known peer, this node included, sorted by name.
    pub fn peers(&self) -> Vec<NodeIdentity> {
        self.inner.peers.snapshot()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.inner.connections.contains(name)
    }

    pub fn connection(&self, name: &str) -> Option<Arc<PeerConnection>> {
        self.inner.connections.get(name)
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.inner.connections.names()
    }

    pub fn find_mailbox(&self, id: RoutineId) -> Option<Arc<Mailbox>> {
        self.inner.mailboxes.get(id)
    }

    pub(crate) fn peer_table(&self) -> &PeerTable {
        &self.inner.peers
    }

    pub(crate) fn connection_table(&self) -> &ConnectionTable {
        &self.inner.connections
    }

    pub(crate) fn control(&self) -> &Arc<ListenerControl> {
        &self.inner.control
    }

    pub(crate) fn gpmd(&self) -> &GpmdClient {
        &self.inner.gpmd
    }

    pub(crate) fn set_registered(&self, registered: bool) -> bool {
        self.inner.registered.swap(registered, Ordering::SeqCst)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Bind the first free candidate port and record this node in its own
    /// peer table. Failing every candidate is fatal.
    pub async fn listen(&self) -> Result<u16> {
        if self.port() != 0 {
            return Ok(self.port());
        }

        let mut attempts = Vec::new();
        for &candidate in &self.inner.config.candidate_ports {
            match TcpListener::bind((self.host(), candidate)).await {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    *self.inner.listener.lock() = Some(listener);
                    self.inner.port.store(port, Ordering::SeqCst);
                    self.inner.peers.insert(self.identity());
                    info!("Agent {} listening on port {port}", self.inner.node);
                    return Ok(port);
                }
                Err(e) => {
                    debug!("Cannot bind {}:{candidate}: {e}", self.host());
                    attempts.push(format!("{}:{candidate}: {e}", self.host()));
                }
            }
        }
        Err(BeamError::NoCandidatePort { attempts })
    }

    /// Spawn the self-healing accept loop. Each connection gets its own task.
    pub fn serve(&self) -> Result<JoinHandle<()>> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or(BeamError::NotListening)?;
        let addr = listener.local_addr()?;
        let agent = self.clone();

        Ok(tokio::spawn(lifecycle::run_accept_loop(
            Arc::clone(&self.inner.control),
            addr,
            listener,
            move |stream, peer| {
                let agent = agent.clone();
                tokio::spawn(async move {
                    handler::serve_connection(agent, stream, peer).await;
                });
            },
        )))
    }

    /// `listen` followed by `serve`. Returns the bound port.
    pub async fn start(&self) -> Result<u16> {
        let port = self.listen().await?;
        self.serve()?;
        Ok(port)
    }

    /// Stop the listener, close every outbound connection and unregister
    /// from the registry if registered. Later calls do nothing.
    pub async fn stop(&self) {
        if !self.inner.control.request_stop() {
            return;
        }
        self.inner.listener.lock().take();

        let connections = self.inner.connections.drain();
        futures::future::join_all(connections.iter().map(|c| c.close())).await;

        if self.set_registered(false) {
            self.unregister().await;
        }
        info!("Agent {} stopped", self.inner.node);
    }

    /// Wait until the accept loop has exited.
    pub async fn stopped(&self) {
        self.inner.control.stopped().await
    }

    // ── Routines ────────────────────────────────────────────────────────

    /// Give `mailbox` the next routine id and make it reachable by casts.
    /// Fails if the mailbox already has an id.
    pub fn register_routine(&self, mailbox: &Arc<Mailbox>) -> Result<RoutineId> {
        let id = mailbox.assign_id()?;
        self.inner.mailboxes.insert(id, Arc::clone(mailbox));
        debug!("Registered routine {id} on {}", self.inner.node);
        Ok(id)
    }

    /// A registered mailbox with the configured capacity.
    pub fn new_mailbox(&self) -> Result<Arc<Mailbox>> {
        let mailbox = Arc::new(Mailbox::new(self.inner.config.mailbox_capacity));
        self.register_routine(&mailbox)?;
        Ok(mailbox)
    }

    /// A registered process, ready to [`Process::run`].
    pub fn new_process(&self) -> Result<Process> {
        let mailbox = Arc::new(Mailbox::new(self.inner.config.mailbox_capacity));
        let id = self.register_routine(&mailbox)?;
        Ok(Process::new(id, mailbox))
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send `message` to routine `id` on `node` (`name` or `name@host`).
    ///
    /// Fire-and-forget: casts to this node go straight to the mailbox,
    /// casts to an unconnected peer are dropped, and remote failures are
    /// only logged. A cast to a full mailbox waits until it has room.
    pub async fn cast_to(&self, node: &str, id: RoutineId, message: impl Into<Bytes>) {
        let (name, _) = split_node_name(node);
        let message = message.into();

        if name == self.name() {
            match self.find_mailbox(id) {
                Some(mailbox) => {
                    if let Err(e) = mailbox.deliver(message).await {
                        debug!("Local cast to routine {id} dropped: {e}");
                    }
                }
                None => debug!("Local cast to unknown routine {id} dropped"),
            }
            return;
        }

        let Some(conn) = self.inner.connections.get(name) else {
            debug!("No connection to {name}, cast to routine {id} dropped");
            return;
        };

        let result = async {
            let payload = Request::Cast {
                mailbox: id,
                message,
            }
            .encode()?;
            let reply = conn.cast(&payload).await?;
            protocol::decode_status(Opcode::Cast, reply).map(|(status, _)| status)
        }
        .await;

        match result {
            Ok(AgentStatus::CastOk) => debug!("Cast to {name}/{id} delivered"),
            Ok(AgentStatus::CastRoutineNotFound) => {
                debug!("Cast to {name}/{id} dropped: routine not found")
            }
            Ok(other) => warn!("Cast to {name}/{id} answered with {other:?}"),
            Err(e) => {
                warn!("Cast to {name}/{id} at {} failed: {e}", conn.addr());
                if conn.is_closed() {
                    self.inner.connections.remove_if_same(name, &conn);
                }
            }
        }
    }
}

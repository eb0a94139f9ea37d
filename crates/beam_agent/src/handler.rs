//! Server side of the agent protocol: one task per inbound connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use beam_core::error::Result;
use beam_core::wire;

use crate::agent::Agent;
use crate::protocol::{self, AgentStatus, Opcode, PREFIX, Request};

/// Answer requests on `stream` until the peer hangs up, sends something
/// malformed, or the agent stops.
pub(crate) async fn serve_connection(agent: Agent, mut stream: TcpStream, peer: SocketAddr) {
    debug!("Inbound connection from {peer}");
    let control = Arc::clone(agent.control());
    let stopped = control.stopped();
    tokio::pin!(stopped);
    let max_frame_len = agent.config().max_frame_len;

    loop {
        let frame = tokio::select! {
            frame = wire::read_frame(&mut stream, PREFIX, max_frame_len) => frame,
            _ = &mut stopped => break,
        };
        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                debug!("Read from {peer} failed: {e}");
                break;
            }
        };

        // A CAST can wait on a full mailbox; stopping must still end it.
        let dispatched = tokio::select! {
            reply = dispatch(&agent, payload) => reply,
            _ = &mut stopped => break,
        };
        let reply = match dispatched {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Dropping connection from {peer}: {e}");
                break;
            }
        };

        if let Err(e) = wire::write_frame(&mut stream, PREFIX, &reply).await {
            debug!("Write to {peer} failed: {e}");
            break;
        }
    }
    debug!("Inbound connection from {peer} closed");
}

/// Handle one request. An error means the connection must be dropped.
pub(crate) async fn dispatch(agent: &Agent, payload: Bytes) -> Result<Bytes> {
    let reply = match Request::decode(payload)? {
        Request::Conn {
            is_return,
            identity,
        } => {
            let full_name = identity.full_name();
            agent.peer_table().insert(identity);
            if !is_return {
                let agent = agent.clone();
                tokio::spawn(async move {
                    agent.connect(&full_name, true).await;
                });
            }
            protocol::encode_status(Opcode::Conn, AgentStatus::ConnOk)
        }
        Request::Cast { mailbox, message } => {
            let delivered = match agent.find_mailbox(mailbox) {
                Some(target) => target.deliver(message).await.is_ok(),
                None => false,
            };
            let status = if delivered {
                AgentStatus::CastOk
            } else {
                debug!("Cast to unknown routine {mailbox}");
                AgentStatus::CastRoutineNotFound
            };
            protocol::encode_status(Opcode::Cast, status)
        }
        Request::QueryAll { requester } => {
            if agent.knows_peer(&requester) {
                protocol::encode_peer_list(&agent.peers())?
            } else {
                debug!("QUERY_ALL from unknown peer {requester}");
                protocol::encode_status(Opcode::QueryAll, AgentStatus::QueryAllErr)
            }
        }
    };
    Ok(reply)
}

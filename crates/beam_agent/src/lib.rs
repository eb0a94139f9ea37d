//! Beam Agent: the per-node runtime of a beam cluster.
//!
//! An [`Agent`] listens on one of a fixed list of ports, registers itself
//! with the local GPMD registry and keeps three directories: the peers it
//! knows, one live connection per peer, and its local mailboxes.
//!
//! ```ignore
//! let agent = Agent::new("alpha@127.0.0.1", AgentConfig::default())?;
//! agent.start().await?;
//! agent.register().await?;
//! agent.join("beta@10.0.0.2").await;
//!
//! let process = agent.new_process()?;
//! let id = process.id();
//! process.run(|msg| async move {
//!     tracing::info!("got {} bytes", msg.len());
//!     anyhow::Ok(Flow::Continue)
//! });
//! agent.cast_to("beta", remote_id, "hello").await;
//! ```

pub mod agent;
pub mod connection;
pub mod directory;
mod discovery;
mod handler;
pub mod mailbox;
pub mod process;
pub mod protocol;

pub use agent::Agent;
pub use connection::PeerConnection;
pub use mailbox::{Mailbox, RoutineId};
pub use process::{Flow, Process, ProcessExit, ProcessFault, ProcessHandle, RestartPolicy};

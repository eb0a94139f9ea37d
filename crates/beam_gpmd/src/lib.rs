//! Beam GPMD: the name registry that maps node names to their listening
//! address.
//!
//! A node registers `{port, name, host}` on startup and unregisters on
//! shutdown. Other nodes query a node's own host registry to learn the
//! port it listens on before connecting to it directly.

pub mod client;
pub mod protocol;
pub mod server;
pub mod table;

pub use client::GpmdClient;
pub use protocol::{QueryReply, RegistryStatus};
pub use server::GpmdServer;
pub use table::{RegistryEntry, RegistryTable};

//! Beam Core: shared plumbing for the beam name registry and node agents.
//!
//! Both long-running services (the GPMD name registry and every node's
//! agent) are built from the pieces in this crate.
//!
//! # Architecture
//!
//! - **Wire**: length-prefixed binary frames with little-endian fields.
//!   Registry frames carry a 16-bit prefix, agent frames a 64-bit one.
//! - **Identity**: `name@host` node identifiers and their reachable port.
//! - **Lifecycle**: a self-healing TCP accept loop with an explicit
//!   `Starting → Serving → Restarting → Stopped` state machine.
//! - **Config / Logging**: JSON configuration files and `tracing` setup.

pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{AgentConfig, BeamConfig, GpmdConfig};
pub use error::{BeamError, Result};
pub use identity::{NodeIdentity, NodeName};
pub use lifecycle::{ListenerControl, ServiceState};
pub use wire::{LengthPrefix, Packer, Unpacker, WireError};

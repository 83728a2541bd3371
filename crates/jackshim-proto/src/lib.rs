//! Wire types spoken between a client-node and the graph server: the
//! node/port protocol messages, the shared-memory activation record and
//! position/segment blocks, and the port type/flag vocabulary.
//!
//! This crate owns no I/O and no mapping logic — it only describes the
//! bytes. `jackshim-core` maps the memory and drives the state machine.

pub mod error;
pub mod message;
pub mod pod;
pub mod port;

pub use error::ProtocolError;
pub use message::{ClientMessage, PortParamId, ServerMessage};
pub use pod::{Activation, ActivationStatus, Clock, Position, Segment, TransportState};
pub use port::{PortFlags, PortType};

/// Sentinel id meaning "no object" / "the port's own output mix", matching
/// the legacy API's use of a single reserved integer across node, port, and
/// mix ids.
pub const INVALID_ID: u32 = u32::MAX;

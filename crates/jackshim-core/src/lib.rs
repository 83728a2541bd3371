//! Realtime bridge between a legacy audio-client API surface and a
//! PipeWire graph node. This crate is the safe core; `jackshim-capi`
//! exposes it across the C ABI boundary the legacy API requires.

pub mod bufmgr;
pub mod channel;
pub mod client;
pub mod cycle;
pub mod error;
pub mod midi;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use client::{Client, ClientOptions, ClientStatus};
pub use error::CoreError;
pub use registry::{Link, Node, Object, Port as RegistryPort};

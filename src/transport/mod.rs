//! TCP full-mesh transport.
//!
//! Peers rendezvous through the store, connect one link per peer pair, and
//! exchange length-delimited frames addressed by a lane byte and a 32-bit
//! tag. Collective invocations use the engine's per-invocation tag on the
//! collective lane; point-to-point traffic uses caller tags on its own
//! lane, so the two namespaces never collide.

pub(crate) mod collective;
mod context;

pub use context::TcpDevice;
pub(crate) use context::{Context, UnboundBuffer};

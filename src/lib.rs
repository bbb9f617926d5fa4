//! plexus: a synchronous collective-communication process group.
//!
//! Peers rendezvous through a shared key/value [`Store`], connect a TCP
//! full mesh, and submit collective operations (broadcast, allreduce,
//! reduce, allgather, gather, scatter, barrier, send/recv) on [`Tensor`]
//! buffers to a pool of worker threads. Each submission returns a shared
//! [`Work`] handle; `wait()` blocks until completion and re-raises any
//! captured failure.
//!
//! With the `cuda` feature enabled, broadcast and allreduce accept
//! device-resident tensors: inputs stage through pinned host buffers on
//! dedicated streams so the caller's default compute stream is never
//! blocked, and `synchronize()` fences it against the copied-back
//! results.

mod config;
pub mod error;
mod group;
mod ops;
pub mod reduce;
pub mod store;
pub mod tensor;
mod transport;
pub mod types;
mod work;

#[cfg(feature = "cuda")]
mod cuda;

pub use config::GroupOptions;
pub use error::{PlexusError, Result};
pub use group::ProcessGroup;
pub use ops::sendrecv::{RecvWork, SendWork};
pub use store::{HashStore, PrefixStore, Store};
pub use tensor::{Scalar, Tensor, flatten_dense, new_like_flat};
pub use transport::TcpDevice;
pub use types::{DataType, Placement, Rank, ReduceOp, Tag};
pub use work::{AsyncWork, Work};

//! Concrete work items, one module per collective.
//!
//! Each work binds validated tensor handles to a wire call on the owning
//! context. Host and device variants differ only in the staging wrapper;
//! the device variants live behind the `cuda` feature.

pub(crate) mod allgather;
pub(crate) mod allreduce;
pub(crate) mod barrier;
pub(crate) mod broadcast;
pub(crate) mod gather;
pub(crate) mod reduce;
pub(crate) mod scatter;
pub(crate) mod sendrecv;

use crate::tensor::Tensor;

/// View a host tensor's payload as a mutable byte slice.
///
/// # Safety
/// The caller must hold a handle to `tensor` for the lifetime of the
/// slice, the tensor must be contiguous host memory, and the engine must
/// be the only mutator while the slice is live. Collective validation
/// establishes the layout; the work item holding the handle establishes
/// the lifetime.
pub(crate) unsafe fn host_bytes_mut<'a>(tensor: &'a Tensor) -> &'a mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(tensor.data_ptr(), tensor.nbytes()) }
}

/// Shared-view counterpart of [`host_bytes_mut`].
///
/// # Safety
/// Same contract as [`host_bytes_mut`].
pub(crate) unsafe fn host_bytes<'a>(tensor: &'a Tensor) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(tensor.data_ptr(), tensor.nbytes()) }
}

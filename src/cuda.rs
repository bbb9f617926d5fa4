//! Device staging for the accelerator path.
//!
//! Each device input of a collective stages through a pinned host buffer
//! on a dedicated non-default stream taken from a per-device pool. An
//! event recorded on the caller's current stream serializes the staging
//! copy behind the caller's prior work; after the host-side wire call,
//! the copy back to the device is recorded again so `synchronize()` can
//! fence the caller's stream without ever blocking the host.

use crate::error::{PlexusError, Result};
use crate::tensor::Tensor;
use crate::types::Placement;
use crossbeam_queue::ArrayQueue;
use cudarc::driver::{CudaContext, result, sys};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Reusable staging streams kept per device.
const STREAM_POOL_CAPACITY: usize = 32;

fn contexts() -> &'static Mutex<HashMap<u32, Arc<CudaContext>>> {
    static CONTEXTS: OnceLock<Mutex<HashMap<u32, Arc<CudaContext>>>> = OnceLock::new();
    CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The shared driver context for a device ordinal, created on first use.
fn context(ordinal: u32) -> Result<Arc<CudaContext>> {
    let mut map = contexts().lock().expect("cuda context table poisoned");
    if let Some(ctx) = map.get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }
    let ctx = CudaContext::new(ordinal as usize)
        .map_err(|e| PlexusError::device_with_source(format!("create context for cuda:{ordinal}"), e))?;
    map.insert(ordinal, Arc::clone(&ctx));
    Ok(ctx)
}

fn stream_pools() -> &'static Mutex<HashMap<u32, Arc<ArrayQueue<usize>>>> {
    static POOLS: OnceLock<Mutex<HashMap<u32, Arc<ArrayQueue<usize>>>>> = OnceLock::new();
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn stream_pool(ordinal: u32) -> Arc<ArrayQueue<usize>> {
    let mut map = stream_pools().lock().expect("stream pool table poisoned");
    Arc::clone(
        map.entry(ordinal)
            .or_insert_with(|| Arc::new(ArrayQueue::new(STREAM_POOL_CAPACITY))),
    )
}

fn ordinal_of(tensor: &Tensor) -> Result<u32> {
    match tensor.placement() {
        Placement::Cuda(ordinal) => Ok(ordinal),
        Placement::Host => Err(PlexusError::Device(
            "expected a device tensor, got host".into(),
        )),
    }
}

fn device_ptr_of(tensor: &Tensor) -> sys::CUdeviceptr {
    tensor.data_ptr() as usize as sys::CUdeviceptr
}

/// The caller's current stream: the legacy default stream.
pub(crate) fn default_stream() -> sys::CUstream {
    std::ptr::null_mut()
}

/// Owned device memory backing a device-resident tensor.
pub(crate) struct DeviceAllocation {
    ctx: Arc<CudaContext>,
    dptr: sys::CUdeviceptr,
    len: usize,
}

unsafe impl Send for DeviceAllocation {}
unsafe impl Sync for DeviceAllocation {}

impl DeviceAllocation {
    pub fn zeroed(ordinal: u32, len: usize) -> Result<Self> {
        let ctx = context(ordinal)?;
        ctx.bind_to_thread()
            .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
        let dptr = unsafe { result::malloc_sync(len.max(1)) }
            .map_err(|e| PlexusError::device_with_source("cuMemAlloc", e))?;
        unsafe { result::memset_d8_sync(dptr, 0, len.max(1)) }
            .map_err(|e| PlexusError::device_with_source("cuMemsetD8", e))?;
        Ok(Self { ctx, dptr, len })
    }

    pub fn device_ptr(&self) -> u64 {
        self.dptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if self.ctx.bind_to_thread().is_ok() {
            let _ = unsafe { result::free_sync(self.dptr) };
        }
    }
}

/// Page-locked host memory used to stage one device input.
pub(crate) struct PinnedBuffer {
    ctx: Arc<CudaContext>,
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    /// A pinned buffer matching `tensor`'s byte size, allocated against
    /// its device's context.
    pub fn like(tensor: &Tensor) -> Result<Self> {
        let ordinal = ordinal_of(tensor)?;
        let ctx = context(ordinal)?;
        ctx.bind_to_thread()
            .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
        let len = tensor.nbytes().max(1);
        let ptr = unsafe { result::malloc_host(len, 0) }
            .map_err(|e| PlexusError::device_with_source("cuMemHostAlloc", e))?;
        Ok(Self {
            ctx,
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// # Safety
    /// The owning work item is the only accessor while the buffer is in
    /// flight; staging copies on the dedicated stream must be
    /// synchronized before the host touches the contents.
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// # Safety
    /// Same contract as [`bytes_mut`](Self::bytes_mut).
    pub unsafe fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if self.ctx.bind_to_thread().is_ok() {
            let _ = unsafe { result::free_host(self.ptr as *mut std::ffi::c_void) };
        }
    }
}

/// A non-default stream checked out of the per-device pool. Returned on
/// drop; surplus streams are destroyed.
pub(crate) struct Stream {
    ctx: Arc<CudaContext>,
    raw: sys::CUstream,
    ordinal: u32,
}

unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

impl Stream {
    pub fn acquire(ordinal: u32) -> Result<Self> {
        let ctx = context(ordinal)?;
        ctx.bind_to_thread()
            .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
        if let Some(raw) = stream_pool(ordinal).pop() {
            return Ok(Self {
                ctx,
                raw: raw as sys::CUstream,
                ordinal,
            });
        }
        let raw = unsafe { result::stream::create(result::stream::StreamKind::NonBlocking) }
            .map_err(|e| PlexusError::device_with_source("cuStreamCreate", e))?;
        Ok(Self { ctx, raw, ordinal })
    }

    pub fn raw(&self) -> sys::CUstream {
        self.raw
    }

    /// Block the host until all work queued on this stream has finished.
    pub fn synchronize(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
        unsafe { result::stream::synchronize(self.raw) }
            .map_err(|e| PlexusError::device_with_source("cuStreamSynchronize", e))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if stream_pool(self.ordinal).push(self.raw as usize).is_err()
            && self.ctx.bind_to_thread().is_ok()
        {
            let _ = unsafe { result::stream::destroy(self.raw) };
        }
    }
}

/// A timing-disabled event owned by one work item.
pub(crate) struct Event {
    ctx: Arc<CudaContext>,
    raw: sys::CUevent,
}

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    pub fn new(ordinal: u32) -> Result<Self> {
        let ctx = context(ordinal)?;
        ctx.bind_to_thread()
            .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
        let raw = unsafe { result::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING) }
            .map_err(|e| PlexusError::device_with_source("cuEventCreate", e))?;
        Ok(Self { ctx, raw })
    }

    /// Record this event on `stream`.
    pub fn record(&self, stream: sys::CUstream) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
        unsafe { result::event::record(self.raw, stream) }
            .map_err(|e| PlexusError::device_with_source("cuEventRecord", e))
    }

    /// Make `stream` wait for this event without blocking the host.
    pub fn block(&self, stream: sys::CUstream) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
        unsafe {
            result::stream::wait_event(
                stream,
                self.raw,
                sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(|e| PlexusError::device_with_source("cuStreamWaitEvent", e))
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if self.ctx.bind_to_thread().is_ok() {
            let _ = unsafe { result::event::destroy(self.raw) };
        }
    }
}

/// Per-input staging streams and events, index-aligned with the inputs.
pub(crate) struct Staging {
    pub streams: Vec<Stream>,
    pub events: Vec<Event>,
}

/// One stream and one event per device input. Each event is recorded on
/// the caller's current stream and blocked on by the input's dedicated
/// stream, so staging copies are serialized behind the caller's prior
/// work without occupying its stream.
pub(crate) fn init_streams_events(inputs: &[Tensor]) -> Result<Staging> {
    let mut streams = Vec::with_capacity(inputs.len());
    let mut events = Vec::with_capacity(inputs.len());
    for input in inputs {
        let ordinal = ordinal_of(input)?;
        let event = Event::new(ordinal)?;
        event.record(default_stream())?;
        let stream = Stream::acquire(ordinal)?;
        event.block(stream.raw())?;
        streams.push(stream);
        events.push(event);
    }
    Ok(Staging { streams, events })
}

/// Queue an async device-to-pinned copy on `stream`.
pub(crate) fn copy_device_to_pinned(
    stream: &Stream,
    src: &Tensor,
    dst: &PinnedBuffer,
) -> Result<()> {
    stream
        .ctx
        .bind_to_thread()
        .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
    let dst_bytes = unsafe { dst.bytes_mut() };
    let n = src.nbytes().min(dst_bytes.len());
    unsafe { result::memcpy_dtoh_async(&mut dst_bytes[..n], device_ptr_of(src), stream.raw()) }
        .map_err(|e| PlexusError::device_with_source("cuMemcpyDtoHAsync", e))
}

/// Queue an async pinned-to-device copy on `stream`.
pub(crate) fn copy_pinned_to_device(
    stream: &Stream,
    src: &PinnedBuffer,
    dst: &Tensor,
) -> Result<()> {
    stream
        .ctx
        .bind_to_thread()
        .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
    let src_bytes = unsafe { src.bytes() };
    let n = dst.nbytes().min(src_bytes.len());
    unsafe { result::memcpy_htod_async(device_ptr_of(dst), &src_bytes[..n], stream.raw()) }
        .map_err(|e| PlexusError::device_with_source("cuMemcpyHtoDAsync", e))
}

/// Synchronous host-to-device copy backing `Tensor::copy_from`.
pub(crate) fn copy_host_to_device(dst: &Tensor, src: &Tensor, _non_blocking: bool) -> Result<()> {
    let ordinal = ordinal_of(dst)?;
    context(ordinal)?
        .bind_to_thread()
        .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
    let src_bytes = unsafe { std::slice::from_raw_parts(src.data_ptr(), src.nbytes()) };
    unsafe { result::memcpy_htod_sync(device_ptr_of(dst), src_bytes) }
        .map_err(|e| PlexusError::device_with_source("cuMemcpyHtoD", e))
}

/// Synchronous device-to-host copy backing `Tensor::copy_from`.
pub(crate) fn copy_device_to_host(dst: &Tensor, src: &Tensor, _non_blocking: bool) -> Result<()> {
    let ordinal = ordinal_of(src)?;
    context(ordinal)?
        .bind_to_thread()
        .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
    let dst_bytes = unsafe { std::slice::from_raw_parts_mut(dst.data_ptr(), dst.nbytes()) };
    unsafe { result::memcpy_dtoh_sync(dst_bytes, device_ptr_of(src)) }
        .map_err(|e| PlexusError::device_with_source("cuMemcpyDtoH", e))
}

/// Synchronous same-device copy backing `Tensor::copy_from`.
pub(crate) fn copy_device_to_device(dst: &Tensor, src: &Tensor) -> Result<()> {
    let ordinal = ordinal_of(dst)?;
    context(ordinal)?
        .bind_to_thread()
        .map_err(|e| PlexusError::device_with_source("bind_to_thread", e))?;
    unsafe { result::memcpy_dtod_sync(device_ptr_of(dst), device_ptr_of(src), dst.nbytes()) }
        .map_err(|e| PlexusError::device_with_source("cuMemcpyDtoD", e))
}

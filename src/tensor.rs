//! The array buffer handle consumed by the process group.
//!
//! A `Tensor` is a cheaply clonable shared handle over typed, strided
//! storage. Work items capture tensor handles to keep the storage alive
//! until completion; while a work item is in flight the engine is the sole
//! mutator, and mutating the buffer from outside is undefined.

use crate::error::{PlexusError, Result};
use crate::types::{DataType, Placement};
use std::sync::Arc;

mod private {
    pub trait Sealed {}
}

/// Rust scalar types that map onto a [`DataType`].
pub trait Scalar: private::Sealed + Copy + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_scalar {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}
            impl Scalar for $ty {
                const DTYPE: DataType = $dtype;
            }
        )*
    };
}

impl_scalar! {
    f32 => DataType::F32,
    f64 => DataType::F64,
    half::f16 => DataType::F16,
    i8 => DataType::I8,
    u8 => DataType::U8,
    i32 => DataType::I32,
    i64 => DataType::I64,
}

/// Owned host bytes, held as a raw allocation so worker threads can write
/// through `data_ptr` without ever forming a unique reference to the
/// whole buffer.
struct HostAllocation {
    ptr: *mut u8,
    len: usize,
}

impl HostAllocation {
    fn new(bytes: Vec<u8>) -> Self {
        let mut boxed = bytes.into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        let len = boxed.len();
        std::mem::forget(boxed);
        Self { ptr, len }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

enum StorageKind {
    Host(HostAllocation),
    #[cfg(feature = "cuda")]
    Cuda(crate::cuda::DeviceAllocation),
}

struct Storage {
    placement: Placement,
    kind: StorageKind,
}

// Storage is shared between the caller and worker threads. The engine is
// the sole mutator of a buffer while its work item is in flight; callers
// that mutate concurrently get undefined contents, not memory unsafety
// beyond the documented contract on `data_ptr`.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

struct Inner {
    dtype: DataType,
    sizes: Vec<usize>,
    /// Strides in elements.
    strides: Vec<usize>,
    /// Offset into storage, in elements.
    offset: usize,
    storage: Arc<Storage>,
}

/// A shared handle to a typed, strided array buffer.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<Inner>,
}

fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1].max(1);
    }
    strides
}

fn numel_of(sizes: &[usize]) -> usize {
    sizes.iter().product()
}

impl Tensor {
    fn from_parts(
        dtype: DataType,
        sizes: Vec<usize>,
        strides: Vec<usize>,
        offset: usize,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dtype,
                sizes,
                strides,
                offset,
                storage,
            }),
        }
    }

    fn new_host(dtype: DataType, sizes: Vec<usize>, bytes: Vec<u8>) -> Self {
        let strides = contiguous_strides(&sizes);
        let storage = Arc::new(Storage {
            placement: Placement::Host,
            kind: StorageKind::Host(HostAllocation::new(bytes)),
        });
        Self::from_parts(dtype, sizes, strides, 0, storage)
    }

    /// A zero-filled host tensor.
    pub fn zeros(dtype: DataType, sizes: &[usize]) -> Self {
        let bytes = vec![0u8; numel_of(sizes) * dtype.size_in_bytes()];
        Self::new_host(dtype, sizes.to_vec(), bytes)
    }

    /// A 1-D host tensor holding a copy of `data`.
    pub fn from_slice<T: Scalar>(data: &[T]) -> Self {
        let byte_len = std::mem::size_of_val(data);
        let src = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, byte_len) };
        Self::new_host(T::DTYPE, vec![data.len()], src.to_vec())
    }

    pub fn dtype(&self) -> DataType {
        self.inner.dtype
    }

    pub fn sizes(&self) -> &[usize] {
        &self.inner.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.inner.strides
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        numel_of(&self.inner.sizes)
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        self.inner.dtype.size_in_bytes()
    }

    /// Logical size of the tensor in bytes.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.element_size()
    }

    pub fn placement(&self) -> Placement {
        self.inner.storage.placement
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.strides == contiguous_strides(&self.inner.sizes)
    }

    /// Whether the layout is a non-overlapping cover of its elements (a
    /// permutation of some contiguous layout). plexus tensors are never
    /// sparse; a `false` here means overlapping or hole-carrying strides.
    pub fn is_dense(&self) -> bool {
        let mut dims: Vec<(usize, usize)> = self
            .inner
            .strides
            .iter()
            .copied()
            .zip(self.inner.sizes.iter().copied())
            .filter(|&(_, size)| size > 1)
            .collect();
        dims.sort_unstable_by_key(|&(stride, _)| stride);
        let mut expected = 1;
        for (stride, size) in dims {
            if stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    /// Raw pointer to the first element.
    ///
    /// For host tensors this is a host address; for device tensors it is
    /// the device address. Dereferencing is only valid while a handle to
    /// this tensor is held, and concurrent mutation while a work item is
    /// in flight is undefined.
    pub fn data_ptr(&self) -> *mut u8 {
        let byte_off = self.inner.offset * self.element_size();
        match &self.inner.storage.kind {
            StorageKind::Host(alloc) => unsafe { alloc.ptr.add(byte_off) },
            #[cfg(feature = "cuda")]
            StorageKind::Cuda(alloc) => (alloc.device_ptr() as usize + byte_off) as *mut u8,
        }
    }

    /// Copy the contents of `src` into this tensor.
    ///
    /// Requires matching dtype and element count and contiguous layouts on
    /// both sides. Host copies are synchronous regardless of
    /// `non_blocking`; device copies honor it where the driver allows.
    pub fn copy_from(&self, src: &Tensor, non_blocking: bool) -> Result<()> {
        #[cfg(not(feature = "cuda"))]
        let _ = non_blocking;
        if self.dtype() != src.dtype() {
            return Err(PlexusError::invalid_argument(
                "copy_from",
                format!("dtype mismatch: {} vs {}", self.dtype(), src.dtype()),
            ));
        }
        if self.numel() != src.numel() {
            return Err(PlexusError::SizeMismatch {
                expected: self.nbytes(),
                actual: src.nbytes(),
            });
        }
        if !self.is_contiguous() || !src.is_contiguous() {
            return Err(PlexusError::invalid_argument(
                "copy_from",
                "requires contiguous tensors",
            ));
        }
        let bytes = self.nbytes();
        match (self.placement(), src.placement()) {
            (Placement::Host, Placement::Host) => {
                // Handles to the same storage alias; overlapping ranges do
                // not occur because offsets differ only through disjoint
                // `select0` rows.
                unsafe {
                    std::ptr::copy(src.data_ptr(), self.data_ptr(), bytes);
                }
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (Placement::Cuda(_), Placement::Host) => {
                crate::cuda::copy_host_to_device(self, src, non_blocking)
            }
            #[cfg(feature = "cuda")]
            (Placement::Host, Placement::Cuda(_)) => {
                crate::cuda::copy_device_to_host(self, src, non_blocking)
            }
            #[cfg(feature = "cuda")]
            (Placement::Cuda(a), Placement::Cuda(b)) => {
                if a != b {
                    return Err(PlexusError::Unsupported(
                        "copy_from across devices".into(),
                    ));
                }
                crate::cuda::copy_device_to_device(self, src)
            }
        }
    }

    /// Contiguous view with new sizes; element count must match.
    pub fn reshape(&self, sizes: &[usize]) -> Result<Tensor> {
        if !self.is_contiguous() {
            return Err(PlexusError::invalid_argument(
                "reshape",
                "requires a contiguous tensor",
            ));
        }
        if numel_of(sizes) != self.numel() {
            return Err(PlexusError::invalid_argument(
                "reshape",
                format!("cannot reshape {:?} to {:?}", self.sizes(), sizes),
            ));
        }
        Ok(Self::from_parts(
            self.inner.dtype,
            sizes.to_vec(),
            contiguous_strides(sizes),
            self.inner.offset,
            Arc::clone(&self.inner.storage),
        ))
    }

    /// View with two dimensions swapped. Shares storage; typically not
    /// contiguous.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        let ndim = self.inner.sizes.len();
        if dim0 >= ndim || dim1 >= ndim {
            return Err(PlexusError::invalid_argument(
                "transpose",
                format!("dims ({dim0}, {dim1}) out of range for {ndim}-d tensor"),
            ));
        }
        let mut sizes = self.inner.sizes.clone();
        let mut strides = self.inner.strides.clone();
        sizes.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Self::from_parts(
            self.inner.dtype,
            sizes,
            strides,
            self.inner.offset,
            Arc::clone(&self.inner.storage),
        ))
    }

    /// Arbitrary-layout view over the same storage. The layout must stay
    /// within the storage bounds.
    pub fn as_strided(&self, sizes: &[usize], strides: &[usize]) -> Result<Tensor> {
        if sizes.len() != strides.len() {
            return Err(PlexusError::invalid_argument(
                "as_strided",
                "sizes and strides must have equal rank",
            ));
        }
        let max_index: usize = sizes
            .iter()
            .zip(strides)
            .map(|(&size, &stride)| size.saturating_sub(1) * stride)
            .sum();
        let span = (self.inner.offset + max_index + 1) * self.element_size();
        if numel_of(sizes) > 0 && span > self.storage_bytes() {
            return Err(PlexusError::invalid_argument(
                "as_strided",
                "layout exceeds storage bounds",
            ));
        }
        Ok(Self::from_parts(
            self.inner.dtype,
            sizes.to_vec(),
            strides.to_vec(),
            self.inner.offset,
            Arc::clone(&self.inner.storage),
        ))
    }

    /// View of row `index` along the leading dimension.
    pub fn select0(&self, index: usize) -> Result<Tensor> {
        if self.inner.sizes.is_empty() || index >= self.inner.sizes[0] {
            return Err(PlexusError::invalid_argument(
                "select0",
                format!("index {index} out of range for sizes {:?}", self.sizes()),
            ));
        }
        Ok(Self::from_parts(
            self.inner.dtype,
            self.inner.sizes[1..].to_vec(),
            self.inner.strides[1..].to_vec(),
            self.inner.offset + index * self.inner.strides[0],
            Arc::clone(&self.inner.storage),
        ))
    }

    /// Copy the contents out as a typed vector. Host, contiguous only.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype() {
            return Err(PlexusError::invalid_argument(
                "to_vec",
                format!("requested {} from a {} tensor", T::DTYPE, self.dtype()),
            ));
        }
        if self.placement() != Placement::Host {
            return Err(PlexusError::invalid_argument(
                "to_vec",
                "requires a host tensor",
            ));
        }
        if !self.is_contiguous() {
            return Err(PlexusError::invalid_argument(
                "to_vec",
                "requires a contiguous tensor",
            ));
        }
        let count = self.numel();
        let ptr = self.data_ptr() as *const T;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(unsafe { std::ptr::read_unaligned(ptr.add(i)) });
        }
        Ok(out)
    }

    fn storage_bytes(&self) -> usize {
        match &self.inner.storage.kind {
            StorageKind::Host(alloc) => alloc.len,
            #[cfg(feature = "cuda")]
            StorageKind::Cuda(alloc) => alloc.len(),
        }
    }

    /// A zero-filled tensor on the CUDA device with the given ordinal.
    #[cfg(feature = "cuda")]
    pub fn cuda_zeros(dtype: DataType, sizes: &[usize], ordinal: u32) -> Result<Self> {
        let bytes = numel_of(sizes) * dtype.size_in_bytes();
        let alloc = crate::cuda::DeviceAllocation::zeroed(ordinal, bytes)?;
        let strides = contiguous_strides(sizes);
        let storage = Arc::new(Storage {
            placement: Placement::Cuda(ordinal),
            kind: StorageKind::Cuda(alloc),
        });
        Ok(Self::from_parts(dtype, sizes.to_vec(), strides, 0, storage))
    }

    /// Copy this host tensor to the given CUDA device.
    #[cfg(feature = "cuda")]
    pub fn to_cuda(&self, ordinal: u32) -> Result<Tensor> {
        let out = Tensor::cuda_zeros(self.dtype(), self.sizes(), ordinal)?;
        out.copy_from(self, false)?;
        Ok(out)
    }

    /// Copy this tensor back to host memory.
    #[cfg(feature = "cuda")]
    pub fn to_host(&self) -> Result<Tensor> {
        let out = Tensor::zeros(self.dtype(), self.sizes());
        out.copy_from(self, false)?;
        Ok(out)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype())
            .field("sizes", &self.sizes())
            .field("placement", &self.placement())
            .finish()
    }
}

/// Concatenate dense, contiguous, same-typed host tensors into one
/// contiguous 1-D tensor.
pub fn flatten_dense(tensors: &[Tensor]) -> Result<Tensor> {
    let first = tensors.first().ok_or_else(|| {
        PlexusError::invalid_argument("flatten_dense", "requires a non-empty tensor list")
    })?;
    let dtype = first.dtype();
    let total: usize = tensors.iter().map(Tensor::numel).sum();
    let out = Tensor::zeros(dtype, &[total]);
    let mut off = 0;
    for t in tensors {
        if t.dtype() != dtype {
            return Err(PlexusError::invalid_argument(
                "flatten_dense",
                "requires same-typed tensors",
            ));
        }
        if t.placement() != Placement::Host || !t.is_contiguous() {
            return Err(PlexusError::invalid_argument(
                "flatten_dense",
                "requires contiguous host tensors",
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(t.data_ptr(), out.data_ptr().add(off), t.nbytes());
        }
        off += t.nbytes();
    }
    Ok(out)
}

/// Build a contiguous host tensor shaped `[N, *sizes]` from a list of N
/// same-typed, same-shaped tensors.
pub fn new_like_flat(tensors: &[Tensor]) -> Result<Tensor> {
    let first = tensors.first().ok_or_else(|| {
        PlexusError::invalid_argument("new_like_flat", "requires a non-empty tensor list")
    })?;
    let mut sizes = Vec::with_capacity(first.sizes().len() + 1);
    sizes.push(tensors.len());
    sizes.extend_from_slice(first.sizes());
    Ok(Tensor::zeros(first.dtype(), &sizes))
}

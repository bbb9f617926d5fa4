//! The process group: construction, validation and collective dispatch.

use crate::config::GroupOptions;
use crate::error::{PlexusError, Result};
use crate::ops::allgather::AllgatherWork;
use crate::ops::allreduce::AllreduceWork;
use crate::ops::barrier::BarrierWork;
use crate::ops::broadcast::BroadcastWork;
use crate::ops::gather::GatherWork;
use crate::ops::reduce::ReduceWork;
use crate::ops::scatter::ScatterWork;
use crate::ops::sendrecv::{RecvWork, SendWork};
use crate::reduce;
use crate::store::{Store, StoreAdapter};
use crate::tensor::Tensor;
use crate::transport::{Context, UnboundBuffer};
use crate::types::{Placement, Rank, ReduceOp, Tag};
use crate::work::{AsyncWork, Collective, WorkQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A group of peer processes bound together over a TCP full mesh,
/// exposing collective operations on tensor buffers.
///
/// The constructor blocks until every peer has joined the mesh; the group
/// identity `(rank, size, contexts)` is immutable afterwards. Collective
/// methods validate synchronously, enqueue a work item onto the worker
/// pool, and return a shared handle. Dropping the group drains the queue
/// and joins the workers.
pub struct ProcessGroup {
    rank: Rank,
    size: u32,
    contexts: Vec<Arc<Context>>,
    queue: WorkQueue,
    collective_counter: AtomicU32,
    options: GroupOptions,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ProcessGroup {
    /// Rendezvous through `store` and connect one context per configured
    /// device. Fails fast on an empty device list, an out-of-range rank,
    /// or any connect failure, leaving no partially constructed group.
    pub fn new(
        store: Arc<dyn Store>,
        rank: Rank,
        size: u32,
        options: GroupOptions,
    ) -> Result<Self> {
        if options.devices.is_empty() {
            return Err(PlexusError::InvalidConfiguration(
                "no transport devices specified".into(),
            ));
        }
        if size == 0 || rank >= size {
            return Err(PlexusError::InvalidConfiguration(format!(
                "rank {rank} out of range for group size {size}"
            )));
        }
        if options.threads == 0 {
            return Err(PlexusError::InvalidConfiguration(
                "worker thread count must be at least 1".into(),
            ));
        }

        let adapter = StoreAdapter::new(store);
        let mut contexts = Vec::with_capacity(options.devices.len());
        for (index, device) in options.devices.iter().enumerate() {
            let context =
                Context::connect_full_mesh(rank, size, options.timeout, &adapter, device, index)?;
            contexts.push(Arc::new(context));
        }
        tracing::info!(
            rank,
            size,
            devices = options.devices.len(),
            threads = options.threads,
            "process group connected"
        );

        Ok(Self {
            rank,
            size,
            contexts,
            queue: WorkQueue::new(options.threads),
            collective_counter: AtomicU32::new(0),
            options,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    /// Allocate the next collective tag. Tags strictly increase in
    /// submission order and wrap modulo 2^32; a group would need 2^32
    /// collectives in flight for two to collide.
    fn next_tag(&self) -> Tag {
        self.collective_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, tag: Tag, task: Box<dyn Collective>) -> Arc<AsyncWork> {
        let work = AsyncWork::new(tag, task);
        self.queue.enqueue(Arc::clone(&work));
        work
    }

    /// Broadcast `inputs[root_tensor]` from `root_rank` to every rank,
    /// then copy it into the remaining inputs on each rank.
    pub fn broadcast(
        &self,
        inputs: &[Tensor],
        root_rank: Rank,
        root_tensor: usize,
    ) -> Result<Arc<AsyncWork>> {
        const OP: &str = "broadcast";
        assert_rank(OP, root_rank, self.size)?;
        assert_root_tensor(OP, root_tensor, inputs.len())?;
        assert_dense(OP, inputs)?;
        assert_contiguous(OP, inputs)?;
        assert_type_and_sizes_match(OP, inputs)?;
        assert_single_device_kind(OP, inputs)?;

        let tag = self.next_tag();
        let task: Box<dyn Collective> = match inputs[0].placement() {
            Placement::Host => Box::new(BroadcastWork {
                ctx: Arc::clone(&self.contexts[0]),
                inputs: inputs.to_vec(),
                root_rank,
                root_tensor,
                tag,
            }),
            #[cfg(feature = "cuda")]
            Placement::Cuda(_) => Box::new(crate::ops::broadcast::CudaBroadcastWork::new(
                Arc::clone(&self.contexts[0]),
                inputs.to_vec(),
                root_rank,
                root_tensor,
                tag,
            )?),
        };
        Ok(self.enqueue(tag, task))
    }

    /// All-reduce over `inputs`, in place: afterwards every input on
    /// every rank holds the element-wise reduction of all of them.
    pub fn allreduce(&self, inputs: &[Tensor], op: ReduceOp) -> Result<Arc<AsyncWork>> {
        const OP: &str = "allreduce";
        assert_non_empty(OP, inputs)?;
        assert_dense(OP, inputs)?;
        assert_contiguous(OP, inputs)?;
        assert_type_and_sizes_match(OP, inputs)?;
        assert_single_device_kind(OP, inputs)?;
        let reduce = reduce::resolve(inputs[0].dtype(), op)?;

        let tag = self.next_tag();
        let task: Box<dyn Collective> = match inputs[0].placement() {
            Placement::Host => Box::new(AllreduceWork {
                ctx: Arc::clone(&self.contexts[0]),
                inputs: inputs.to_vec(),
                reduce,
                tag,
            }),
            #[cfg(feature = "cuda")]
            Placement::Cuda(_) => Box::new(crate::ops::allreduce::CudaAllreduceWork::new(
                Arc::clone(&self.contexts[0]),
                inputs.to_vec(),
                reduce,
                tag,
            )?),
        };
        Ok(self.enqueue(tag, task))
    }

    /// Reduce the single input tensor onto `root_rank`.
    pub fn reduce(
        &self,
        inputs: &[Tensor],
        root_rank: Rank,
        root_tensor: usize,
        op: ReduceOp,
    ) -> Result<Arc<AsyncWork>> {
        const OP: &str = "reduce";
        assert_rank(OP, root_rank, self.size)?;
        assert_root_tensor(OP, root_tensor, inputs.len())?;
        assert_single_element(OP, inputs)?;
        assert_dense(OP, inputs)?;
        assert_contiguous(OP, inputs)?;
        assert_host(OP, inputs)?;
        let reduce = reduce::resolve(inputs[0].dtype(), op)?;

        let tag = self.next_tag();
        let task = Box::new(ReduceWork {
            ctx: Arc::clone(&self.contexts[0]),
            inputs: inputs.to_vec(),
            root_rank,
            reduce,
            tag,
        });
        Ok(self.enqueue(tag, task))
    }

    /// Gather every rank's inputs into every rank's outputs. Each
    /// `outputs[i]` must hold `inputs.len() * size` tensors.
    pub fn allgather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
    ) -> Result<Arc<AsyncWork>> {
        const OP: &str = "allgather";
        assert_non_empty(OP, inputs)?;
        if inputs.len() != outputs.len() {
            return Err(PlexusError::invalid_argument(
                OP,
                "requires input/output tensor lists to have the same length",
            ));
        }
        let expected = inputs.len() * self.size as usize;
        for (i, output_list) in outputs.iter().enumerate() {
            if output_list.len() != expected {
                return Err(PlexusError::invalid_argument(
                    OP,
                    format!(
                        "invalid output tensor list at index {i} \
                         (expected length {expected}, got {})",
                        output_list.len()
                    ),
                ));
            }
        }
        assert_dense(OP, inputs)?;
        assert_contiguous(OP, inputs)?;
        assert_host(OP, inputs)?;
        assert_type_and_sizes_match(OP, inputs)?;
        let dtype = inputs[0].dtype();
        let sizes = inputs[0].sizes();
        for output_list in outputs {
            assert_type_and_sizes_match_with(OP, output_list, dtype, sizes)?;
            assert_contiguous(OP, output_list)?;
            assert_host(OP, output_list)?;
        }

        let tag = self.next_tag();
        let task = Box::new(AllgatherWork {
            ctx: Arc::clone(&self.contexts[0]),
            outputs: outputs.to_vec(),
            inputs: inputs.to_vec(),
            tag,
        });
        Ok(self.enqueue(tag, task))
    }

    /// Gather the single input tensor from every rank onto `root_rank`.
    /// The root passes one list of `size` outputs; other ranks pass none.
    pub fn gather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        root_rank: Rank,
    ) -> Result<Arc<AsyncWork>> {
        const OP: &str = "gather";
        assert_rank(OP, root_rank, self.size)?;
        assert_single_element(OP, inputs)?;
        assert_dense(OP, inputs)?;
        assert_contiguous(OP, inputs)?;
        assert_host(OP, inputs)?;

        if self.rank == root_rank {
            if outputs.len() != 1 || outputs[0].len() != self.size as usize {
                return Err(PlexusError::invalid_argument(
                    OP,
                    "requires a single-element output list \
                     containing a list with <size> tensors",
                ));
            }
            assert_type_and_sizes_match_with(OP, &outputs[0], inputs[0].dtype(), inputs[0].sizes())?;
            assert_contiguous(OP, &outputs[0])?;
            assert_host(OP, &outputs[0])?;
        } else if !outputs.is_empty() {
            return Err(PlexusError::invalid_argument(
                OP,
                "requires empty output on non-root",
            ));
        }

        let tag = self.next_tag();
        let task = Box::new(GatherWork {
            ctx: Arc::clone(&self.contexts[0]),
            outputs: outputs.to_vec(),
            inputs: inputs.to_vec(),
            root_rank,
            tag,
        });
        Ok(self.enqueue(tag, task))
    }

    /// Scatter one tensor per rank from `root_rank` into every rank's
    /// single output. The root passes one list of `size` inputs; other
    /// ranks pass none.
    pub fn scatter(
        &self,
        outputs: &[Tensor],
        inputs: &[Vec<Tensor>],
        root_rank: Rank,
    ) -> Result<Arc<AsyncWork>> {
        const OP: &str = "scatter";
        assert_rank(OP, root_rank, self.size)?;
        assert_single_element(OP, outputs)?;
        assert_dense(OP, outputs)?;
        assert_contiguous(OP, outputs)?;
        assert_host(OP, outputs)?;

        if self.rank == root_rank {
            if inputs.len() != 1 || inputs[0].len() != self.size as usize {
                return Err(PlexusError::invalid_argument(
                    OP,
                    "requires a single-element input list \
                     containing a list with <size> tensors",
                ));
            }
            assert_type_and_sizes_match_with(OP, &inputs[0], outputs[0].dtype(), outputs[0].sizes())?;
            assert_contiguous(OP, &inputs[0])?;
            assert_host(OP, &inputs[0])?;
        } else if !inputs.is_empty() {
            return Err(PlexusError::invalid_argument(
                OP,
                "requires empty input on non-root",
            ));
        }

        let tag = self.next_tag();
        let task = Box::new(ScatterWork {
            ctx: Arc::clone(&self.contexts[0]),
            outputs: outputs.to_vec(),
            inputs: inputs.to_vec(),
            root_rank,
            tag,
        });
        Ok(self.enqueue(tag, task))
    }

    /// Fence: completes only after every work item pending or in progress
    /// at submission time has completed and all ranks have joined the
    /// wire barrier. Work submitted after the barrier is unaffected.
    pub fn barrier(&self) -> Result<Arc<AsyncWork>> {
        let prior = self.queue.snapshot();
        let tag = self.next_tag();
        let task = Box::new(BarrierWork {
            ctx: Arc::clone(&self.contexts[0]),
            prior,
            tag,
        });
        Ok(self.enqueue(tag, task))
    }

    /// Post `tensor` to `dst_rank`. The returned work completes the send
    /// on `wait()`.
    pub fn send(&self, tensor: &Tensor, dst_rank: Rank, tag: i32) -> Result<Arc<SendWork>> {
        const OP: &str = "send";
        assert_rank(OP, dst_rank, self.size)?;
        let tag = check_p2p_tag(OP, tag)?;
        check_p2p_tensor(OP, tensor)?;

        let buffer = unsafe {
            UnboundBuffer::new(
                Arc::clone(&self.contexts[0]),
                tensor.data_ptr(),
                tensor.nbytes(),
            )
        };
        buffer.send(dst_rank, tag);
        Ok(SendWork::new(tensor.clone(), buffer))
    }

    /// Receive into `tensor` from `src_rank`. The returned work blocks in
    /// `wait()` and then exposes the sender via `source_rank()`.
    pub fn recv(&self, tensor: &Tensor, src_rank: Rank, tag: i32) -> Result<Arc<RecvWork>> {
        const OP: &str = "recv";
        assert_rank(OP, src_rank, self.size)?;
        let tag = check_p2p_tag(OP, tag)?;
        check_p2p_tensor(OP, tensor)?;

        let buffer = unsafe {
            UnboundBuffer::new(
                Arc::clone(&self.contexts[0]),
                tensor.data_ptr(),
                tensor.nbytes(),
            )
        };
        buffer.recv(vec![src_rank], tag);
        Ok(RecvWork::new(tensor.clone(), buffer))
    }

    /// Receive into `tensor` from whichever rank sends first.
    pub fn recv_anysource(&self, tensor: &Tensor, tag: i32) -> Result<Arc<RecvWork>> {
        const OP: &str = "recv_anysource";
        let tag = check_p2p_tag(OP, tag)?;
        check_p2p_tensor(OP, tensor)?;

        let buffer = unsafe {
            UnboundBuffer::new(
                Arc::clone(&self.contexts[0]),
                tensor.data_ptr(),
                tensor.nbytes(),
            )
        };
        buffer.recv((0..self.size).collect(), tag);
        Ok(RecvWork::new(tensor.clone(), buffer))
    }

    /// Not provided by this backend.
    pub fn group_ranks(&self) -> Result<HashMap<Rank, Rank>> {
        Err(PlexusError::Unsupported(
            "this process group does not support group_ranks".into(),
        ))
    }
}

fn assert_rank(op: &'static str, rank: Rank, size: u32) -> Result<()> {
    if rank >= size {
        return Err(PlexusError::invalid_argument(
            op,
            format!("invalid rank {rank}, group size is {size}"),
        ));
    }
    Ok(())
}

fn assert_root_tensor(op: &'static str, index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(PlexusError::invalid_argument(
            op,
            format!("invalid root tensor index {index} for {len} input tensor(s)"),
        ));
    }
    Ok(())
}

fn assert_non_empty(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    if tensors.is_empty() {
        return Err(PlexusError::invalid_argument(
            op,
            "requires a non-empty tensor list",
        ));
    }
    Ok(())
}

fn assert_single_element(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    if tensors.len() != 1 {
        return Err(PlexusError::invalid_argument(
            op,
            format!("requires a single tensor, got {}", tensors.len()),
        ));
    }
    Ok(())
}

fn assert_dense(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    for t in tensors {
        if !t.is_dense() {
            return Err(PlexusError::invalid_argument(op, "requires dense tensors"));
        }
    }
    Ok(())
}

fn assert_contiguous(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    for t in tensors {
        if !t.is_contiguous() {
            return Err(PlexusError::invalid_argument(
                op,
                "requires contiguous tensors",
            ));
        }
    }
    Ok(())
}

fn assert_host(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    for t in tensors {
        if t.placement() != Placement::Host {
            return Err(PlexusError::invalid_argument(op, "requires host tensors"));
        }
    }
    Ok(())
}

fn assert_single_device_kind(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    let placement = tensors[0].placement();
    for t in tensors {
        if t.placement() != placement {
            return Err(PlexusError::invalid_argument(
                op,
                "requires all tensors on the same device",
            ));
        }
    }
    Ok(())
}

fn assert_type_and_sizes_match(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    assert_type_and_sizes_match_with(op, tensors, tensors[0].dtype(), tensors[0].sizes())
}

fn assert_type_and_sizes_match_with(
    op: &'static str,
    tensors: &[Tensor],
    dtype: crate::types::DataType,
    sizes: &[usize],
) -> Result<()> {
    for t in tensors {
        if t.dtype() != dtype {
            return Err(PlexusError::invalid_argument(
                op,
                format!("expected all tensors of type {dtype}, got {}", t.dtype()),
            ));
        }
        if t.sizes() != sizes {
            return Err(PlexusError::invalid_argument(
                op,
                format!("expected all tensors sized {sizes:?}, got {:?}", t.sizes()),
            ));
        }
    }
    Ok(())
}

fn check_p2p_tag(op: &'static str, tag: i32) -> Result<Tag> {
    if tag < 0 {
        return Err(PlexusError::invalid_argument(op, "tag must be >= 0"));
    }
    Ok(tag as Tag)
}

fn check_p2p_tensor(op: &'static str, tensor: &Tensor) -> Result<()> {
    if !tensor.is_dense() {
        return Err(PlexusError::invalid_argument(op, "requires a dense tensor"));
    }
    if !tensor.is_contiguous() {
        return Err(PlexusError::invalid_argument(
            op,
            "requires a contiguous tensor",
        ));
    }
    assert_host(op, std::slice::from_ref(tensor))
}

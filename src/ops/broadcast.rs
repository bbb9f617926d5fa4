use crate::error::Result;
use crate::tensor::Tensor;
use crate::transport::{Context, collective};
use crate::types::{Rank, Tag};
use crate::work::Collective;
use std::sync::Arc;

/// Host broadcast: wire-broadcast the root tensor, then copy it into
/// every other input on this rank.
pub(crate) struct BroadcastWork {
    pub ctx: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub root_rank: Rank,
    pub root_tensor: usize,
    pub tag: Tag,
}

impl Collective for BroadcastWork {
    fn run(&self) -> Result<()> {
        let root = &self.inputs[self.root_tensor];
        let buf = unsafe { super::host_bytes_mut(root) };
        collective::broadcast(&self.ctx, self.tag, buf, self.root_rank)?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i != self.root_tensor {
                input.copy_from(root, false)?;
            }
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

/// Device broadcast. Only the root tensor stages through pinned memory on
/// the root rank; the received host payload is then copied back to every
/// device input on every rank.
#[cfg(feature = "cuda")]
pub(crate) struct CudaBroadcastWork {
    ctx: Arc<Context>,
    inputs: Vec<Tensor>,
    root_rank: Rank,
    root_tensor: usize,
    tag: Tag,
    staging: crate::cuda::Staging,
    tmp: crate::cuda::PinnedBuffer,
}

#[cfg(feature = "cuda")]
impl CudaBroadcastWork {
    /// Kicks off the device-to-pinned copy for the root tensor (root rank
    /// only) on its dedicated stream; the stream already waits on the
    /// caller's current stream.
    pub fn new(
        ctx: Arc<Context>,
        inputs: Vec<Tensor>,
        root_rank: Rank,
        root_tensor: usize,
        tag: Tag,
    ) -> Result<Self> {
        let staging = crate::cuda::init_streams_events(&inputs)?;
        let tmp = crate::cuda::PinnedBuffer::like(&inputs[root_tensor])?;
        if ctx.rank() == root_rank {
            crate::cuda::copy_device_to_pinned(
                &staging.streams[root_tensor],
                &inputs[root_tensor],
                &tmp,
            )?;
        }
        Ok(Self {
            ctx,
            inputs,
            root_rank,
            root_tensor,
            tag,
            staging,
            tmp,
        })
    }
}

#[cfg(feature = "cuda")]
impl Collective for CudaBroadcastWork {
    fn run(&self) -> Result<()> {
        if self.ctx.rank() == self.root_rank {
            self.staging.streams[self.root_tensor].synchronize()?;
        }
        let buf = unsafe { self.tmp.bytes_mut() };
        collective::broadcast(&self.ctx, self.tag, buf, self.root_rank)?;
        for (i, input) in self.inputs.iter().enumerate() {
            crate::cuda::copy_pinned_to_device(&self.staging.streams[i], &self.tmp, input)?;
            self.staging.events[i].record(self.staging.streams[i].raw())?;
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        for event in &self.staging.events {
            event.block(crate::cuda::default_stream())?;
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

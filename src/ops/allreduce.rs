use crate::error::Result;
use crate::reduce::ReduceFn;
use crate::tensor::Tensor;
use crate::transport::{Context, collective};
use crate::types::Tag;
use crate::work::Collective;
use std::sync::Arc;

/// Host all-reduce, in place over the input list: local inputs fold into
/// the first, the ring reduces it across ranks, and the result fans back
/// out to every local input.
pub(crate) struct AllreduceWork {
    pub ctx: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub reduce: ReduceFn,
    pub tag: Tag,
}

impl Collective for AllreduceWork {
    fn run(&self) -> Result<()> {
        let count = self.inputs[0].numel();
        let first = &self.inputs[0];
        let buf = unsafe { super::host_bytes_mut(first) };
        for other in &self.inputs[1..] {
            (self.reduce)(buf, unsafe { super::host_bytes(other) }, count);
        }
        collective::allreduce(&self.ctx, self.tag, buf, count, self.reduce)?;
        for other in &self.inputs[1..] {
            other.copy_from(first, false)?;
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

/// Device all-reduce: every input stages through its own pinned buffer on
/// its own stream, the host-side reduction and wire call run over the
/// pinned copies, and the result is copied back to each device input.
#[cfg(feature = "cuda")]
pub(crate) struct CudaAllreduceWork {
    ctx: Arc<Context>,
    inputs: Vec<Tensor>,
    reduce: ReduceFn,
    tag: Tag,
    staging: crate::cuda::Staging,
    tmp: Vec<crate::cuda::PinnedBuffer>,
}

#[cfg(feature = "cuda")]
impl CudaAllreduceWork {
    /// Kicks off one device-to-pinned copy per input on its dedicated
    /// stream; each stream already waits on the caller's current stream.
    pub fn new(
        ctx: Arc<Context>,
        inputs: Vec<Tensor>,
        reduce: ReduceFn,
        tag: Tag,
    ) -> Result<Self> {
        let staging = crate::cuda::init_streams_events(&inputs)?;
        let mut tmp = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let pinned = crate::cuda::PinnedBuffer::like(input)?;
            crate::cuda::copy_device_to_pinned(&staging.streams[i], input, &pinned)?;
            tmp.push(pinned);
        }
        Ok(Self {
            ctx,
            inputs,
            reduce,
            tag,
            staging,
            tmp,
        })
    }
}

#[cfg(feature = "cuda")]
impl Collective for CudaAllreduceWork {
    fn run(&self) -> Result<()> {
        for stream in &self.staging.streams {
            stream.synchronize()?;
        }
        let count = self.inputs[0].numel();
        let buf = unsafe { self.tmp[0].bytes_mut() };
        for other in &self.tmp[1..] {
            (self.reduce)(buf, unsafe { other.bytes() }, count);
        }
        collective::allreduce(&self.ctx, self.tag, buf, count, self.reduce)?;
        for (i, input) in self.inputs.iter().enumerate() {
            crate::cuda::copy_pinned_to_device(&self.staging.streams[i], &self.tmp[0], input)?;
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

use crate::error::Result;
use crate::tensor::Tensor;
use crate::transport::{Context, collective};
use crate::types::{Rank, Tag};
use crate::work::Collective;
use std::sync::Arc;

/// Host scatter-from-root. The root provides one tensor per rank; every
/// rank receives its slice into a single output tensor.
pub(crate) struct ScatterWork {
    pub ctx: Arc<Context>,
    pub outputs: Vec<Tensor>,
    pub inputs: Vec<Vec<Tensor>>,
    pub root_rank: Rank,
    pub tag: Tag,
}

impl Collective for ScatterWork {
    fn run(&self) -> Result<()> {
        let output = unsafe { super::host_bytes_mut(&self.outputs[0]) };
        if self.ctx.rank() == self.root_rank {
            let slices: Vec<&[u8]> = self.inputs[0]
                .iter()
                .map(|t| unsafe { super::host_bytes(t) })
                .collect();
            collective::scatter(&self.ctx, self.tag, self.root_rank, Some(&slices), output)
        } else {
            collective::scatter(&self.ctx, self.tag, self.root_rank, None, output)
        }
    }

    fn result(&self) -> Vec<Tensor> {
        self.outputs.clone()
    }
}

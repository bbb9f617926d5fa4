use crate::error::Result;
use crate::reduce::ReduceFn;
use crate::tensor::Tensor;
use crate::transport::{Context, collective};
use crate::types::{Rank, Tag};
use crate::work::Collective;
use std::sync::Arc;

/// Host reduce-to-root over a single input tensor.
pub(crate) struct ReduceWork {
    pub ctx: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub root_rank: Rank,
    pub reduce: ReduceFn,
    pub tag: Tag,
}

impl Collective for ReduceWork {
    fn run(&self) -> Result<()> {
        let input = &self.inputs[0];
        let buf = unsafe { super::host_bytes_mut(input) };
        collective::reduce(
            &self.ctx,
            self.tag,
            buf,
            input.numel(),
            self.root_rank,
            self.reduce,
        )
    }

    fn result(&self) -> Vec<Tensor> {
        self.inputs.clone()
    }
}

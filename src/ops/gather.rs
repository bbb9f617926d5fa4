use crate::error::Result;
use crate::tensor::{self, Tensor};
use crate::transport::{Context, collective};
use crate::types::{Rank, Tag};
use crate::work::Collective;
use std::sync::Arc;

/// Host gather-to-root. The root collects into a flat scratch tensor and
/// slices its rows into the caller-provided outputs; non-roots only
/// contribute their input.
pub(crate) struct GatherWork {
    pub ctx: Arc<Context>,
    pub outputs: Vec<Vec<Tensor>>,
    pub inputs: Vec<Tensor>,
    pub root_rank: Rank,
    pub tag: Tag,
}

impl Collective for GatherWork {
    fn run(&self) -> Result<()> {
        let input = unsafe { super::host_bytes(&self.inputs[0]) };
        if self.ctx.rank() == self.root_rank {
            let flat_output = tensor::new_like_flat(&self.outputs[0])?;
            let output = unsafe { super::host_bytes_mut(&flat_output) };
            collective::gather(&self.ctx, self.tag, self.root_rank, input, Some(output))?;
            for (i, output) in self.outputs[0].iter().enumerate() {
                output.copy_from(&flat_output.select0(i)?, false)?;
            }
        } else {
            collective::gather(&self.ctx, self.tag, self.root_rank, input, None)?;
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.outputs.iter().flatten().cloned().collect()
    }
}

use crate::error::Result;
use crate::tensor::{self, Tensor};
use crate::transport::{Context, collective};
use crate::types::Tag;
use crate::work::Collective;
use std::sync::Arc;

/// Host all-gather. Inputs flatten into one contiguous buffer, the wire
/// call fills a flat output sized `size` concatenations, and the rows of
/// the flat output are sliced back into the caller's output tensors.
pub(crate) struct AllgatherWork {
    pub ctx: Arc<Context>,
    pub outputs: Vec<Vec<Tensor>>,
    pub inputs: Vec<Tensor>,
    pub tag: Tag,
}

impl Collective for AllgatherWork {
    fn run(&self) -> Result<()> {
        let flat_input = tensor::flatten_dense(&self.inputs)?;
        let flat_output = tensor::new_like_flat(&self.outputs[0])?;

        let input = unsafe { super::host_bytes(&flat_input) };
        let output = unsafe { super::host_bytes_mut(&flat_output) };
        collective::allgather(&self.ctx, self.tag, input, output)?;

        for output_list in &self.outputs {
            for (j, output) in output_list.iter().enumerate() {
                output.copy_from(&flat_output.select0(j)?, false)?;
            }
        }
        Ok(())
    }

    fn result(&self) -> Vec<Tensor> {
        self.outputs.iter().flatten().cloned().collect()
    }
}

use crate::error::Result;
use crate::transport::{Context, collective};
use crate::types::Tag;
use crate::work::{AsyncWork, Collective, Work};
use std::sync::{Arc, Weak};

/// Barrier with fencing: waits on every work item that was pending or in
/// progress when the barrier was submitted, then joins the wire barrier.
/// Items completed and dropped since the snapshot fail to upgrade and are
/// skipped.
pub(crate) struct BarrierWork {
    pub ctx: Arc<Context>,
    pub prior: Vec<Weak<AsyncWork>>,
    pub tag: Tag,
}

impl Collective for BarrierWork {
    fn run(&self) -> Result<()> {
        for weak in &self.prior {
            if let Some(work) = weak.upgrade() {
                work.wait()?;
            }
        }
        collective::barrier(&self.ctx, self.tag)
    }
}

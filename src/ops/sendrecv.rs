use crate::error::{PlexusError, Result};
use crate::tensor::Tensor;
use crate::transport::UnboundBuffer;
use crate::types::Rank;
use crate::work::Work;
use std::sync::{Arc, Mutex};

struct P2pState {
    completed: bool,
    failure: Option<PlexusError>,
}

impl P2pState {
    fn new() -> Mutex<Self> {
        Mutex::new(Self {
            completed: false,
            failure: None,
        })
    }

    fn settle(&mut self, outcome: &Result<()>) -> Result<()> {
        self.completed = true;
        self.failure = outcome.clone().err();
        outcome.clone()
    }

    fn terminal(&self) -> Result<()> {
        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}

/// Handle for an outstanding point-to-point send.
///
/// Captures the tensor to keep its storage alive and the unbound buffer
/// to synchronize on completion. The first `wait()` drives the send to
/// completion; later calls report the same terminal state.
pub struct SendWork {
    tensor: Tensor,
    buffer: UnboundBuffer,
    state: Mutex<P2pState>,
}

impl std::fmt::Debug for SendWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendWork").finish()
    }
}

impl SendWork {
    pub(crate) fn new(tensor: Tensor, buffer: UnboundBuffer) -> Arc<Self> {
        Arc::new(Self {
            tensor,
            buffer,
            state: P2pState::new(),
        })
    }
}

impl Work for SendWork {
    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().expect("work lock poisoned");
        if state.completed {
            return state.terminal();
        }
        let outcome = self.buffer.wait_send();
        state.settle(&outcome)
    }

    fn is_completed(&self) -> bool {
        self.state.lock().expect("work lock poisoned").completed
    }

    fn result(&self) -> Vec<Tensor> {
        vec![self.tensor.clone()]
    }
}

/// Handle for an outstanding point-to-point receive.
///
/// `source_rank()` reports the sender once the receive has completed.
pub struct RecvWork {
    tensor: Tensor,
    buffer: UnboundBuffer,
    state: Mutex<P2pState>,
}

impl RecvWork {
    pub(crate) fn new(tensor: Tensor, buffer: UnboundBuffer) -> Arc<Self> {
        Arc::new(Self {
            tensor,
            buffer,
            state: P2pState::new(),
        })
    }
}

impl Work for RecvWork {
    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().expect("work lock poisoned");
        if state.completed {
            return state.terminal();
        }
        let outcome = self.buffer.wait_recv().map(|_| ());
        state.settle(&outcome)
    }

    fn is_completed(&self) -> bool {
        self.state.lock().expect("work lock poisoned").completed
    }

    fn source_rank(&self) -> Option<Rank> {
        self.buffer.source_rank()
    }

    fn result(&self) -> Vec<Tensor> {
        vec![self.tensor.clone()]
    }
}

use signal::IceCandidate;
use std::collections::VecDeque;

/// Remote candidates that arrived before the remote description was applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Empties the buffer, oldest first.
    pub fn drain_in_order(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.pending.drain(..)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

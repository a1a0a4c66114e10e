//! A batch of block bodies requested together

use std::collections::HashSet;

use tessera_common::{interfaces::JobId, BlockHash, HashHeight};

use crate::PullerError;

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: JobId,
    /// Contiguous ascending run of headers whose bodies are wanted
    pub headers: Vec<HashHeight>,
    /// Bodies not yet delivered, failed or cancelled
    remaining: HashSet<BlockHash>,
}

impl DownloadJob {
    pub fn new(id: JobId, headers: Vec<HashHeight>) -> Result<Self, PullerError> {
        if headers.is_empty() {
            return Err(PullerError::EmptyJob);
        }
        if let Some(gap) = headers.windows(2).find(|w| w[1].height != w[0].height + 1) {
            return Err(PullerError::NonContiguousJob {
                after: gap[0].height,
                next: gap[1].height,
            });
        }
        let remaining = headers.iter().map(|h| h.hash).collect();
        Ok(Self {
            id,
            headers,
            remaining,
        })
    }

    /// Mark a body as finished with. Returns true when nothing is left.
    pub fn complete(&mut self, hash: &BlockHash) -> bool {
        self.remaining.remove(hash);
        self.remaining.is_empty()
    }

    pub fn is_outstanding(&self, hash: &BlockHash) -> bool {
        self.remaining.contains(hash)
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

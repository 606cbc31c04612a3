//! Error kinds and the per-rank runtime context.
//!
//! The core attempts no local recovery: errors are recorded on the rank
//! that observed them and collectively verified at the next barrier (see
//! `parallel`), after which every rank aborts the sweep.

use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum MeshError {
    /// Inconsistent dimensions, unknown boundary kind, invalid level cap.
    /// Fatal at initialization.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Duplicate key, missing neighbor, or a violated 2:1 invariant after a
    /// mutation. Indicates a bug.
    #[error("topology corrupted: {0}")]
    Topology(String),
    /// Peer-count mismatch or buffer underrun at a barrier.
    #[error("exchange failed: {0}")]
    Exchange(String),
    /// Non-finite primitive state after a conservative rebuild. Surfaced to
    /// the driver, which may abort or log.
    #[error("non-finite state: {0}")]
    Numeric(String),
}

/// Rank identity and the per-rank error list, threaded explicitly through
/// all top-level entry points.
#[derive(Debug)]
pub struct RuntimeContext {
    rank: usize,
    size: usize,
    errors: Vec<MeshError>,
}

impl RuntimeContext {
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            errors: Vec::new(),
        }
    }

    /// A single-rank context for serial runs and tests.
    pub fn serial() -> Self {
        Self::new(0, 1)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn record(&mut self, error: MeshError) {
        log::warn!("rank {}: {error}", self.rank);
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[MeshError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Local-only verification; the collective form lives with the exchange
    /// machinery.
    pub fn verify_local(&self) -> Result<(), MeshError> {
        match self.errors.first() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

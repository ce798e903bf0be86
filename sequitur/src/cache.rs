//! Cached-state collaborator contract.
//!
//! The decoding core never touches attention cache memory. It only needs
//! two guarantees from whoever owns it: cached entries can be reseated to
//! follow a beam permutation, and they can be cut back to a target length
//! when speculative tokens are rolled back. Everything else about the cache
//! (layout, device, dtype) is the owner's business.

use crate::error::Result;

/// External key/value cache kept consistent with the surviving sequences.
pub trait KvCache {
    /// Reorder cached entries so entry `i` holds what entry
    /// `beam_indices[i]` held, for the first `current_length` positions.
    /// Applied between steps whenever beam search changes beam ancestry.
    ///
    /// # Errors
    /// Returns an error if the cache cannot apply the permutation.
    fn reorder(&mut self, beam_indices: &[u32], current_length: usize) -> Result<()>;

    /// Cut cached entries back to `current_length` positions, discarding
    /// state produced for tokens that were rolled back.
    ///
    /// # Errors
    /// Returns an error if the cache cannot be resized.
    fn trim(&mut self, current_length: usize) -> Result<()>;
}

/// Cache stub for models that recompute from scratch or manage caching
/// internally without beam/rollback support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKvCache;

impl KvCache for NoKvCache {
    fn reorder(&mut self, _beam_indices: &[u32], _current_length: usize) -> Result<()> {
        Ok(())
    }

    fn trim(&mut self, _current_length: usize) -> Result<()> {
        Ok(())
    }
}

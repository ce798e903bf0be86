//! Model execution collaborator contract.
//!
//! The interface the generation driver needs from a model execution engine:
//! tokens and positions in, flat f32 scores out. Implementations own all
//! model state (weights, attention buffers, device placement); the driver
//! owns call ordering and guarantees any pending cache reorder has been
//! applied before the next forward call.

use crate::error::{Error, Result};

/// Trait for the engine that turns token inputs into per-step scores.
pub trait Model {
    /// Process the whole prompt block and return scores for the last
    /// position of every slot.
    ///
    /// # Arguments
    /// * `input_ids` - Prompt tokens of shape (`batch_beam_size`, `sequence_length`)
    /// * `sequence_length` - Length of each prompt row
    ///
    /// # Returns
    /// Flat scores of shape (`batch_beam_size`, `vocab_size`).
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    fn forward_prompt(&mut self, input_ids: &[u32], sequence_length: usize) -> Result<Vec<f32>>;

    /// Process one appended token per slot and return the next scores.
    ///
    /// # Arguments
    /// * `current_length` - Sequence length including `next_tokens`
    /// * `next_tokens` - The token appended to each slot last step
    ///
    /// # Returns
    /// Flat scores of shape (`batch_beam_size`, `vocab_size`).
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    fn forward_step(&mut self, current_length: usize, next_tokens: &[u32]) -> Result<Vec<f32>>;

    /// Process the tail of `sequence` beyond `past_length` and return scores
    /// for the final `num_scores` positions, one row per position, ending
    /// with the row conditioned on the full sequence. Used by speculative
    /// verification; batch size is 1.
    ///
    /// # Returns
    /// Flat scores of shape (`num_scores`, `vocab_size`).
    ///
    /// # Errors
    /// The default implementation reports the operation as unsupported.
    fn forward_window(
        &mut self,
        sequence: &[u32],
        num_scores: usize,
        past_length: usize,
    ) -> Result<Vec<f32>> {
        let _ = (sequence, num_scores, past_length);
        Err(Error::Unsupported("multi-position score windows"))
    }
}

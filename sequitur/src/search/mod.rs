//! Search strategies for token selection.
//!
//! All strategies share one capability surface, the [`Search`] trait, and
//! one block of bookkeeping state, [`SearchState`]: the token arena, the
//! per-step next-token buffer, and EOS/termination tracking. Strategies
//! compose the state rather than extending each other; a strategy that does
//! not implement an entry point (sampling on beam search, rollback on beam
//! search) reports it as unsupported instead of silently degrading.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{Error, Result};
use crate::logits::ScoreView;
use crate::params::GenerationParams;
use crate::sequences::Sequences;

mod beam;
mod greedy;
mod scorer;
mod speculative;

pub use beam::BeamSearch;
pub use greedy::GreedySearch;
pub use speculative::SpeculativeSearch;

/// Capability surface shared by every selection strategy.
///
/// A step is: the caller applies the penalty stage to the borrowed score
/// view, invokes exactly one selection entry point, and reads back the
/// next tokens (and, for beam search, the beam permutation) before the
/// view dies.
pub trait Search {
    /// Deterministic selection: greedy argmax, or the beam-search survivor
    /// step. Appends the chosen tokens to the sequences.
    ///
    /// # Errors
    /// Returns an error if the view shape does not match the search.
    fn select_top(&mut self, scores: &mut ScoreView<'_>) -> Result<()>;

    /// Sample from the `k` highest-scoring tokens after temperature-scaled
    /// softmax, renormalized over just those tokens.
    ///
    /// # Errors
    /// Unsupported by strategies without a sampling path.
    fn sample_top_k(&mut self, scores: &mut ScoreView<'_>, k: usize, temperature: f32) -> Result<()> {
        let _ = (scores, k, temperature);
        Err(Error::Unsupported("top-k sampling"))
    }

    /// Nucleus sampling: walk tokens in descending probability, subtracting
    /// from a uniform threshold drawn in `[0, p)`.
    ///
    /// # Errors
    /// Unsupported by strategies without a sampling path.
    fn sample_top_p(&mut self, scores: &mut ScoreView<'_>, p: f32, temperature: f32) -> Result<()> {
        let _ = (scores, p, temperature);
        Err(Error::Unsupported("top-p sampling"))
    }

    /// Top-k restriction followed by the nucleus threshold walk over the
    /// retained tokens.
    ///
    /// # Errors
    /// Unsupported by strategies without a sampling path.
    fn sample_top_k_top_p(
        &mut self,
        scores: &mut ScoreView<'_>,
        k: usize,
        p: f32,
        temperature: f32,
    ) -> Result<()> {
        let _ = (scores, k, p, temperature);
        Err(Error::Unsupported("top-k/top-p sampling"))
    }

    /// Force EOS scores to the minimum representable value while the
    /// sequences are shorter than `min_length`.
    fn apply_min_length(&self, scores: &mut ScoreView<'_>, min_length: usize);

    /// Scale the score of every distinct token already present in each
    /// slot's history: by `penalty` if negative, by `1/penalty` otherwise.
    /// A no-op at `penalty == 1.0`.
    ///
    /// # Errors
    /// Returns an error if the view has more rows than the search has slots.
    fn apply_repetition_penalty(&self, scores: &mut ScoreView<'_>, penalty: f32) -> Result<()>;

    /// The tokens chosen by the last selection, one per (batch, beam) slot.
    fn next_tokens(&self) -> &[u32];

    /// The beam permutation produced by the last selection, if this
    /// strategy reorders ancestry. Flat across batch and beam.
    fn next_indices(&self) -> Option<&[u32]> {
        None
    }

    /// Shared length of all sequences.
    fn sequence_length(&self) -> usize;

    /// The tokens of slot `index`. Beam search finalizes on first access
    /// and indexes ranked return sequences instead of live slots.
    ///
    /// # Errors
    /// Returns an error if `index` is out of range.
    fn sequence(&mut self, index: usize) -> Result<&[u32]>;

    /// Whether every batch entry is finished or `max_length` was reached.
    fn is_done(&self) -> bool;

    /// Number of batch entries that have not produced EOS.
    fn unfinished(&self) -> usize;

    /// Bulk token injection (prompt replay): walk the columns of a
    /// (`batch_size`, n) token block with the same per-column EOS and
    /// length side effects as interactive stepping.
    ///
    /// # Errors
    /// Unsupported by strategies that do not own per-batch EOS flags.
    fn set_next_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        let _ = tokens;
        Err(Error::Unsupported("bulk token injection"))
    }

    /// Roll back the last `num_tokens` tokens, revoking EOS flags set
    /// within the trimmed region.
    ///
    /// # Errors
    /// Unsupported by strategies that do not own per-batch EOS flags.
    fn drop_last_tokens(&mut self, num_tokens: usize) -> Result<()> {
        let _ = num_tokens;
        Err(Error::Unsupported("token rollback"))
    }
}

/// Bookkeeping shared by all strategies: parameters, the token arena, the
/// per-step next-token buffer, and EOS/termination state.
///
/// Invariant: `not_done_count` equals the number of batch entries whose
/// EOS flag is unset, and `done` is only set once the counter reaches zero
/// or the sequences hit `max_length`.
pub(crate) struct SearchState {
    pub(crate) params: GenerationParams,
    pub(crate) sequences: Sequences,
    pub(crate) next_tokens: Vec<u32>,
    pub(crate) eos_seen: Vec<bool>,
    pub(crate) not_done_count: usize,
    pub(crate) done: bool,
}

impl SearchState {
    pub(crate) fn new(
        params: GenerationParams,
        input_ids: &[u32],
        sequence_length: usize,
    ) -> Result<Self> {
        params.validate()?;
        let sequences = Sequences::new(
            input_ids,
            params.batch_size,
            params.num_beams,
            sequence_length,
            params.max_length,
        )?;
        let batch_beam_size = params.batch_beam_size();
        let batch_size = params.batch_size;
        Ok(Self {
            params,
            sequences,
            next_tokens: vec![0; batch_beam_size],
            eos_seen: vec![false; batch_size],
            not_done_count: batch_size,
            done: false,
        })
    }

    /// Record the chosen token for a batch entry. Seeing an EOS id sets the
    /// entry's flag and decrements the not-done counter exactly once, no
    /// matter how often EOS is produced afterwards.
    pub(crate) fn set_next_token(&mut self, batch_index: usize, token: u32) {
        self.next_tokens[batch_index] = token;
        if self.params.is_eos(token) && !self.eos_seen[batch_index] {
            self.eos_seen[batch_index] = true;
            debug!(batch = batch_index, token, "eos reached");
            self.not_done_count -= 1;
            if self.not_done_count == 0 {
                self.done = true;
            }
        }
    }

    /// Finished entries are padded, not regenerated: if the EOS flag is
    /// set, force the next token to `pad_token_id` and report true so the
    /// caller skips selection for this entry.
    pub(crate) fn pad_if_already_eos(&mut self, batch_index: usize) -> bool {
        if !self.eos_seen[batch_index] {
            return false;
        }
        self.next_tokens[batch_index] = self.params.pad_token_id;
        true
    }

    /// Push the next-token buffer into the sequences and stop hard when
    /// `max_length` is reached, independent of EOS state.
    pub(crate) fn append_next_tokens(&mut self) {
        self.sequences.append(&self.next_tokens);
        if self.sequences.current_length() == self.params.max_length {
            debug!(max_length = self.params.max_length, "max length reached");
            self.done = true;
        }
    }

    /// Beam variant of [`SearchState::append_next_tokens`]: reorder slot
    /// ancestry by `beam_indices` while appending the next-token buffer.
    pub(crate) fn append_next_tokens_permuted(&mut self, beam_indices: &[u32]) {
        self.sequences.append_permuted(beam_indices, &self.next_tokens);
        if self.sequences.current_length() == self.params.max_length {
            debug!(max_length = self.params.max_length, "max length reached");
            self.done = true;
        }
    }

    /// Inject a (`batch_size`, n) block of tokens column by column with the
    /// same side effects as interactive stepping.
    pub(crate) fn set_next_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        let batch_size = self.params.batch_size;
        if tokens.is_empty() || tokens.len() % batch_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "token block of {} not divisible into {} rows",
                tokens.len(),
                batch_size
            )));
        }
        let count = tokens.len() / batch_size;
        if self.sequences.current_length() + count > self.params.max_length {
            return Err(Error::InvalidArgument(format!(
                "{count} tokens would grow sequences past max_length {}",
                self.params.max_length
            )));
        }
        for column in 0..count {
            for batch in 0..batch_size {
                self.set_next_token(batch, tokens[batch * count + column]);
            }
            self.append_next_tokens();
        }
        Ok(())
    }

    /// Trim `num_tokens` from every slot. A batch entry whose flag is set
    /// loses it again when the trimmed region contains an EOS id; the
    /// counter is incremented at most once per entry.
    pub(crate) fn drop_last_tokens(&mut self, num_tokens: usize) -> Result<()> {
        if num_tokens == 0 {
            return Ok(());
        }
        assert!(
            num_tokens <= self.sequences.current_length(),
            "cannot drop {num_tokens} of {} tokens",
            self.sequences.current_length()
        );
        let trimmed_from = self.sequences.current_length() - num_tokens;
        let num_beams = self.params.num_beams;
        for batch in 0..self.params.batch_size {
            if !self.eos_seen[batch] {
                continue;
            }
            let mut revoked = false;
            for beam in 0..num_beams {
                let seq = self.sequences.sequence(batch * num_beams + beam)?;
                if seq[trimmed_from..].iter().any(|&t| self.params.is_eos(t)) {
                    revoked = true;
                    break;
                }
            }
            if revoked {
                self.eos_seen[batch] = false;
                self.not_done_count += 1;
                self.done = false;
                debug!(batch, "eos revoked by rollback");
            }
        }
        self.sequences.drop_last(num_tokens);
        Ok(())
    }

    pub(crate) fn apply_min_length(&self, scores: &mut ScoreView<'_>, min_length: usize) {
        if self.sequences.current_length() >= min_length {
            return;
        }
        for row in scores.rows_mut() {
            suppress_eos(row, &self.params.eos_token_ids);
        }
    }

    pub(crate) fn apply_repetition_penalty(
        &self,
        scores: &mut ScoreView<'_>,
        penalty: f32,
    ) -> Result<()> {
        #[allow(clippy::float_cmp)]
        if penalty == 1.0 {
            return Ok(());
        }
        for (slot, row) in scores.rows_mut().enumerate() {
            let sequence = self.sequences.sequence(slot)?;
            penalize_repeats(row, sequence, penalty);
        }
        Ok(())
    }
}

/// Force every EOS id's score to the lowest representable value.
pub(crate) fn suppress_eos(row: &mut [f32], eos_token_ids: &[u32]) {
    for &eos in eos_token_ids {
        row[eos as usize] = f32::MIN;
    }
}

/// Scale each distinct token of `history` once: negative scores by
/// `penalty`, non-negative by `1/penalty`. Works for either scoring sign
/// convention.
pub(crate) fn penalize_repeats(row: &mut [f32], history: &[u32], penalty: f32) {
    let unique: HashSet<u32> = history.iter().copied().collect();
    for token in unique {
        let score = row[token as usize];
        row[token as usize] = if score < 0.0 {
            score * penalty
        } else {
            score / penalty
        };
    }
}

//! Verification of drafted tokens against a target model's scores.
//!
//! The draft side proposes a run of candidate tokens; the target side scores
//! every drafted position plus one bonus position in a single pass, and
//! [`SpeculativeSearch::check_candidates`] walks those rows greedily. Every
//! position whose argmax matches the draft is accepted, the first mismatch
//! is accepted as the correction, and a fully matching draft earns the bonus
//! token for free.

use crate::error::{Error, Result};
use crate::logits::{self, ScoreView};
use crate::params::GenerationParams;
use crate::search::{penalize_repeats, suppress_eos, Search, SearchState};

/// Greedy verification over a single batch entry.
pub struct SpeculativeSearch {
    state: SearchState,
}

impl SpeculativeSearch {
    /// Build a verification search seeded with the prompt.
    ///
    /// # Errors
    /// Returns an error if the parameters are invalid or configure more
    /// than one batch entry or beam.
    pub fn new(
        params: GenerationParams,
        input_ids: &[u32],
        sequence_length: usize,
    ) -> Result<Self> {
        if params.num_beams != 1 {
            return Err(Error::InvalidArgument(
                "speculative search requires num_beams == 1".into(),
            ));
        }
        if params.batch_size != 1 {
            return Err(Error::InvalidArgument(
                "speculative search requires batch_size == 1".into(),
            ));
        }
        let state = SearchState::new(params, input_ids, sequence_length)?;
        Ok(Self { state })
    }

    /// Verify `candidates` against one score row per drafted position plus
    /// one bonus row, appending every accepted token. Returns the tokens
    /// accepted this call: the matching prefix and either the correcting
    /// token at the first mismatch or the bonus token after a full match.
    ///
    /// The penalty stage runs per row against the verified sequence as it
    /// stood when that position was scored, so a token accepted at one
    /// position is already penalized at the next.
    ///
    /// # Errors
    /// Returns an error if the view does not hold `candidates.len() + 1`
    /// rows of `vocab_size` scores.
    #[allow(clippy::float_cmp)]
    pub fn check_candidates(
        &mut self,
        scores: &mut ScoreView<'_>,
        candidates: &[u32],
    ) -> Result<&[u32]> {
        let params = &self.state.params;
        if scores.rows() != candidates.len() + 1 || scores.vocab_size() != params.vocab_size {
            return Err(Error::ShapeMismatch {
                expected: vec![candidates.len() + 1, params.vocab_size],
                got: vec![scores.rows(), scores.vocab_size()],
            });
        }

        let previous_length = self.state.sequences.current_length();
        let mut accepted = 0;
        for index in 0..=candidates.len() {
            let row = scores.row_mut(index);
            if self.state.sequences.current_length() < self.state.params.min_length {
                suppress_eos(row, &self.state.params.eos_token_ids);
            }
            if self.state.params.repetition_penalty != 1.0 {
                let history = self.state.sequences.sequence(0)?;
                penalize_repeats(row, history, self.state.params.repetition_penalty);
            }

            let token = if self.state.pad_if_already_eos(0) {
                self.state.next_tokens[0]
            } else {
                let token = logits::argmax(scores.row(index));
                self.state.set_next_token(0, token);
                token
            };
            self.state.append_next_tokens();
            accepted = index + 1;
            if self.state.done || index == candidates.len() || token != candidates[index] {
                break;
            }
        }

        let sequence = self.state.sequences.sequence(0)?;
        Ok(&sequence[previous_length..previous_length + accepted])
    }
}

impl Search for SpeculativeSearch {
    fn select_top(&mut self, scores: &mut ScoreView<'_>) -> Result<()> {
        let _ = scores;
        Err(Error::Unsupported("single-position selection"))
    }

    fn apply_min_length(&self, scores: &mut ScoreView<'_>, min_length: usize) {
        self.state.apply_min_length(scores, min_length);
    }

    fn apply_repetition_penalty(&self, scores: &mut ScoreView<'_>, penalty: f32) -> Result<()> {
        self.state.apply_repetition_penalty(scores, penalty)
    }

    fn next_tokens(&self) -> &[u32] {
        &self.state.next_tokens
    }

    fn sequence_length(&self) -> usize {
        self.state.sequences.current_length()
    }

    fn sequence(&mut self, index: usize) -> Result<&[u32]> {
        self.state.sequences.sequence(index)
    }

    fn is_done(&self) -> bool {
        self.state.done
    }

    fn unfinished(&self) -> usize {
        self.state.not_done_count
    }

    fn set_next_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        self.state.set_next_tokens(tokens)
    }

    fn drop_last_tokens(&mut self, num_tokens: usize) -> Result<()> {
        self.state.drop_last_tokens(num_tokens)
    }
}

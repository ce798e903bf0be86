//! Greedy selection and the sampling family.
//!
//! One beam per batch entry. Greedy picks the row argmax; the sampling
//! variants run a temperature-scaled softmax first and then draw with the
//! search-owned RNG, which is seeded from `random_seed` when present so
//! every draw is reproducible under test.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::logits::{self, ScoreView};
use crate::params::GenerationParams;
use crate::search::{Search, SearchState};

/// Greedy/sampling search over a single beam per batch entry.
pub struct GreedySearch {
    state: SearchState,
    rng: StdRng,
}

impl GreedySearch {
    /// Build a greedy search seeded with the prompt block.
    ///
    /// # Errors
    /// Returns an error if the parameters are invalid, configure more than
    /// one beam, or the prompt does not match its declared shape.
    pub fn new(
        params: GenerationParams,
        input_ids: &[u32],
        sequence_length: usize,
    ) -> Result<Self> {
        if params.num_beams != 1 {
            return Err(Error::InvalidArgument(
                "greedy search requires num_beams == 1".into(),
            ));
        }
        let rng = match params.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = SearchState::new(params, input_ids, sequence_length)?;
        Ok(Self { state, rng })
    }

    fn check_shape(&self, scores: &ScoreView<'_>) -> Result<()> {
        let params = &self.state.params;
        if scores.rows() != params.batch_size || scores.vocab_size() != params.vocab_size {
            return Err(Error::ShapeMismatch {
                expected: vec![params.batch_size, params.vocab_size],
                got: vec![scores.rows(), scores.vocab_size()],
            });
        }
        Ok(())
    }
}

impl Search for GreedySearch {
    fn select_top(&mut self, scores: &mut ScoreView<'_>) -> Result<()> {
        self.check_shape(scores)?;
        for batch in 0..self.state.params.batch_size {
            if self.state.pad_if_already_eos(batch) {
                continue;
            }
            let token = logits::argmax(scores.row(batch));
            self.state.set_next_token(batch, token);
        }
        self.state.append_next_tokens();
        Ok(())
    }

    fn sample_top_k(
        &mut self,
        scores: &mut ScoreView<'_>,
        k: usize,
        temperature: f32,
    ) -> Result<()> {
        self.check_shape(scores)?;
        if k == 0 {
            return Err(Error::InvalidArgument("top_k must be >= 1".into()));
        }
        for batch in 0..self.state.params.batch_size {
            if self.state.pad_if_already_eos(batch) {
                continue;
            }
            let row = scores.row_mut(batch);
            logits::softmax(row, temperature);

            let k = k.min(row.len());
            #[allow(clippy::cast_possible_truncation)]
            let mut retained: Vec<(u32, f32)> = row
                .iter()
                .copied()
                .enumerate()
                .map(|(i, p)| (i as u32, p))
                .collect();
            if k < retained.len() {
                retained.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1));
                retained.truncate(k);
            }

            // Draw from the top-k tokens' renormalized probabilities.
            let total: f32 = retained.iter().map(|(_, p)| p).sum();
            let r: f32 = self.rng.gen();
            let mut cumulative = 0.0f32;
            let mut token = retained[retained.len() - 1].0;
            for &(idx, p) in &retained {
                cumulative += p / total;
                if cumulative >= r {
                    token = idx;
                    break;
                }
            }
            self.state.set_next_token(batch, token);
        }
        self.state.append_next_tokens();
        Ok(())
    }

    fn sample_top_p(&mut self, scores: &mut ScoreView<'_>, p: f32, temperature: f32) -> Result<()> {
        self.check_shape(scores)?;
        for batch in 0..self.state.params.batch_size {
            if self.state.pad_if_already_eos(batch) {
                continue;
            }
            let row = scores.row_mut(batch);
            logits::softmax(row, temperature);

            #[allow(clippy::cast_possible_truncation)]
            let mut indices: Vec<u32> = (0..row.len() as u32).collect();
            indices.sort_by(|&a, &b| row[b as usize].total_cmp(&row[a as usize]));

            // Walk in descending probability until the threshold is spent.
            let mut threshold = self.rng.gen::<f32>() * p;
            let mut token = 0u32;
            for &idx in &indices {
                threshold -= row[idx as usize];
                if threshold > 0.0 {
                    continue;
                }
                token = idx;
                break;
            }
            self.state.set_next_token(batch, token);
        }
        self.state.append_next_tokens();
        Ok(())
    }

    fn sample_top_k_top_p(
        &mut self,
        scores: &mut ScoreView<'_>,
        k: usize,
        p: f32,
        temperature: f32,
    ) -> Result<()> {
        self.check_shape(scores)?;
        if k == 0 {
            return Err(Error::InvalidArgument("top_k must be >= 1".into()));
        }
        for batch in 0..self.state.params.batch_size {
            if self.state.pad_if_already_eos(batch) {
                continue;
            }
            let row = scores.row_mut(batch);
            logits::softmax(row, temperature);

            let k = k.min(row.len());
            #[allow(clippy::cast_possible_truncation)]
            let mut indices: Vec<u32> = (0..row.len() as u32).collect();
            if k < indices.len() {
                indices.select_nth_unstable_by(k - 1, |&a, &b| {
                    row[b as usize].total_cmp(&row[a as usize])
                });
            }
            indices[..k].sort_by(|&a, &b| row[b as usize].total_cmp(&row[a as usize]));

            // The walk may exhaust without triggering on rounding dust; the
            // k-th ranked token then stands.
            let mut threshold = self.rng.gen::<f32>() * p;
            let mut token = indices[k - 1];
            for &idx in &indices[..k] {
                threshold -= row[idx as usize];
                if threshold > 0.0 {
                    continue;
                }
                token = idx;
                break;
            }
            self.state.set_next_token(batch, token);
        }
        self.state.append_next_tokens();
        Ok(())
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

//! Beam search over `num_beams` slots per batch entry.
//!
//! Each step normalizes the scores to log-probabilities, adds the cumulative
//! score carried by each beam, ranks the best continuations per batch entry
//! (two per beam slot, plus slack for every extra end-of-sequence id) and
//! hands them to the [`BeamScorer`], which decides which beams survive and
//! which close as finished hypotheses.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::logits::{self, ScoreView};
use crate::params::GenerationParams;
use crate::search::scorer::{candidates_per_batch, BeamScorer, ScoredToken};
use crate::search::{Search, SearchState};

/// Beam search with per-batch hypothesis pools and ancestry reordering.
pub struct BeamSearch {
    state: SearchState,
    scorer: BeamScorer,
}

impl BeamSearch {
    /// Build a beam search seeded with the prompt block. The prompt is
    /// replicated across the beams of each batch entry.
    ///
    /// # Errors
    /// Returns an error if the parameters are invalid, configure fewer than
    /// two beams, or the prompt does not match its declared shape.
    pub fn new(
        params: GenerationParams,
        input_ids: &[u32],
        sequence_length: usize,
    ) -> Result<Self> {
        if params.num_beams < 2 {
            return Err(Error::InvalidArgument(
                "beam search requires num_beams >= 2".into(),
            ));
        }
        if params.vocab_size < 2 {
            return Err(Error::InvalidArgument(
                "beam search requires vocab_size >= 2".into(),
            ));
        }
        let scorer = BeamScorer::new(&params);
        let state = SearchState::new(params, input_ids, sequence_length)?;
        Ok(Self { state, scorer })
    }

    /// Close the search and rank the return sequences. Forced by the first
    /// [`Search::sequence`] access; calling it again is a no-op.
    ///
    /// # Errors
    /// Returns an error if a live slot index is out of range.
    pub fn finalize(&mut self) -> Result<()> {
        self.scorer.finalize(&self.state.sequences)
    }

    fn check_shape(&self, scores: &ScoreView<'_>) -> Result<()> {
        let params = &self.state.params;
        if scores.rows() != params.batch_beam_size() || scores.vocab_size() != params.vocab_size {
            return Err(Error::ShapeMismatch {
                expected: vec![params.batch_beam_size(), params.vocab_size],
                got: vec![scores.rows(), scores.vocab_size()],
            });
        }
        Ok(())
    }
}

impl Search for BeamSearch {
    fn select_top(&mut self, scores: &mut ScoreView<'_>) -> Result<()> {
        self.check_shape(scores)?;

        // Cumulative beam scores ride on the log-probabilities so the
        // ranking compares whole-sequence likelihoods.
        let beam_scores = self.scorer.next_scores();
        for (row, &bias) in scores.rows_mut().zip(beam_scores) {
            logits::log_softmax(row);
            for score in row.iter_mut() {
                *score += bias;
            }
        }

        let num_beams = self.state.params.num_beams;
        let vocab_size = self.state.params.vocab_size;
        let per_batch = candidates_per_batch(&self.state.params);
        let candidates: Vec<ScoredToken> = scores
            .as_slice()
            .par_chunks_exact(num_beams * vocab_size)
            .flat_map_iter(|block| top_candidates(block, per_batch, vocab_size))
            .collect();

        self.scorer.process(&self.state.sequences, &candidates)?;
        self.state.next_tokens.copy_from_slice(self.scorer.next_tokens());
        self.state
            .append_next_tokens_permuted(self.scorer.next_indices());
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

    fn next_indices(&self) -> Option<&[u32]> {
        Some(self.scorer.next_indices())
    }

    fn sequence_length(&self) -> usize {
        self.state.sequences.current_length()
    }

    fn sequence(&mut self, index: usize) -> Result<&[u32]> {
        let num_return = self.state.params.num_return_sequences;
        let total = self.state.params.batch_size * num_return;
        if index >= total {
            return Err(Error::IndexOutOfRange { index, len: total });
        }
        self.scorer.finalize(&self.state.sequences)?;
        self.scorer
            .finalized_sequence(index / num_return, index % num_return)
    }

    fn is_done(&self) -> bool {
        self.state.done || self.scorer.is_done()
    }

    fn unfinished(&self) -> usize {
        self.scorer.not_done()
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Ties rank the lower flat index higher so expansion is deterministic.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Best `count` entries of one batch's flattened (`num_beams`, `vocab_size`)
/// score block, best first. A bounded min-heap keeps the pass linear in the
/// block length.
#[allow(clippy::cast_possible_truncation)]
fn top_candidates(block: &[f32], count: usize, vocab_size: usize) -> Vec<ScoredToken> {
    let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(count);
    for (index, &score) in block.iter().enumerate() {
        let candidate = Candidate { score, index };
        if heap.len() < count {
            heap.push(Reverse(candidate));
        } else if let Some(Reverse(worst)) = heap.peek() {
            if candidate > *worst {
                heap.pop();
                heap.push(Reverse(candidate));
            }
        }
    }
    let mut ranked: Vec<Candidate> = heap.into_iter().map(|reversed| reversed.0).collect();
    ranked.sort_unstable_by(|a, b| b.cmp(a));
    ranked
        .into_iter()
        .map(|candidate| ScoredToken {
            score: candidate.score,
            token: (candidate.index % vocab_size) as u32,
            beam: candidate.index / vocab_size,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_params(num_beams: usize, max_length: usize) -> GenerationParams {
        GenerationParams {
            batch_size: 1,
            num_beams,
            vocab_size: 4,
            max_length,
            eos_token_ids: vec![3],
            ..GenerationParams::default()
        }
    }

    fn make_search(params: GenerationParams) -> BeamSearch {
        BeamSearch::new(params, &[1], 1).unwrap()
    }

    fn view(buf: &mut [f32], rows: usize) -> ScoreView<'_> {
        ScoreView::new(buf, rows, 4).unwrap()
    }

    #[test]
    fn rejects_a_single_beam() {
        let err = BeamSearch::new(make_params(1, 8), &[1], 1).err().unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn first_step_expands_only_beam_zero() {
        let mut search = make_search(make_params(2, 8));
        // Beam 1 has the highest raw scores but starts disabled, so both
        // survivors must come from beam 0.
        let mut buf = vec![0.0, 2.0, 1.0, -5.0, 10.0, 10.0, 10.0, 10.0];
        let mut scores = view(&mut buf, 2);
        search.select_top(&mut scores).unwrap();
        assert_eq!(search.next_tokens(), &[1, 2]);
        assert_eq!(search.next_indices(), Some(&[0u32, 0][..]));
        assert_eq!(search.sequence_length(), 2);
    }

    #[test]
    fn ancestry_follows_the_survivors() {
        let mut search = make_search(make_params(2, 8));
        let mut buf = vec![0.0, 2.0, 1.0, -5.0, 10.0, 10.0, 10.0, 10.0];
        search.select_top(&mut view(&mut buf, 2)).unwrap();
        // Slot 0 holds [1, 1], slot 1 holds [1, 2]. Make slot 1 produce the
        // best continuation so the slots swap ancestry.
        let mut step_two = vec![0.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, -9.0];
        search.select_top(&mut view(&mut step_two, 2)).unwrap();
        assert_eq!(search.next_tokens(), &[0, 0]);
        assert_eq!(search.next_indices(), Some(&[1u32, 0][..]));
        assert_eq!(search.state.sequences.sequence(0).unwrap(), &[1, 2, 0]);
        assert_eq!(search.state.sequences.sequence(1).unwrap(), &[1, 1, 0]);
    }

    #[test]
    fn ties_prefer_the_lower_flat_index() {
        let mut search = make_search(make_params(2, 8));
        let mut buf = vec![0.0; 8];
        search.select_top(&mut view(&mut buf, 2)).unwrap();
        assert_eq!(search.next_tokens(), &[0, 1]);
        assert_eq!(search.next_indices(), Some(&[0u32, 0][..]));
    }

    #[test]
    fn eos_survivor_closes_a_hypothesis() {
        let params = GenerationParams {
            num_return_sequences: 2,
            ..make_params(2, 8)
        };
        let mut search = make_search(params);
        // Token 3 is eos and ranks first, so it becomes a finished
        // hypothesis while tokens 1 and 0 advance the beams.
        let mut buf = vec![1.0, 3.0, 0.0, 5.0, 0.0, 0.0, 0.0, 0.0];
        search.select_top(&mut view(&mut buf, 2)).unwrap();
        assert_eq!(search.next_tokens(), &[1, 0]);
        assert!(!search.is_done());
        assert_eq!(search.unfinished(), 1);

        // The eos hypothesis kept only the prompt and outranks the live
        // beams that finalize promotes.
        assert_eq!(search.sequence(0).unwrap(), &[1]);
        assert_eq!(search.sequence(1).unwrap(), &[1, 1]);
    }

    #[test]
    fn multiple_eos_ids_cannot_starve_the_survivors() {
        let params = GenerationParams {
            batch_size: 1,
            num_beams: 2,
            vocab_size: 4,
            max_length: 8,
            eos_token_ids: vec![2, 3],
            num_return_sequences: 2,
            ..GenerationParams::default()
        };
        let mut search = BeamSearch::new(params, &[1], 1).unwrap();
        let mut buf = vec![5.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        search.select_top(&mut view(&mut buf, 2)).unwrap();
        assert_eq!(search.next_tokens(), &[0, 1]);

        // Both eos ids outscore everything in both beams. The four eos
        // candidates close a hypothesis or fall to the rank cutoff, and the
        // widened ranking still refills both slots with live tokens.
        let mut step_two = vec![0.0, 0.0, 9.0, 8.0, 0.0, 0.0, 9.0, 8.0];
        search.select_top(&mut view(&mut step_two, 2)).unwrap();
        for &token in search.next_tokens() {
            assert!(token < 2);
        }
        assert_eq!(search.sequence_length(), 3);
    }

    #[test]
    fn stops_at_max_length() {
        let mut search = make_search(make_params(2, 3));
        let mut buf = vec![0.0; 8];
        search.select_top(&mut view(&mut buf, 2)).unwrap();
        assert!(!search.is_done());
        let mut step_two = vec![0.0; 8];
        search.select_top(&mut view(&mut step_two, 2)).unwrap();
        assert!(search.is_done());
        assert_eq!(search.sequence_length(), 3);
    }

    #[test]
    fn rejects_wrong_shape() {
        let mut search = make_search(make_params(2, 8));
        let mut buf = vec![0.0; 4];
        let err = search.select_top(&mut view(&mut buf, 1)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn sampling_entry_points_are_unsupported() {
        let mut search = make_search(make_params(2, 8));
        let mut buf = vec![0.0; 8];
        let err = search
            .sample_top_k(&mut view(&mut buf, 2), 4, 1.0)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        let err = search
            .drop_last_tokens(1)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn top_candidates_rank_across_beams() {
        let block = [0.5, 0.1, 0.9, 0.9];
        let ranked = top_candidates(&block, 2, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!((ranked[0].beam, ranked[0].token), (1, 0));
        assert_eq!((ranked[1].beam, ranked[1].token), (1, 1));
        assert_eq!(ranked[0].score, 0.9);
    }

    #[test]
    fn out_of_range_return_sequence_is_rejected() {
        let mut search = make_search(make_params(2, 8));
        let mut buf = vec![0.0; 8];
        search.select_top(&mut view(&mut buf, 2)).unwrap();
        let err = search.sequence(1).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { .. }));
    }
}

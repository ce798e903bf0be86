//! Hypothesis bookkeeping for beam search.
//!
//! [`BeamScorer`] consumes the ranked candidate lists produced by the beam
//! strategy, routes end-of-sequence candidates into per-batch hypothesis
//! pools, and hands back the surviving beams (token, cumulative score and
//! source slot) for the next expansion step.

use tracing::debug;

use crate::error::{Error, Result};
use crate::params::GenerationParams;
use crate::sequences::Sequences;

/// Score used to suppress beam slots that must never win a ranking pass.
pub(crate) const BEAM_SLOT_DISABLED: f32 = -1.0e9;

/// Ranked candidates the selection stage must supply per batch element:
/// two per beam slot with a single end-of-sequence id, growing by one
/// slot's worth per extra id so closures and rank-cutoff discards can
/// never leave a beam slot unfilled. Capped at the expansion size.
pub(crate) fn candidates_per_batch(params: &GenerationParams) -> usize {
    let eos_ids = params.eos_token_ids.len().max(1);
    (params.num_beams * (1 + eos_ids)).min(params.num_beams * params.vocab_size)
}

/// One ranked expansion candidate: a token drawn from a source beam together
/// with the cumulative log-probability of the extended sequence.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScoredToken {
    pub score: f32,
    pub token: u32,
    /// Source beam within the batch entry, in `0..num_beams`.
    pub beam: usize,
}

/// A finished candidate sequence with its length-penalized score.
#[derive(Debug, Clone)]
pub(crate) struct BeamHypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
}

/// Fixed-capacity pool of the best finished hypotheses for one batch entry,
/// kept sorted worst-first so eviction and improvement checks stay cheap.
pub(crate) struct BeamHypotheses {
    pool: Vec<BeamHypothesis>,
    capacity: usize,
    length_penalty: f32,
}

impl BeamHypotheses {
    fn new(capacity: usize, length_penalty: f32) -> Self {
        Self {
            pool: Vec::with_capacity(capacity),
            capacity,
            length_penalty,
        }
    }

    /// Offer a finished sequence to the pool. Once the pool is full the worst
    /// hypothesis is evicted, or the offer is discarded if it scores lower.
    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let score = sum_logprobs / (tokens.len() as f32).powf(self.length_penalty);
        if self.pool.len() == self.capacity {
            if score <= self.pool[0].score {
                return;
            }
            self.pool.remove(0);
        }
        let at = self
            .pool
            .iter()
            .position(|h| h.score > score)
            .unwrap_or(self.pool.len());
        self.pool.insert(at, BeamHypothesis { tokens, score });
    }

    fn is_full(&self) -> bool {
        self.pool.len() == self.capacity
    }

    /// Whether a live beam with cumulative score `best_sum_logprobs` could
    /// still displace the worst pooled hypothesis at the current length.
    fn can_improve(&self, best_sum_logprobs: f32, current_length: usize) -> bool {
        let best_possible = best_sum_logprobs / (current_length as f32).powf(self.length_penalty);
        match self.pool.first() {
            Some(worst) => worst.score < best_possible,
            None => true,
        }
    }
}

/// Tracks beam scores, survivor ancestry and finished hypotheses across the
/// whole batch.
pub(crate) struct BeamScorer {
    params: GenerationParams,
    hypotheses: Vec<BeamHypotheses>,
    next_scores: Vec<f32>,
    next_tokens: Vec<u32>,
    next_indices: Vec<u32>,
    batch_done: Vec<bool>,
    not_done_count: usize,
    finalized: Option<Vec<Vec<BeamHypothesis>>>,
}

impl BeamScorer {
    pub(crate) fn new(params: &GenerationParams) -> Self {
        let batch_beam = params.batch_beam_size();
        // Only beam 0 starts live so the first expansion step cannot pick
        // duplicate survivors out of identical prompt rows.
        let mut next_scores = vec![BEAM_SLOT_DISABLED; batch_beam];
        for batch in 0..params.batch_size {
            next_scores[batch * params.num_beams] = 0.0;
        }
        Self {
            params: params.clone(),
            hypotheses: (0..params.batch_size)
                .map(|_| BeamHypotheses::new(params.num_beams, params.length_penalty))
                .collect(),
            next_scores,
            next_tokens: vec![0; batch_beam],
            next_indices: vec![0; batch_beam],
            batch_done: vec![false; params.batch_size],
            not_done_count: params.batch_size,
            finalized: None,
        }
    }

    /// Cumulative per-slot scores to add onto the next step's log-probability
    /// rows.
    pub(crate) fn next_scores(&self) -> &[f32] {
        &self.next_scores
    }

    pub(crate) fn next_tokens(&self) -> &[u32] {
        &self.next_tokens
    }

    /// Flat source-slot indices of the survivors chosen by the last
    /// [`BeamScorer::process`] call.
    pub(crate) fn next_indices(&self) -> &[u32] {
        &self.next_indices
    }

    pub(crate) fn not_done(&self) -> usize {
        self.not_done_count
    }

    pub(crate) fn is_done(&self) -> bool {
        self.not_done_count == 0
    }

    /// Consume one step's ranked candidates ([`candidates_per_batch`]
    /// entries per batch element, best first) and pick the surviving beams.
    ///
    /// End-of-sequence candidates ranked within the top `num_beams` close a
    /// hypothesis instead of surviving; lower-ranked ones are discarded.
    /// Batches that finished earlier get their slots refilled with padding
    /// anchored to their first beam so downstream reordering stays valid.
    pub(crate) fn process(
        &mut self,
        sequences: &Sequences,
        candidates: &[ScoredToken],
    ) -> Result<()> {
        let num_beams = self.params.num_beams;
        let per_batch = candidates_per_batch(&self.params);
        assert_eq!(
            candidates.len(),
            self.params.batch_size * per_batch,
            "candidate list must hold {per_batch} entries per batch"
        );
        let current_length = sequences.current_length();

        for batch in 0..self.params.batch_size {
            let base = batch * num_beams;
            if self.batch_done[batch] {
                for slot in base..base + num_beams {
                    self.next_scores[slot] = 0.0;
                    self.next_tokens[slot] = self.params.pad_token_id;
                    self.next_indices[slot] = base as u32;
                }
                continue;
            }

            let ranked = &candidates[batch * per_batch..(batch + 1) * per_batch];
            let mut survivors = 0;
            for (rank, candidate) in ranked.iter().enumerate() {
                if self.params.is_eos(candidate.token) {
                    // A finished continuation only counts while it would have
                    // been kept as a beam.
                    if rank >= num_beams {
                        continue;
                    }
                    let tokens = sequences.sequence(base + candidate.beam)?.to_vec();
                    self.hypotheses[batch].add(tokens, candidate.score);
                } else {
                    let slot = base + survivors;
                    self.next_scores[slot] = candidate.score;
                    self.next_tokens[slot] = candidate.token;
                    self.next_indices[slot] = (base + candidate.beam) as u32;
                    survivors += 1;
                }
                if survivors == num_beams {
                    break;
                }
            }
            if survivors != num_beams {
                return Err(Error::InvalidArgument(format!(
                    "ranked candidates refilled only {survivors} of {num_beams} beam slots"
                )));
            }

            if self.hypotheses[batch].is_full() {
                let best = ranked[0].score;
                if self.params.early_stopping
                    || !self.hypotheses[batch].can_improve(best, current_length)
                {
                    self.batch_done[batch] = true;
                    self.not_done_count -= 1;
                    debug!(batch, "beam batch finished");
                }
            }
        }
        Ok(())
    }

    /// Close out the search: batches still running contribute their live
    /// beams to the pool, then every pool is ranked and the top
    /// `num_return_sequences` hypotheses per batch are kept. Safe to call
    /// more than once; later calls keep the first result.
    pub(crate) fn finalize(&mut self, sequences: &Sequences) -> Result<()> {
        if self.finalized.is_some() {
            return Ok(());
        }
        let num_beams = self.params.num_beams;
        for batch in 0..self.params.batch_size {
            if self.batch_done[batch] {
                continue;
            }
            for beam in 0..num_beams {
                let slot = batch * num_beams + beam;
                let tokens = sequences.sequence(slot)?.to_vec();
                self.hypotheses[batch].add(tokens, self.next_scores[slot]);
            }
        }
        let mut finalized = Vec::with_capacity(self.params.batch_size);
        for hyps in &mut self.hypotheses {
            let mut ranked = std::mem::take(&mut hyps.pool);
            ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
            ranked.truncate(self.params.num_return_sequences);
            finalized.push(ranked);
        }
        self.finalized = Some(finalized);
        debug!("beam search finalized");
        Ok(())
    }

    /// Tokens of the `rank`-th best finalized hypothesis of `batch`.
    pub(crate) fn finalized_sequence(&self, batch: usize, rank: usize) -> Result<&[u32]> {
        let finalized = self
            .finalized
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("finalize must run first".into()))?;
        let ranked = finalized.get(batch).ok_or(Error::IndexOutOfRange {
            index: batch,
            len: self.params.batch_size,
        })?;
        let hypothesis = ranked.get(rank).ok_or(Error::IndexOutOfRange {
            index: rank,
            len: ranked.len(),
        })?;
        Ok(&hypothesis.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_params(batch_size: usize, num_beams: usize) -> GenerationParams {
        GenerationParams {
            batch_size,
            num_beams,
            vocab_size: 8,
            max_length: 16,
            eos_token_ids: vec![7],
            num_return_sequences: num_beams,
            ..GenerationParams::default()
        }
    }

    fn make_sequences(params: &GenerationParams) -> Sequences {
        let prompt: Vec<u32> = (0..params.batch_size * 2).map(|t| t as u32 + 1).collect();
        Sequences::new(
            &prompt,
            params.batch_size,
            params.num_beams,
            2,
            params.max_length,
        )
        .unwrap()
    }

    fn survivor(score: f32, token: u32, beam: usize) -> ScoredToken {
        ScoredToken { score, token, beam }
    }

    #[test]
    fn only_beam_zero_starts_live() {
        let scorer = BeamScorer::new(&make_params(2, 3));
        let scores = scorer.next_scores();
        assert_eq!(scores[0], 0.0);
        assert_eq!(scores[1], BEAM_SLOT_DISABLED);
        assert_eq!(scores[2], BEAM_SLOT_DISABLED);
        assert_eq!(scores[3], 0.0);
        assert_eq!(scores[4], BEAM_SLOT_DISABLED);
    }

    #[test]
    fn survivors_fill_slots_in_rank_order() {
        let params = make_params(1, 2);
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        let candidates = vec![
            survivor(-0.1, 4, 0),
            survivor(-0.4, 5, 0),
            survivor(-0.9, 6, 1),
            survivor(-1.3, 3, 1),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        assert_eq!(scorer.next_tokens(), &[4, 5]);
        assert_eq!(scorer.next_indices(), &[0, 0]);
        assert_eq!(scorer.next_scores(), &[-0.1, -0.4]);
        assert!(!scorer.is_done());
    }

    #[test]
    fn eos_candidate_closes_a_hypothesis() {
        let params = make_params(1, 2);
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        let candidates = vec![
            survivor(-0.1, 7, 0),
            survivor(-0.4, 5, 0),
            survivor(-0.9, 6, 0),
            survivor(-1.3, 3, 1),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        // The finished beam is skipped and the next two candidates survive.
        assert_eq!(scorer.next_tokens(), &[5, 6]);
        assert!(!scorer.is_done());

        scorer.finalize(&sequences).unwrap();
        // Hypothesis keeps the source sequence without the eos token.
        assert_eq!(scorer.finalized_sequence(0, 0).unwrap(), &[1, 2]);
    }

    #[test]
    fn low_ranked_eos_is_discarded() {
        let params = make_params(1, 2);
        let mut sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        let candidates = vec![
            survivor(-0.1, 4, 0),
            survivor(-0.4, 5, 0),
            survivor(-0.9, 7, 0),
            survivor(-1.3, 7, 1),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        sequences.append_permuted(scorer.next_indices(), scorer.next_tokens());
        scorer.finalize(&sequences).unwrap();
        // Pool was empty, so finalize promoted the two live beams instead.
        let best = scorer.finalized_sequence(0, 0).unwrap();
        assert_eq!(best, &[1, 2, 4]);
    }

    #[test]
    fn extra_eos_ids_widen_the_candidate_list() {
        let single = make_params(1, 2);
        assert_eq!(candidates_per_batch(&single), 4);

        let double = GenerationParams {
            eos_token_ids: vec![6, 7],
            ..make_params(1, 2)
        };
        assert_eq!(candidates_per_batch(&double), 6);

        // Never wider than the expansion itself.
        let tiny_vocab = GenerationParams {
            vocab_size: 2,
            eos_token_ids: vec![0, 1],
            pad_token_id: 0,
            ..make_params(1, 2)
        };
        assert_eq!(candidates_per_batch(&tiny_vocab), 4);
    }

    #[test]
    fn eos_flood_still_refills_every_slot() {
        let params = GenerationParams {
            eos_token_ids: vec![6, 7],
            ..make_params(1, 2)
        };
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        // Both eos ids dominate both beams: four closures or discards in a
        // row, and the survivors come from further down the ranking.
        let candidates = vec![
            survivor(-0.1, 7, 0),
            survivor(-0.2, 6, 0),
            survivor(-0.3, 7, 1),
            survivor(-0.4, 6, 1),
            survivor(-0.9, 4, 0),
            survivor(-1.0, 5, 1),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        assert_eq!(scorer.next_tokens(), &[4, 5]);
        assert_eq!(scorer.next_indices(), &[0, 1]);
        assert_eq!(scorer.next_scores(), &[-0.9, -1.0]);
    }

    #[test]
    fn starved_slots_error_instead_of_corrupting() {
        let params = GenerationParams {
            eos_token_ids: vec![6, 7],
            ..make_params(1, 2)
        };
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        // Every ranked candidate finishes its sequence, so no live beam can
        // be refilled; the step must fail loudly rather than decode on.
        let candidates = vec![
            survivor(-0.1, 7, 0),
            survivor(-0.2, 6, 0),
            survivor(-0.3, 7, 1),
            survivor(-0.4, 6, 1),
            survivor(-0.5, 7, 0),
            survivor(-0.6, 6, 1),
        ];
        let err = scorer.process(&sequences, &candidates).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn done_batches_get_padded_survivors() {
        let params = GenerationParams {
            early_stopping: true,
            pad_token_id: 0,
            ..make_params(2, 2)
        };
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        // Batch 0 closes both hypotheses at once; batch 1 keeps running.
        let candidates = vec![
            survivor(-0.1, 7, 0),
            survivor(-0.2, 7, 1),
            survivor(-0.9, 4, 0),
            survivor(-1.0, 5, 0),
            survivor(-0.3, 4, 0),
            survivor(-0.5, 5, 0),
            survivor(-0.9, 6, 1),
            survivor(-1.3, 3, 1),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        assert!(!scorer.is_done());
        assert_eq!(scorer.not_done(), 1);

        let step_two = vec![
            survivor(-0.4, 4, 0),
            survivor(-0.6, 5, 0),
            survivor(-0.9, 6, 1),
            survivor(-1.1, 3, 1),
            survivor(-0.8, 4, 0),
            survivor(-0.9, 5, 1),
            survivor(-1.0, 6, 0),
            survivor(-1.2, 3, 1),
        ];
        scorer.process(&sequences, &step_two).unwrap();
        assert_eq!(&scorer.next_tokens()[..2], &[0, 0]);
        assert_eq!(&scorer.next_indices()[..2], &[0, 0]);
        assert_eq!(&scorer.next_scores()[..2], &[0.0, 0.0]);
        // Batch 1 survivors are untouched by the padding.
        assert_eq!(&scorer.next_tokens()[2..], &[4, 5]);
        assert_eq!(&scorer.next_indices()[2..], &[2, 3]);
    }

    #[test]
    fn full_pool_alone_does_not_finish_without_early_stopping() {
        let params = make_params(1, 2);
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        // Both eos candidates close hypotheses, but the best live candidate
        // could still beat the worst pooled score at this length.
        let candidates = vec![
            survivor(-3.0, 7, 0),
            survivor(-3.5, 7, 1),
            survivor(-0.9, 4, 0),
            survivor(-1.0, 5, 0),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        assert!(!scorer.is_done());

        // Once no continuation can catch up, the batch closes.
        let step_two = vec![
            survivor(-9.0, 4, 0),
            survivor(-9.1, 5, 0),
            survivor(-9.2, 6, 1),
            survivor(-9.3, 3, 1),
        ];
        scorer.process(&sequences, &step_two).unwrap();
        assert!(scorer.is_done());
    }

    #[test]
    fn early_stopping_finishes_once_pool_is_full() {
        let params = GenerationParams {
            early_stopping: true,
            ..make_params(1, 2)
        };
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        let candidates = vec![
            survivor(-3.0, 7, 0),
            survivor(-3.5, 7, 1),
            survivor(-0.9, 4, 0),
            survivor(-1.0, 5, 0),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        assert!(scorer.is_done());
    }

    #[test]
    fn finalize_is_idempotent() {
        let params = make_params(1, 2);
        let sequences = make_sequences(&params);
        let mut scorer = BeamScorer::new(&params);
        let candidates = vec![
            survivor(-0.1, 4, 0),
            survivor(-0.4, 5, 0),
            survivor(-0.9, 6, 1),
            survivor(-1.3, 3, 1),
        ];
        scorer.process(&sequences, &candidates).unwrap();
        scorer.finalize(&sequences).unwrap();
        let first: Vec<u32> = scorer.finalized_sequence(0, 0).unwrap().to_vec();
        scorer.finalize(&sequences).unwrap();
        assert_eq!(scorer.finalized_sequence(0, 0).unwrap(), &first[..]);
    }

    #[test]
    fn finalize_ranks_by_length_penalized_score() {
        let params = GenerationParams {
            length_penalty: 2.0,
            ..make_params(1, 2)
        };
        let mut hyps = BeamHypotheses::new(2, params.length_penalty);
        hyps.add(vec![1, 2], -4.0);
        hyps.add(vec![1, 2, 3, 4], -8.0);
        // -4 / 2^2 = -1.0 versus -8 / 4^2 = -0.5, longer one wins.
        assert!(hyps.pool[1].tokens.len() == 4);
        assert_eq!(hyps.pool[1].score, -0.5);
    }

    #[test]
    fn pool_evicts_the_worst_hypothesis() {
        let mut hyps = BeamHypotheses::new(2, 1.0);
        hyps.add(vec![1, 2], -6.0);
        hyps.add(vec![1, 3], -2.0);
        hyps.add(vec![1, 4], -4.0);
        assert_eq!(hyps.pool.len(), 2);
        assert_eq!(hyps.pool[0].tokens, vec![1, 4]);
        assert_eq!(hyps.pool[1].tokens, vec![1, 3]);
        // A worse offer bounces off a full pool.
        hyps.add(vec![1, 5], -8.0);
        assert_eq!(hyps.pool.len(), 2);
        assert_eq!(hyps.pool[0].tokens, vec![1, 4]);
    }

    #[test]
    fn can_improve_tracks_the_worst_pooled_score() {
        let mut hyps = BeamHypotheses::new(1, 1.0);
        assert!(hyps.can_improve(-100.0, 4));
        hyps.add(vec![1, 2, 3], -3.0);
        // Best possible -2.0 / 4 = -0.5 beats the pooled -1.0.
        assert!(hyps.can_improve(-2.0, 4));
        assert!(!hyps.can_improve(-8.0, 4));
    }
}

//! Draft-and-verify generation driver.
//!
//! [`SpeculativeGenerator`] owns the target model side of speculative
//! decoding: a caller drafts a run of candidate tokens with a cheaper
//! model, and [`SpeculativeGenerator::verify`] scores every drafted
//! position plus one bonus position in a single model pass, accepting the
//! matching prefix. The caller reconciles its draft sequences against the
//! returned tokens with [`sequitur::Search::drop_last_tokens`] and
//! [`sequitur::Search::set_next_tokens`].

use tracing::debug;

use sequitur::{
    Error, GenerationParams, KvCache, Model, Result, ScoreView, Search, SpeculativeSearch,
};

/// Target-side driver for speculative decoding.
pub struct SpeculativeGenerator<M, C> {
    params: GenerationParams,
    model: M,
    cache: C,
    search: SpeculativeSearch,
    processed_length: usize,
}

impl<M: Model, C: KvCache> SpeculativeGenerator<M, C> {
    /// Build a verifying generator for a single-entry prompt.
    ///
    /// # Errors
    /// Returns an error if the parameters are invalid, configure more than
    /// one batch entry or beam, or the prompt leaves no room to generate.
    pub fn new(
        params: GenerationParams,
        model: M,
        cache: C,
        input_ids: &[u32],
        sequence_length: usize,
    ) -> Result<Self> {
        if sequence_length >= params.max_length {
            return Err(Error::InvalidArgument(format!(
                "prompt of {sequence_length} tokens leaves no room below max_length {}",
                params.max_length
            )));
        }
        let search = SpeculativeSearch::new(params.clone(), input_ids, sequence_length)?;
        Ok(Self {
            params,
            model,
            cache,
            search,
            processed_length: 0,
        })
    }

    /// Score `candidates` against the target model and accept the matching
    /// prefix. Returns the tokens appended this round: the accepted
    /// candidates plus either the correcting token at the first mismatch or
    /// the bonus token after a full match.
    ///
    /// The model scores `candidates.len() + 1` positions in one pass over
    /// the verified sequence extended with the draft; afterwards the KV
    /// cache is trimmed so only positions backed by accepted tokens
    /// survive into the next round.
    ///
    /// # Errors
    /// Returns an error if the model fails or produces a block of the
    /// wrong shape.
    pub fn verify(&mut self, candidates: &[u32]) -> Result<Vec<u32>> {
        let num_scores = candidates.len() + 1;
        let mut window = self.search.sequence(0)?.to_vec();
        window.extend_from_slice(candidates);

        let mut scores = self
            .model
            .forward_window(&window, num_scores, self.processed_length)?;
        if scores.len() != num_scores * self.params.vocab_size {
            return Err(Error::ShapeMismatch {
                expected: vec![num_scores, self.params.vocab_size],
                got: vec![scores.len()],
            });
        }

        let mut view = ScoreView::new(&mut scores, num_scores, self.params.vocab_size)?;
        let accepted = self.search.check_candidates(&mut view, candidates)?.to_vec();

        // The last accepted token was never consumed as model input, and on
        // a mismatch the cached positions beyond it belong to rejected
        // draft tokens. Either way the next round resumes one short of the
        // sequence end.
        self.processed_length = self.search.sequence_length() - 1;
        self.cache.trim(self.processed_length)?;
        debug!(
            drafted = candidates.len(),
            accepted = accepted.len(),
            length = self.search.sequence_length(),
            "speculative round"
        );
        Ok(accepted)
    }

    /// Whether the entry finished or reached `max_length`.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.search.is_done()
    }

    /// Current length of the verified sequence, prompt included.
    #[must_use]
    pub fn sequence_length(&self) -> usize {
        self.search.sequence_length()
    }

    /// The verified sequence.
    ///
    /// # Errors
    /// Returns an error if `index` is out of range.
    pub fn sequence(&mut self, index: usize) -> Result<&[u32]> {
        self.search.sequence(index)
    }
}

//! Single-model generation driver.
//!
//! The [`Generator`] steps a model, its KV cache and a search strategy in
//! lockstep. Each round is two phases: [`Generator::compute_logits`] runs
//! the model for the current position, then
//! [`Generator::generate_next_token`] applies the penalty stage and lets
//! the strategy pick the next tokens. The strategy is fixed at
//! construction from the parameters, so a generator built for sampling
//! cannot silently fall back to greedy selection.

use tracing::debug;

use sequitur::{
    BeamSearch, Error, GenerationParams, GreedySearch, KvCache, Model, Result, ScoreView, Search,
};

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Every batch entry produced an end-of-sequence token.
    Stop,
    /// The sequences reached `max_length`.
    Length,
}

/// Drives one generation run over a model and a search strategy.
pub struct Generator<M, C> {
    params: GenerationParams,
    model: M,
    cache: C,
    search: Box<dyn Search>,
    prompt: Vec<u32>,
    prompt_length: usize,
    scores: Vec<f32>,
    scores_ready: bool,
    primed: bool,
}

impl<M: Model, C: KvCache> Generator<M, C> {
    /// Build a generator for `input_ids`, a flat (`batch_size`,
    /// `sequence_length`) prompt block. Beam search is selected when
    /// `num_beams > 1`, otherwise the greedy/sampling strategy.
    ///
    /// # Errors
    /// Returns an error if the parameters are invalid, the prompt does not
    /// match its declared shape, or the prompt leaves no room to generate.
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
        let search: Box<dyn Search> = if params.num_beams > 1 {
            Box::new(BeamSearch::new(params.clone(), input_ids, sequence_length)?)
        } else {
            Box::new(GreedySearch::new(params.clone(), input_ids, sequence_length)?)
        };

        // The model sees one row per (batch, beam) slot, so the prompt is
        // replicated across beams the same way the sequences are.
        let mut prompt = Vec::with_capacity(params.batch_beam_size() * sequence_length);
        for batch in 0..params.batch_size {
            let row = &input_ids[batch * sequence_length..(batch + 1) * sequence_length];
            for _ in 0..params.num_beams {
                prompt.extend_from_slice(row);
            }
        }

        Ok(Self {
            params,
            model,
            cache,
            search,
            prompt,
            prompt_length: sequence_length,
            scores: Vec::new(),
            scores_ready: false,
            primed: false,
        })
    }

    /// Run the model for the current position and stage its scores for the
    /// selection phase. The first call feeds the whole prompt block; later
    /// calls feed the last selected tokens, reordering the KV cache first
    /// when the strategy permuted beam ancestry.
    ///
    /// # Errors
    /// Returns an error if the model fails or produces a block of the
    /// wrong shape.
    pub fn compute_logits(&mut self) -> Result<()> {
        let logits = if self.primed {
            if let Some(beam_indices) = self.search.next_indices() {
                self.cache
                    .reorder(beam_indices, self.search.sequence_length())?;
            }
            self.model
                .forward_step(self.search.sequence_length(), self.search.next_tokens())?
        } else {
            self.primed = true;
            self.model.forward_prompt(&self.prompt, self.prompt_length)?
        };

        let rows = self.params.batch_beam_size();
        if logits.len() != rows * self.params.vocab_size {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, self.params.vocab_size],
                got: vec![logits.len()],
            });
        }
        self.scores = logits;
        self.scores_ready = true;
        Ok(())
    }

    /// Apply the penalty stage to the staged scores and let the strategy
    /// select the next tokens.
    ///
    /// # Errors
    /// Returns an error if no scores are staged or selection fails.
    pub fn generate_next_token(&mut self) -> Result<()> {
        if !self.scores_ready {
            return Err(Error::InvalidArgument(
                "compute_logits must run before selecting a token".into(),
            ));
        }
        self.scores_ready = false;

        let rows = self.params.batch_beam_size();
        let mut view = ScoreView::new(&mut self.scores, rows, self.params.vocab_size)?;
        self.search.apply_min_length(&mut view, self.params.min_length);
        self.search
            .apply_repetition_penalty(&mut view, self.params.repetition_penalty)?;

        if !self.params.do_sample {
            return self.search.select_top(&mut view);
        }
        let k = self.params.top_k;
        let p = self.params.top_p;
        let temperature = self.params.temperature;
        if k > 0 && p > 0.0 && p < 1.0 {
            self.search.sample_top_k_top_p(&mut view, k, p, temperature)
        } else if k > 0 {
            self.search.sample_top_k(&mut view, k, temperature)
        } else {
            self.search.sample_top_p(&mut view, p, temperature)
        }
    }

    /// Step to completion and report why generation stopped.
    ///
    /// # Errors
    /// Returns the first error from the model or the strategy.
    pub fn run(&mut self) -> Result<FinishReason> {
        while !self.search.is_done() {
            self.compute_logits()?;
            self.generate_next_token()?;
        }
        let reason = if self.search.unfinished() == 0 {
            FinishReason::Stop
        } else {
            FinishReason::Length
        };
        debug!(
            ?reason,
            length = self.search.sequence_length(),
            "generation finished"
        );
        Ok(reason)
    }

    /// Whether every batch entry finished or `max_length` was reached.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.search.is_done()
    }

    /// The tokens selected by the last step, one per (batch, beam) slot.
    #[must_use]
    pub fn next_tokens(&self) -> &[u32] {
        self.search.next_tokens()
    }

    /// Current length of every sequence, prompt included.
    #[must_use]
    pub fn sequence_length(&self) -> usize {
        self.search.sequence_length()
    }

    /// The tokens of return sequence `index`. Beam search finalizes on the
    /// first access and indexes ranked return sequences.
    ///
    /// # Errors
    /// Returns an error if `index` is out of range.
    pub fn sequence(&mut self, index: usize) -> Result<&[u32]> {
        self.search.sequence(index)
    }
}

//! Per-(batch, beam) token storage.
//!
//! All in-flight sequences live in one fixed-capacity arena of
//! `batch_beam_size * max_length` token slots sharing a single current
//! length: every slot grows in lock-step, so there is no ragged state to
//! reconcile. Beam search reorders ancestry with [`Sequences::append_permuted`],
//! which reseats whole slots by index into a second buffer and swaps, rather
//! than shuffling per-beam containers.

use crate::error::{Error, Result};

/// Token arena for all (batch, beam) slots of one generation run.
#[derive(Debug, Clone)]
pub struct Sequences {
    buf: Vec<u32>,
    scratch: Vec<u32>,
    batch_beam_size: usize,
    max_length: usize,
    current_length: usize,
}

impl Sequences {
    /// Seed the arena from a prompt block of shape (`batch_size`,
    /// `sequence_length`), replicating each batch entry's prompt across its
    /// beams.
    ///
    /// # Errors
    /// Returns an error if the prompt block does not match the declared
    /// shape, is empty, or is longer than `max_length`.
    pub fn new(
        input_ids: &[u32],
        batch_size: usize,
        num_beams: usize,
        sequence_length: usize,
        max_length: usize,
    ) -> Result<Self> {
        if input_ids.len() != batch_size * sequence_length {
            return Err(Error::ShapeMismatch {
                expected: vec![batch_size, sequence_length],
                got: vec![input_ids.len()],
            });
        }
        if sequence_length == 0 {
            return Err(Error::InvalidArgument("prompt must not be empty".into()));
        }
        if sequence_length > max_length {
            return Err(Error::InvalidArgument(format!(
                "prompt length {sequence_length} exceeds max_length {max_length}"
            )));
        }

        let batch_beam_size = batch_size * num_beams;
        let mut buf = vec![0u32; batch_beam_size * max_length];
        for batch in 0..batch_size {
            let prompt = &input_ids[batch * sequence_length..(batch + 1) * sequence_length];
            for beam in 0..num_beams {
                let start = (batch * num_beams + beam) * max_length;
                buf[start..start + sequence_length].copy_from_slice(prompt);
            }
        }
        let scratch = buf.clone();

        Ok(Self {
            buf,
            scratch,
            batch_beam_size,
            max_length,
            current_length: sequence_length,
        })
    }

    /// Number of (batch, beam) slots.
    #[must_use]
    pub fn batch_beam_size(&self) -> usize {
        self.batch_beam_size
    }

    /// Capacity of each slot.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Shared length of every slot.
    #[must_use]
    pub fn current_length(&self) -> usize {
        self.current_length
    }

    /// The tokens of slot `index`, up to the current length.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if `index` is not a valid slot.
    pub fn sequence(&self, index: usize) -> Result<&[u32]> {
        if index >= self.batch_beam_size {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.batch_beam_size,
            });
        }
        let start = index * self.max_length;
        Ok(&self.buf[start..start + self.current_length])
    }

    /// Append one token per slot at the current length.
    ///
    /// Appending past `max_length` is a caller bug (callers gate on the
    /// search's done flag) and panics rather than corrupting the arena.
    pub fn append(&mut self, tokens: &[u32]) {
        assert_eq!(
            tokens.len(),
            self.batch_beam_size,
            "append expects one token per slot"
        );
        assert!(
            self.current_length < self.max_length,
            "append past max_length {}",
            self.max_length
        );
        for (slot, &token) in tokens.iter().enumerate() {
            self.buf[slot * self.max_length + self.current_length] = token;
        }
        self.current_length += 1;
    }

    /// Reorder slot histories by `beam_indices`, then append `tokens`.
    ///
    /// Slot `k`'s new history is slot `beam_indices[k]`'s old history; the
    /// indices are flat across batch and beam. Physical slots represent beam
    /// rank, not a fixed hypothesis, so carrying an ancestor forward is a
    /// whole-slot copy into the scratch buffer followed by a swap.
    pub fn append_permuted(&mut self, beam_indices: &[u32], tokens: &[u32]) {
        assert_eq!(
            beam_indices.len(),
            self.batch_beam_size,
            "append_permuted expects one source index per slot"
        );
        assert_eq!(
            tokens.len(),
            self.batch_beam_size,
            "append_permuted expects one token per slot"
        );
        assert!(
            self.current_length < self.max_length,
            "append past max_length {}",
            self.max_length
        );
        for (slot, (&src, &token)) in beam_indices.iter().zip(tokens).enumerate() {
            let src_start = src as usize * self.max_length;
            let dst_start = slot * self.max_length;
            self.scratch[dst_start..dst_start + self.current_length]
                .copy_from_slice(&self.buf[src_start..src_start + self.current_length]);
            self.scratch[dst_start + self.current_length] = token;
        }
        std::mem::swap(&mut self.buf, &mut self.scratch);
        self.current_length += 1;
    }

    /// Truncate every slot by `num_tokens`.
    ///
    /// The trimmed tokens stay physically present until overwritten, so a
    /// caller that re-appends the same tokens reproduces the exact arena.
    pub fn drop_last(&mut self, num_tokens: usize) {
        assert!(
            num_tokens <= self.current_length,
            "cannot drop {num_tokens} of {} tokens",
            self.current_length
        );
        self.current_length -= num_tokens;
    }
}

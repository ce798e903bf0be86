//! Borrowed score views and score-space math.
//!
//! A [`ScoreView`] wraps the flat logits buffer the model execution engine
//! produced for one step, shaped (rows, `vocab_size`) where rows is
//! `batch_size * num_beams` (or a position window for speculative
//! verification). The view is borrowed for the duration of a single step:
//! penalties and normalization mutate it in place, and it is never resized
//! or retained.

use crate::error::{Error, Result};

/// One step's scores, logically shaped (rows, `vocab_size`).
pub struct ScoreView<'a> {
    scores: &'a mut [f32],
    rows: usize,
    vocab_size: usize,
}

impl<'a> ScoreView<'a> {
    /// Wrap a flat score buffer, checking that its length matches the
    /// declared shape.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if `scores.len() != rows * vocab_size`.
    pub fn new(scores: &'a mut [f32], rows: usize, vocab_size: usize) -> Result<Self> {
        if scores.len() != rows * vocab_size {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, vocab_size],
                got: vec![scores.len()],
            });
        }
        Ok(Self {
            scores,
            rows,
            vocab_size,
        })
    }

    /// Number of rows (one per batch-beam slot or window position).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Width of each row.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Immutable view of row `index`.
    #[must_use]
    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.vocab_size;
        &self.scores[start..start + self.vocab_size]
    }

    /// Mutable view of row `index`.
    pub fn row_mut(&mut self, index: usize) -> &mut [f32] {
        let start = index * self.vocab_size;
        &mut self.scores[start..start + self.vocab_size]
    }

    /// Iterate over all rows mutably.
    pub fn rows_mut(&mut self) -> std::slice::ChunksExactMut<'_, f32> {
        self.scores.chunks_exact_mut(self.vocab_size)
    }

    /// The whole buffer, row-major.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        self.scores
    }
}

/// Index of the maximum score. Ties resolve to the lowest index.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn argmax(row: &[f32]) -> u32 {
    let mut max_idx = 0u32;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > max_val {
            max_val = v;
            max_idx = i as u32;
        }
    }
    max_idx
}

/// In-place temperature-scaled softmax.
///
/// Divides by `temperature` (1.0 is a no-op), subtracts the row maximum
/// before exponentiation, and normalizes to a probability distribution.
#[allow(clippy::float_cmp)]
pub fn softmax(row: &mut [f32], temperature: f32) {
    if temperature != 1.0 {
        for s in row.iter_mut() {
            *s /= temperature;
        }
    }
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for s in row.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    for s in row.iter_mut() {
        *s /= sum;
    }
}

/// In-place log-softmax: `x - max - ln(sum(exp(x - max)))`.
pub fn log_softmax(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|s| (s - max).exp()).sum();
    let log_sum = sum.ln();
    for s in row.iter_mut() {
        *s = *s - max - log_sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_view_rejects_wrong_shape() {
        let mut buf = vec![0.0f32; 10];
        assert!(ScoreView::new(&mut buf, 2, 4).is_err());
        assert!(ScoreView::new(&mut buf, 2, 5).is_ok());
    }

    #[test]
    fn score_view_rows_are_vocab_sized() {
        let mut buf: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let view = ScoreView::new(&mut buf, 2, 3).unwrap();
        assert_eq!(view.row(0), &[0.0, 1.0, 2.0]);
        assert_eq!(view.row(1), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn argmax_breaks_ties_to_lowest_index() {
        assert_eq!(argmax(&[0.1, 0.9, 0.9, 0.2]), 1);
        assert_eq!(argmax(&[3.0, 1.0, 2.0]), 0);
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]), 0);
    }

    #[test]
    fn softmax_normalizes() {
        let mut row = vec![1.0f32, 2.0, 3.0];
        softmax(&mut row, 1.0);
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(row[2] > row[1] && row[1] > row[0]);
    }

    #[test]
    fn low_temperature_sharpens() {
        let mut flat = vec![1.0f32, 2.0];
        let mut sharp = vec![1.0f32, 2.0];
        softmax(&mut flat, 1.0);
        softmax(&mut sharp, 0.5);
        assert!(sharp[1] > flat[1]);
    }

    #[test]
    fn log_softmax_matches_softmax_log() {
        let mut probs = vec![0.5f32, 1.5, -0.3, 2.0];
        let mut logs = probs.clone();
        softmax(&mut probs, 1.0);
        log_softmax(&mut logs);
        for (p, l) in probs.iter().zip(&logs) {
            assert!((p.ln() - l).abs() < 1e-5);
        }
    }
}

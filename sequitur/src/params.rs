//! Generation parameters
//!
//! [`GenerationParams`] is the immutable per-run configuration shared by the
//! search strategies and the runtime driver. It deserializes from JSON run
//! configs (missing fields fall back to defaults) and is validated once,
//! before any search is constructed.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Immutable configuration for one generation run.
///
/// Read-only to the decoding core. Construct it, call
/// [`GenerationParams::validate`], then hand it to a search or a generator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Number of independent batch entries decoded in lock-step.
    pub batch_size: usize,
    /// Beams per batch entry. 1 selects the greedy/sampling strategies.
    pub num_beams: usize,
    /// Vocabulary size; the width of every score row.
    pub vocab_size: usize,
    /// Hard cap on sequence length, prompt included.
    pub max_length: usize,
    /// Minimum length before an EOS token may be selected.
    pub min_length: usize,
    /// Token used to pad finished batch entries.
    pub pad_token_id: u32,
    /// End-of-sequence token ids. Empty means generation only stops at
    /// `max_length`.
    pub eos_token_ids: Vec<u32>,
    /// Repetition penalty; 1.0 disables it.
    pub repetition_penalty: f32,
    /// Exponent for length-normalized hypothesis scores in beam search.
    pub length_penalty: f32,
    /// Stop a batch entry as soon as `num_beams` hypotheses are finished,
    /// without checking whether a live beam could still do better.
    pub early_stopping: bool,
    /// Ranked sequences to retain per batch entry at finalize.
    pub num_return_sequences: usize,
    /// Seed for the sampling RNG. `None` seeds from entropy.
    pub random_seed: Option<u64>,
    /// Use the sampling strategies instead of greedy selection.
    pub do_sample: bool,
    /// Restrict sampling to the k highest-scoring tokens. 0 disables.
    pub top_k: usize,
    /// Nucleus threshold in (0, 1]. 1.0 samples the full distribution.
    pub top_p: f32,
    /// Temperature for logit scaling (higher = more random). Must be > 0.
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_beams: 1,
            vocab_size: 0,
            max_length: 128,
            min_length: 0,
            pad_token_id: 0,
            eos_token_ids: Vec::new(),
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            early_stopping: false,
            num_return_sequences: 1,
            random_seed: None,
            do_sample: false,
            top_k: 0,
            top_p: 1.0,
            temperature: 1.0,
        }
    }
}

impl GenerationParams {
    /// Load parameters from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed parameters fail validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse parameters from a JSON string.
    ///
    /// # Errors
    /// Returns an error if parsing or validation fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Check parameter consistency. Called once before a search is built;
    /// a malformed configuration never reaches the decode loop.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be >= 1".into()));
        }
        if self.num_beams == 0 {
            return Err(Error::InvalidArgument("num_beams must be >= 1".into()));
        }
        if self.vocab_size == 0 {
            return Err(Error::InvalidArgument("vocab_size must be >= 1".into()));
        }
        if self.max_length == 0 {
            return Err(Error::InvalidArgument("max_length must be >= 1".into()));
        }
        if self.min_length > self.max_length {
            return Err(Error::InvalidArgument(format!(
                "min_length {} exceeds max_length {}",
                self.min_length, self.max_length
            )));
        }
        if self.pad_token_id as usize >= self.vocab_size {
            return Err(Error::InvalidArgument(format!(
                "pad_token_id {} outside vocabulary of size {}",
                self.pad_token_id, self.vocab_size
            )));
        }
        for &eos in &self.eos_token_ids {
            if eos as usize >= self.vocab_size {
                return Err(Error::InvalidArgument(format!(
                    "eos_token_id {} outside vocabulary of size {}",
                    eos, self.vocab_size
                )));
            }
        }
        if self.repetition_penalty <= 0.0 {
            return Err(Error::InvalidArgument(
                "repetition_penalty must be > 0".into(),
            ));
        }
        if self.temperature <= 0.0 {
            return Err(Error::InvalidArgument("temperature must be > 0".into()));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(Error::InvalidArgument(
                "top_p must be in (0, 1]".into(),
            ));
        }
        if self.num_return_sequences == 0 || self.num_return_sequences > self.num_beams {
            return Err(Error::InvalidArgument(format!(
                "num_return_sequences {} must be in 1..={}",
                self.num_return_sequences, self.num_beams
            )));
        }
        if self.do_sample && self.num_beams > 1 {
            return Err(Error::InvalidArgument(
                "sampling is not supported with beam search".into(),
            ));
        }
        Ok(())
    }

    /// Total number of (batch, beam) slots.
    #[must_use]
    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.num_beams
    }

    /// Whether `token` is one of the configured EOS ids.
    #[must_use]
    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults() {
        let json = r#"{ "vocab_size": 32000, "eos_token_ids": [2] }"#;
        let params = GenerationParams::from_json(json).unwrap();

        assert_eq!(params.batch_size, 1);
        assert_eq!(params.num_beams, 1);
        assert_eq!(params.vocab_size, 32000);
        assert_eq!(params.max_length, 128);
        assert_eq!(params.eos_token_ids, vec![2]);
        assert_eq!(params.repetition_penalty, 1.0);
        assert!(!params.do_sample);
        assert_eq!(params.random_seed, None);
    }

    #[test]
    fn validate_rejects_zero_vocab() {
        let params = GenerationParams::default();
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_beam_sampling() {
        let params = GenerationParams {
            vocab_size: 16,
            num_beams: 4,
            do_sample: true,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_top_p_out_of_range() {
        let params = GenerationParams {
            vocab_size: 16,
            top_p: 0.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = GenerationParams {
            vocab_size: 16,
            top_p: 1.5,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_return_sequences_above_beams() {
        let params = GenerationParams {
            vocab_size: 16,
            num_beams: 2,
            num_return_sequences: 3,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_eos_outside_vocab() {
        let params = GenerationParams {
            vocab_size: 16,
            eos_token_ids: vec![16],
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn is_eos_checks_all_ids() {
        let params = GenerationParams {
            vocab_size: 16,
            eos_token_ids: vec![2, 7],
            ..Default::default()
        };
        assert!(params.is_eos(2));
        assert!(params.is_eos(7));
        assert!(!params.is_eos(3));
    }

    #[test]
    fn beam_config_validates() {
        let params = GenerationParams {
            vocab_size: 16,
            num_beams: 4,
            num_return_sequences: 2,
            eos_token_ids: vec![2],
            ..Default::default()
        };
        params.validate().unwrap();
        assert_eq!(params.batch_beam_size(), 4);
    }
}

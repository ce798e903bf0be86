//! Sequitur: token-generation control for autoregressive decoding
//!
//! This crate provides the search strategies, the token arena and the
//! scoring surfaces that drive a decoding loop. Model execution and
//! KV-cache management stay behind the [`Model`] and [`KvCache`] traits;
//! the generation driver lives in a separate crate.

pub mod cache;
pub mod error;
pub mod logits;
pub mod model;
pub mod params;
pub mod search;
pub mod sequences;

pub use cache::{KvCache, NoKvCache};
pub use error::{Error, Result};
pub use logits::ScoreView;
pub use model::Model;
pub use params::GenerationParams;
pub use search::{BeamSearch, GreedySearch, Search, SpeculativeSearch};
pub use sequences::Sequences;

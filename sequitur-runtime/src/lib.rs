//! Generation drivers over the sequitur decoding core.
//!
//! [`Generator`] runs one model against a greedy, sampling or beam
//! strategy; [`SpeculativeGenerator`] runs the target side of
//! draft-and-verify decoding. Both are generic over the core's
//! [`sequitur::Model`] and [`sequitur::KvCache`] traits.

pub mod generator;
pub mod speculative;

pub use generator::{FinishReason, Generator};
pub use speculative::SpeculativeGenerator;

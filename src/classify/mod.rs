//! The tiered classifier: deterministic type mapper, learned rules,
//! language model, and the selective verifier.

pub mod constants;
pub mod orchestrator;
pub mod type_mapper;
pub mod verifier;

pub use orchestrator::Classifier;

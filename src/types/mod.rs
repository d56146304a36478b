//! Core types: typed spaces, probabilities, particle sets and updater outputs

pub mod gaussian;
pub mod hypothesis;
pub mod particles;
pub mod prediction;
pub mod probability;
pub mod spaces;
pub mod transforms;

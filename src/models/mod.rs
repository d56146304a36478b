//! Model traits for particle updating
//!
//! Measurement models describe how sensor readings relate to target states;
//! resamplers restore particle diversity after weighting.

mod measurement;
mod resampler;

pub use measurement::*;
pub use resampler::*;

//! Numerical utilities for particle updating
//!
//! Stabilized linear algebra, weighted moments and SDE integration.

mod linalg;
mod sde;

pub use linalg::*;
pub use sde::*;

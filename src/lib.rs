//! pflow: particle and particle-flow measurement updaters
//!
//! Sequential Bayesian updaters that represent the posterior with weighted
//! particles.
//!
//! # Features
//!
//! - **Importance weighting**: log-domain weight updates with optional resampling
//! - **Gromov particle flow**: stochastic migration of particles along a
//!   pseudo-time homotopy from prior to posterior
//! - **Parallel Kalman branch**: particle flow combined with an EKF/UKF
//!   covariance estimate
//! - **Type Safety**: state and measurement spaces encoded in the type system

pub mod filters;
pub mod models;
pub mod types;
pub mod utils;

pub mod prelude {
    pub use crate::filters::cache::*;
    pub use crate::filters::flow::*;
    pub use crate::filters::flow_kalman::*;
    pub use crate::filters::kalman::*;
    pub use crate::filters::particle::*;
    pub use crate::filters::ukf::*;
    pub use crate::filters::Updater;
    pub use crate::models::*;
    pub use crate::types::gaussian::*;
    pub use crate::types::hypothesis::*;
    pub use crate::types::particles::*;
    pub use crate::types::prediction::*;
    pub use crate::types::probability::*;
    pub use crate::types::spaces::*;
    pub use crate::types::transforms::*;
    pub use crate::utils::*;
    pub use crate::{PflowError, Result};
}

/// Error types for the library
#[derive(Debug, Clone, PartialEq)]
pub enum PflowError {
    /// Neither the detection nor the updater provides a measurement model
    MissingMeasurementModel,
    /// A configuration value is out of range
    InvalidConfig(&'static str),
    /// Matrix is singular and cannot be inverted
    SingularMatrix,
    /// Cholesky factorization failed even after diagonal regularization
    NotPositiveDefinite,
    /// Numerical computation became unstable (non-finite or all-zero weights)
    NumericalInstability,
    /// Measurement model offers neither an observation matrix nor a Jacobian
    ModelCapability,
    /// The particle set has no particles
    EmptyParticleSet,
}

impl std::error::Error for PflowError {}

impl ::core::fmt::Display for PflowError {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        match self {
            PflowError::MissingMeasurementModel => write!(f, "No measurement model available"),
            PflowError::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),
            PflowError::SingularMatrix => write!(f, "Matrix is singular"),
            PflowError::NotPositiveDefinite => write!(f, "Matrix is not positive definite"),
            PflowError::NumericalInstability => write!(f, "Numerical instability detected"),
            PflowError::ModelCapability => {
                write!(f, "Measurement model cannot be linearized")
            }
            PflowError::EmptyParticleSet => write!(f, "Particle set is empty"),
        }
    }
}

pub type Result<T> = ::core::result::Result<T, PflowError>;

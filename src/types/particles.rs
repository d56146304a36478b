//! Weighted particle sets
//!
//! A [`ParticleState`] is a discrete approximation of a posterior density:
//! state vectors with log-domain weights, a timestamp and an optional fixed
//! covariance that overrides the sample estimate.

use ::core::hash::Hasher;
use std::collections::BTreeMap;

use nalgebra::RealField;
use num_traits::Float;

use super::gaussian::GaussianState;
use super::probability::{log_sum_exp, normalize_log_weights, Probability};
use super::spaces::{hash_scalar, StateCovariance, StateVector};
use crate::utils::{weighted_covariance, weighted_mean};
use crate::{PflowError, Result};

// ============================================================================
// Particle
// ============================================================================

/// A single weighted hypothesis of the target state.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle<T: RealField, const N: usize> {
    pub state_vector: StateVector<T, N>,
    pub weight: Probability<T>,
    /// Index of the particle this one was resampled or migrated from
    pub parent: Option<usize>,
    pub metadata: BTreeMap<String, String>,
}

impl<T: RealField + Float + Copy, const N: usize> Particle<T, N> {
    #[inline]
    pub fn new(state_vector: StateVector<T, N>, weight: Probability<T>) -> Self {
        Self {
            state_vector,
            weight,
            parent: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Same particle at a new location, recording `parent` as its origin.
    #[inline]
    pub fn moved_to(&self, state_vector: StateVector<T, N>, parent: usize) -> Self {
        Self {
            state_vector,
            weight: self.weight,
            parent: Some(parent),
            metadata: self.metadata.clone(),
        }
    }
}

// ============================================================================
// Particle State
// ============================================================================

/// A weighted particle approximation of a state density.
///
/// Particle order carries no meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleState<T: RealField, const N: usize> {
    pub particles: Vec<Particle<T, N>>,
    /// Time of validity in seconds
    pub timestamp: T,
    /// Overrides the sample covariance when set
    pub fixed_covariance: Option<StateCovariance<T, N>>,
}

/// A particle state produced by a predictor.
pub type ParticleStatePrediction<T, const N: usize> = ParticleState<T, N>;

impl<T: RealField + Float + Copy, const N: usize> ParticleState<T, N> {
    #[inline]
    pub fn new(particles: Vec<Particle<T, N>>, timestamp: T) -> Self {
        Self {
            particles,
            timestamp,
            fixed_covariance: None,
        }
    }

    /// Equally weighted particles at the given locations.
    pub fn from_state_vectors(state_vectors: Vec<StateVector<T, N>>, timestamp: T) -> Self {
        let weight = if state_vectors.is_empty() {
            Probability::zero()
        } else {
            Probability::new(T::one() / T::from_usize(state_vectors.len()).unwrap())
        };
        let particles = state_vectors
            .into_iter()
            .map(|sv| Particle::new(sv, weight))
            .collect();
        Self::new(particles, timestamp)
    }

    #[inline]
    pub fn with_fixed_covariance(mut self, covariance: StateCovariance<T, N>) -> Self {
        self.fixed_covariance = Some(covariance);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Linear weights. Individual entries may underflow to zero.
    pub fn weights(&self) -> Vec<T> {
        self.particles.iter().map(|p| p.weight.value()).collect()
    }

    pub fn log_weights(&self) -> Vec<T> {
        self.particles.iter().map(|p| p.weight.log_value()).collect()
    }

    pub fn total_weight(&self) -> Probability<T> {
        Probability::from_log(log_sum_exp(&self.log_weights()))
    }

    /// Rescales the weights in log domain so that they sum to one.
    pub fn normalize(&mut self) -> Result<()> {
        if self.is_empty() {
            return Err(PflowError::EmptyParticleSet);
        }
        let mut log_weights = self.log_weights();
        normalize_log_weights(&mut log_weights)?;
        for (particle, log_w) in self.particles.iter_mut().zip(log_weights) {
            particle.weight = Probability::from_log(log_w);
        }
        Ok(())
    }

    pub fn is_normalized(&self, tolerance: T) -> bool {
        Float::abs(self.total_weight().value() - T::one()) <= tolerance
    }

    pub fn state_vectors(&self) -> impl Iterator<Item = StateVector<T, N>> + '_ {
        self.particles.iter().map(|p| p.state_vector)
    }

    /// Weights rescaled to sum to one, without modifying the particles.
    fn normalized_weights(&self) -> Result<Vec<T>> {
        if self.is_empty() {
            return Err(PflowError::EmptyParticleSet);
        }
        let mut log_weights = self.log_weights();
        normalize_log_weights(&mut log_weights)?;
        Ok(log_weights.into_iter().map(|l| Float::exp(l)).collect())
    }

    /// Weighted mean of the particle locations.
    pub fn mean(&self) -> Result<StateVector<T, N>> {
        let weights = self.normalized_weights()?;
        Ok(StateVector::from_svector(weighted_mean(
            self.particles.iter().map(|p| p.state_vector.into_svector()),
            &weights,
        )))
    }

    /// The fixed covariance when one is set, otherwise the weighted sample
    /// covariance (population form).
    pub fn covariance(&self) -> Result<StateCovariance<T, N>> {
        if let Some(fixed) = self.fixed_covariance {
            return Ok(fixed);
        }
        let weights = self.normalized_weights()?;
        let mean = weighted_mean(
            self.particles.iter().map(|p| p.state_vector.into_svector()),
            &weights,
        );
        Ok(StateCovariance::from_matrix(weighted_covariance(
            self.particles.iter().map(|p| p.state_vector.into_svector()),
            &weights,
            &mean,
        )))
    }

    /// Moment-matched Gaussian at the same timestamp.
    pub fn gaussian_view(&self) -> Result<GaussianState<T, N>> {
        Ok(GaussianState::new(
            self.mean()?,
            self.covariance()?,
            self.timestamp,
        ))
    }

    /// Effective sample size `1 / Σ w_i²` of the normalized weights.
    pub fn effective_sample_size(&self) -> Result<T> {
        let weights = self.normalized_weights()?;
        let sum_sq = weights.iter().fold(T::zero(), |acc, &w| acc + w * w);
        Ok(T::one() / sum_sq)
    }

    /// Writes locations, log weights, timestamp and fixed covariance into a
    /// fingerprint hasher.
    pub fn hash_bits(&self, hasher: &mut dyn Hasher) {
        hasher.write_usize(self.particles.len());
        for particle in &self.particles {
            particle.state_vector.hash_bits(hasher);
            hash_scalar(hasher, particle.weight.log_value());
        }
        hash_scalar(hasher, self.timestamp);
        match &self.fixed_covariance {
            Some(cov) => {
                hasher.write_u8(1);
                cov.hash_bits(hasher);
            }
            None => hasher.write_u8(0),
        }
    }
}

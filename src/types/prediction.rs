//! Measurement predictions and state updates
//!
//! Outputs of the updaters: the predicted measurement distribution for a
//! prior, and the posterior produced from a hypothesis.

use std::sync::Arc;

use nalgebra::{RealField, SMatrix};
use num_traits::Float;

use super::gaussian::GaussianState;
use super::hypothesis::{GaussianHypothesis, ParticleHypothesis};
use super::particles::ParticleState;
use super::probability::{normalize_log_weights, Probability};
use super::spaces::{Measurement, MeasurementCovariance};
use crate::utils::{weighted_covariance, weighted_mean};
use crate::{PflowError, Result};

// ============================================================================
// Measurement Predictions
// ============================================================================

/// Particle prior mapped into measurement space.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleMeasurementPrediction<T: RealField, const M: usize> {
    /// h(x_i) for every prior particle, in prior order
    pub measurement_vectors: Vec<Measurement<T, M>>,
    /// The prior weights
    pub weights: Vec<Probability<T>>,
    /// Overrides the sample covariance when set
    pub fixed_covariance: Option<MeasurementCovariance<T, M>>,
    /// Timestamp of the prior
    pub timestamp: T,
}

impl<T: RealField + Float + Copy, const M: usize> ParticleMeasurementPrediction<T, M> {
    #[inline]
    pub fn len(&self) -> usize {
        self.measurement_vectors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.measurement_vectors.is_empty()
    }

    fn normalized_weights(&self) -> Result<Vec<T>> {
        if self.is_empty() {
            return Err(PflowError::EmptyParticleSet);
        }
        let mut log_weights: Vec<T> = self.weights.iter().map(|w| w.log_value()).collect();
        normalize_log_weights(&mut log_weights)?;
        Ok(log_weights.into_iter().map(|l| Float::exp(l)).collect())
    }

    /// Weighted mean of the predicted measurements.
    pub fn mean(&self) -> Result<Measurement<T, M>> {
        let weights = self.normalized_weights()?;
        Ok(Measurement::from_svector(weighted_mean(
            self.measurement_vectors.iter().map(|z| z.into_svector()),
            &weights,
        )))
    }

    /// The fixed covariance when one is set, otherwise the weighted sample
    /// covariance of the predicted measurements.
    pub fn covariance(&self) -> Result<MeasurementCovariance<T, M>> {
        if let Some(fixed) = self.fixed_covariance {
            return Ok(fixed);
        }
        let weights = self.normalized_weights()?;
        let mean = weighted_mean(
            self.measurement_vectors.iter().map(|z| z.into_svector()),
            &weights,
        );
        Ok(MeasurementCovariance::from_matrix(weighted_covariance(
            self.measurement_vectors.iter().map(|z| z.into_svector()),
            &weights,
            &mean,
        )))
    }
}

/// Gaussian measurement prediction from a linearized updater.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMeasurementPrediction<T: RealField, const N: usize, const M: usize> {
    /// Predicted measurement h(x̂)
    pub mean: Measurement<T, M>,
    /// Innovation covariance S
    pub covariance: MeasurementCovariance<T, M>,
    /// Cross covariance between state and measurement, P Hᵀ
    pub cross_covariance: SMatrix<T, N, M>,
    pub timestamp: T,
}

// ============================================================================
// State Updates
// ============================================================================

/// Particle posterior with a reference to the hypothesis it came from.
#[derive(Debug, Clone)]
pub struct ParticleStateUpdate<T: RealField + Float + Copy, const N: usize, const M: usize> {
    pub state: ParticleState<T, N>,
    pub hypothesis: Arc<ParticleHypothesis<T, N, M>>,
}

/// Gaussian posterior with a reference to the hypothesis it came from.
#[derive(Debug, Clone)]
pub struct GaussianStateUpdate<T: RealField + Float + Copy, const N: usize, const M: usize> {
    pub state: GaussianState<T, N>,
    pub hypothesis: Arc<GaussianHypothesis<T, N, M>>,
}

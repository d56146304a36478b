//! Measurement updaters
//!
//! # Particle Updaters
//!
//! - [`particle::ParticleUpdater`]: importance weighting with optional resampling
//! - [`flow::GromovFlowParticleUpdater`]: stochastic Gromov particle flow
//! - [`flow_kalman::GromovFlowKalmanParticleUpdater`]: particle flow with a
//!   parallel Kalman covariance estimate
//!
//! # Gaussian Updaters
//!
//! - [`kalman::ExtendedKalmanUpdater`]: linearized Kalman update
//! - [`ukf::UnscentedKalmanUpdater`]: sigma-point Kalman update

pub mod cache;
pub mod flow;
pub mod flow_kalman;
pub mod kalman;
pub mod particle;
pub mod ukf;

use std::sync::Arc;

use nalgebra::RealField;
use num_traits::Float;
use rand::RngCore;

use crate::models::SharedMeasurementModel;
use crate::types::hypothesis::{Detection, ParticleHypothesis};
use crate::types::particles::ParticleState;
use crate::types::prediction::{ParticleMeasurementPrediction, ParticleStateUpdate};
use crate::{PflowError, Result};

/// Common interface of the particle updaters.
pub trait Updater<T: RealField + Float + Copy, const N: usize, const M: usize> {
    /// Model used when a detection carries none.
    fn measurement_model(&self) -> Option<&SharedMeasurementModel<T, N, M>>;

    /// Posterior particle state for a prediction and its associated detection.
    fn update(
        &self,
        hypothesis: &Arc<ParticleHypothesis<T, N, M>>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleStateUpdate<T, N, M>>;

    /// Maps a particle prediction into measurement space.
    ///
    /// `model` overrides the updater's model for this call.
    fn predict_measurement(
        &self,
        prediction: &ParticleState<T, N>,
        model: Option<&SharedMeasurementModel<T, N, M>>,
    ) -> Result<Arc<ParticleMeasurementPrediction<T, M>>>;
}

/// The detection's own model if it has one, else the updater default.
pub fn resolve_model<'a, T, const N: usize, const M: usize>(
    detection: &'a Detection<T, N, M>,
    default: Option<&'a SharedMeasurementModel<T, N, M>>,
) -> Result<&'a SharedMeasurementModel<T, N, M>>
where
    T: RealField + Float + Copy,
{
    detection
        .measurement_model
        .as_ref()
        .or(default)
        .ok_or(PflowError::MissingMeasurementModel)
}

/// An explicitly requested model if given, else the updater default.
pub(crate) fn requested_model<'a, T, const N: usize, const M: usize>(
    requested: Option<&'a SharedMeasurementModel<T, N, M>>,
    default: Option<&'a SharedMeasurementModel<T, N, M>>,
) -> Result<&'a SharedMeasurementModel<T, N, M>>
where
    T: RealField + Float + Copy,
{
    requested.or(default).ok_or(PflowError::MissingMeasurementModel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinearGaussian;
    use crate::types::spaces::Measurement;

    #[test]
    fn test_detection_model_takes_precedence() {
        let default: SharedMeasurementModel<f64, 1, 1> = Arc::new(LinearGaussian::identity(1.0));
        let local: SharedMeasurementModel<f64, 1, 1> = Arc::new(LinearGaussian::identity(2.0));
        let detection = Detection::new(Measurement::from_array([0.0]), 0.0).with_model(local.clone());

        let resolved = resolve_model(&detection, Some(&default)).unwrap();
        assert!(Arc::ptr_eq(resolved, &local));
    }

    #[test]
    fn test_missing_model() {
        let detection = Detection::<f64, 1, 1>::new(Measurement::from_array([0.0]), 0.0);
        assert_eq!(
            resolve_model(&detection, None).unwrap_err(),
            PflowError::MissingMeasurementModel
        );
        assert_eq!(
            requested_model::<f64, 1, 1>(None, None).unwrap_err(),
            PflowError::MissingMeasurementModel
        );
    }
}

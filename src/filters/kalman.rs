//! Linearized Gaussian updaters
//!
//! The Gaussian branch of the flow-Kalman updater. A [`GaussianUpdater`]
//! turns a Gaussian prediction and a detection into a Gaussian posterior;
//! [`ExtendedKalmanUpdater`] does so by linearizing the measurement model at
//! the predicted mean.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pflow::filters::kalman::{ExtendedKalmanUpdater, GaussianUpdater};
//! use pflow::models::{PositionSensor2D, SharedMeasurementModel};
//! use pflow::types::gaussian::GaussianState;
//! use pflow::types::hypothesis::{Detection, SingleHypothesis};
//! use pflow::types::spaces::{Measurement, StateCovariance, StateVector};
//!
//! let sensor: SharedMeasurementModel<f64, 4, 2> = Arc::new(PositionSensor2D::new(1.0));
//! let updater = ExtendedKalmanUpdater::new(sensor);
//!
//! let prediction = GaussianState::new(
//!     StateVector::from_array([0.0, 0.0, 1.0, 0.0]),
//!     StateCovariance::from_diagonal(&nalgebra::vector![10.0, 10.0, 1.0, 1.0]),
//!     1.0,
//! );
//! let detection = Detection::new(Measurement::from_array([1.5, 0.2]), 1.0);
//! let hypothesis = Arc::new(SingleHypothesis::new(prediction, detection));
//!
//! let update = updater.update(&hypothesis).unwrap();
//! assert!(update.state.covariance.trace() < 22.0);
//! ```

use std::sync::Arc;

use nalgebra::RealField;
use num_traits::Float;

use super::{requested_model, resolve_model};
use crate::models::{linearize, DynMeasurementModel, SharedMeasurementModel};
use crate::types::gaussian::GaussianState;
use crate::types::hypothesis::GaussianHypothesis;
use crate::types::prediction::{GaussianMeasurementPrediction, GaussianStateUpdate};
use crate::types::transforms::{compute_innovation_covariance, compute_kalman_gain, joseph_update};
use crate::Result;

/// Updater for Gaussian predictions.
pub trait GaussianUpdater<T: RealField + Float + Copy, const N: usize, const M: usize>:
    ::core::fmt::Debug
{
    /// Model used when a detection carries none.
    fn measurement_model(&self) -> Option<&SharedMeasurementModel<T, N, M>>;

    /// Predicted measurement distribution of a Gaussian state.
    fn predict_measurement(
        &self,
        prediction: &GaussianState<T, N>,
        model: Option<&SharedMeasurementModel<T, N, M>>,
    ) -> Result<GaussianMeasurementPrediction<T, N, M>>;

    /// Gaussian posterior for a prediction and its associated detection.
    fn update(
        &self,
        hypothesis: &Arc<GaussianHypothesis<T, N, M>>,
    ) -> Result<GaussianStateUpdate<T, N, M>>;
}

/// A Gaussian updater shared with a particle updater.
pub type BoxedGaussianUpdater<T, const N: usize, const M: usize> =
    Box<dyn GaussianUpdater<T, N, M> + Send + Sync>;

// ============================================================================
// Extended Kalman Updater
// ============================================================================

/// Kalman update with the measurement model linearized at the predicted mean.
///
/// For linear models this is the standard Kalman update.
#[derive(Debug, Clone)]
pub struct ExtendedKalmanUpdater<T: RealField + Float + Copy, const N: usize, const M: usize> {
    measurement_model: Option<SharedMeasurementModel<T, N, M>>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> ExtendedKalmanUpdater<T, N, M> {
    #[inline]
    pub fn new(measurement_model: SharedMeasurementModel<T, N, M>) -> Self {
        Self {
            measurement_model: Some(measurement_model),
        }
    }

    /// Creates an updater that relies on detection-specific models.
    #[inline]
    pub fn without_model() -> Self {
        Self {
            measurement_model: None,
        }
    }

    fn linearized_prediction(
        prediction: &GaussianState<T, N>,
        model: &DynMeasurementModel<T, N, M>,
    ) -> Result<GaussianMeasurementPrediction<T, N, M>> {
        let h = linearize(model, &prediction.mean)?;
        let r = model.measurement_noise();

        Ok(GaussianMeasurementPrediction {
            mean: model.observe(&prediction.mean),
            covariance: compute_innovation_covariance(&prediction.covariance, &h, &r),
            cross_covariance: h.cross_covariance(&prediction.covariance),
            timestamp: prediction.timestamp,
        })
    }
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> GaussianUpdater<T, N, M>
    for ExtendedKalmanUpdater<T, N, M>
{
    fn measurement_model(&self) -> Option<&SharedMeasurementModel<T, N, M>> {
        self.measurement_model.as_ref()
    }

    fn predict_measurement(
        &self,
        prediction: &GaussianState<T, N>,
        model: Option<&SharedMeasurementModel<T, N, M>>,
    ) -> Result<GaussianMeasurementPrediction<T, N, M>> {
        let model = requested_model(model, self.measurement_model.as_ref())?;
        Self::linearized_prediction(prediction, model.as_ref())
    }

    /// Standard update with a Joseph-form covariance.
    ///
    /// Fails with [`crate::PflowError::SingularMatrix`] when the innovation
    /// covariance cannot be inverted even after a diagonal jitter.
    fn update(
        &self,
        hypothesis: &Arc<GaussianHypothesis<T, N, M>>,
    ) -> Result<GaussianStateUpdate<T, N, M>> {
        let detection = &hypothesis.measurement;
        let model = resolve_model(detection, self.measurement_model.as_ref())?;
        let prediction = &hypothesis.prediction;

        let h = linearize(model.as_ref(), &prediction.mean)?;
        let r = model.measurement_noise();
        let s = compute_innovation_covariance(&prediction.covariance, &h, &r);
        let gain = compute_kalman_gain(&prediction.covariance, &h, &s)?;

        let innovation = model.residual(&detection.measurement, &model.observe(&prediction.mean));
        let mean = prediction.mean + gain.correct(&innovation);
        let covariance = joseph_update(&prediction.covariance, &gain, &h, &r).symmetrized();

        Ok(GaussianStateUpdate {
            state: GaussianState::new(mean, covariance, detection.timestamp),
            hypothesis: Arc::clone(hypothesis),
        })
    }
}

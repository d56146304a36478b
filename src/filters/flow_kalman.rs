//! Gromov flow with a parallel Kalman covariance
//!
//! Particles are migrated with the Gromov flow exactly as in
//! [`GromovFlowParticleUpdater`]. Alongside, the moment-matched Gaussian of
//! the prediction is updated with a [`GaussianUpdater`], and its posterior
//! covariance replaces the sample covariance of the flowed particles.

use std::sync::Arc;

use nalgebra::RealField;
use num_traits::Float;
use rand::RngCore;

use super::cache::{prediction_key, MeasurementPredictionCache};
use super::flow::{GromovFlowConfig, GromovFlowParticleUpdater};
use super::kalman::{BoxedGaussianUpdater, ExtendedKalmanUpdater, GaussianUpdater};
use super::{requested_model, Updater};
use crate::models::SharedMeasurementModel;
use crate::types::hypothesis::{ParticleHypothesis, SingleHypothesis};
use crate::types::particles::ParticleState;
use crate::types::prediction::{ParticleMeasurementPrediction, ParticleStateUpdate};
use crate::Result;

/// Gromov flow updater whose posterior covariance comes from a Kalman update.
#[derive(Debug)]
pub struct GromovFlowKalmanParticleUpdater<T: RealField + Float + Copy, const N: usize, const M: usize>
{
    flow: GromovFlowParticleUpdater<T, N, M>,
    kalman: BoxedGaussianUpdater<T, N, M>,
    cache: MeasurementPredictionCache<ParticleMeasurementPrediction<T, M>>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize>
    GromovFlowKalmanParticleUpdater<T, N, M>
{
    /// Creates an updater with the default schedule and an
    /// [`ExtendedKalmanUpdater`] over the same model.
    pub fn new(measurement_model: SharedMeasurementModel<T, N, M>) -> Self {
        Self {
            flow: GromovFlowParticleUpdater::new(Arc::clone(&measurement_model)),
            kalman: Box::new(ExtendedKalmanUpdater::new(measurement_model)),
            cache: MeasurementPredictionCache::new(),
        }
    }

    /// Creates an updater that relies on detection-specific models.
    pub fn without_model() -> Self {
        Self {
            flow: GromovFlowParticleUpdater::without_model(),
            kalman: Box::new(ExtendedKalmanUpdater::without_model()),
            cache: MeasurementPredictionCache::new(),
        }
    }

    pub fn with_config(
        measurement_model: SharedMeasurementModel<T, N, M>,
        config: GromovFlowConfig<T>,
    ) -> Result<Self> {
        Ok(Self {
            flow: GromovFlowParticleUpdater::with_config(Arc::clone(&measurement_model), config)?,
            ..Self::new(measurement_model)
        })
    }

    /// Replaces the Gaussian branch, for example with an
    /// [`UnscentedKalmanUpdater`](super::ukf::UnscentedKalmanUpdater).
    pub fn with_kalman_updater(
        mut self,
        updater: impl GaussianUpdater<T, N, M> + Send + Sync + 'static,
    ) -> Self {
        self.kalman = Box::new(updater);
        self.cache.clear();
        self
    }

    /// Keeps up to `capacity` measurement predictions.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = MeasurementPredictionCache::with_capacity(capacity);
        self
    }

    pub fn measurement_model(&self) -> Option<&SharedMeasurementModel<T, N, M>> {
        self.flow.measurement_model()
    }

    pub fn flow(&self) -> &GromovFlowParticleUpdater<T, N, M> {
        &self.flow
    }

    pub fn kalman_updater(&self) -> &dyn GaussianUpdater<T, N, M> {
        self.kalman.as_ref()
    }

    pub fn cache(&self) -> &MeasurementPredictionCache<ParticleMeasurementPrediction<T, M>> {
        &self.cache
    }

    /// Flows the particles and attaches the Kalman posterior covariance.
    ///
    /// The particles and weights are those of the plain flow for the same
    /// RNG state. Errors from either branch are returned unchanged.
    pub fn update(
        &self,
        hypothesis: &Arc<ParticleHypothesis<T, N, M>>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleStateUpdate<T, N, M>> {
        let gaussian = hypothesis.prediction.gaussian_view()?;
        let gaussian_hypothesis = Arc::new(SingleHypothesis::new(
            gaussian,
            hypothesis.measurement.clone(),
        ));
        let kalman = self.kalman.update(&gaussian_hypothesis)?;

        let flowed = self.flow.update(hypothesis, rng)?;
        let state = flowed.state.with_fixed_covariance(kalman.state.covariance);

        log::debug!(
            "flow-kalman update: {} particles, kalman trace {}",
            state.len(),
            kalman.state.covariance.trace()
        );

        Ok(ParticleStateUpdate {
            state,
            hypothesis: Arc::clone(hypothesis),
        })
    }

    /// Particle measurement prediction carrying the Kalman innovation
    /// covariance as its fixed covariance.
    pub fn predict_measurement(
        &self,
        prediction: &ParticleState<T, N>,
        model: Option<&SharedMeasurementModel<T, N, M>>,
    ) -> Result<Arc<ParticleMeasurementPrediction<T, M>>> {
        let model = requested_model(model, self.flow.measurement_model())?;
        let key = prediction_key("flow-kalman", prediction, model);

        self.cache.get_or_compute_owned(key, Arc::clone(model), || {
            let particles = self.flow.predict_measurement(prediction, Some(model))?;
            let gaussian = self
                .kalman
                .predict_measurement(&prediction.gaussian_view()?, Some(model))?;

            Ok(ParticleMeasurementPrediction {
                fixed_covariance: Some(gaussian.covariance),
                ..(*particles).clone()
            })
        })
    }
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> Updater<T, N, M>
    for GromovFlowKalmanParticleUpdater<T, N, M>
{
    fn measurement_model(&self) -> Option<&SharedMeasurementModel<T, N, M>> {
        self.measurement_model()
    }

    fn update(
        &self,
        hypothesis: &Arc<ParticleHypothesis<T, N, M>>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleStateUpdate<T, N, M>> {
        self.update(hypothesis, rng)
    }

    fn predict_measurement(
        &self,
        prediction: &ParticleState<T, N>,
        model: Option<&SharedMeasurementModel<T, N, M>>,
    ) -> Result<Arc<ParticleMeasurementPrediction<T, M>>> {
        self.predict_measurement(prediction, model)
    }
}

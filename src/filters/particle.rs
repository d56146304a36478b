//! Importance-weighting particle updater
//!
//! Multiplies each particle weight by the measurement likelihood, working in
//! log domain so that sharp likelihoods cannot underflow the whole set, then
//! hands the result to an optional resampler.

use std::sync::Arc;

use nalgebra::RealField;
use num_traits::Float;
use rand::RngCore;

use super::cache::{prediction_key, MeasurementPredictionCache};
use super::{requested_model, resolve_model, Updater};
use crate::models::{DynMeasurementModel, Resampler, SharedMeasurementModel};
use crate::types::hypothesis::ParticleHypothesis;
use crate::types::particles::{Particle, ParticleState};
use crate::types::prediction::{ParticleMeasurementPrediction, ParticleStateUpdate};
use crate::types::probability::{normalize_log_weights, Probability};
use crate::{PflowError, Result};

/// A resampler shared with an updater.
pub type BoxedResampler<T, const N: usize> = Box<dyn Resampler<T, N> + Send + Sync>;

/// Maps every particle of `prediction` through the measurement function.
///
/// The weights are those of the prediction and the timestamp is the
/// prediction's.
pub fn predict_particle_measurement<T, const N: usize, const M: usize>(
    prediction: &ParticleState<T, N>,
    model: &DynMeasurementModel<T, N, M>,
) -> ParticleMeasurementPrediction<T, M>
where
    T: RealField + Float + Copy,
{
    ParticleMeasurementPrediction {
        measurement_vectors: prediction
            .particles
            .iter()
            .map(|p| model.observe(&p.state_vector))
            .collect(),
        weights: prediction.particles.iter().map(|p| p.weight).collect(),
        fixed_covariance: None,
        timestamp: prediction.timestamp,
    }
}

/// [`predict_particle_measurement`] through a cache.
pub(crate) fn cached_particle_measurement<T, const N: usize, const M: usize>(
    cache: &MeasurementPredictionCache<ParticleMeasurementPrediction<T, M>>,
    prediction: &ParticleState<T, N>,
    model: &SharedMeasurementModel<T, N, M>,
) -> Result<Arc<ParticleMeasurementPrediction<T, M>>>
where
    T: RealField + Float + Copy,
{
    let key = prediction_key("particle", prediction, model);
    cache.get_or_compute_owned(key, Arc::clone(model), || {
        Ok(predict_particle_measurement(prediction, model.as_ref()))
    })
}

/// Particle updater using importance weighting.
#[derive(Debug)]
pub struct ParticleUpdater<T: RealField + Float + Copy, const N: usize, const M: usize> {
    measurement_model: Option<SharedMeasurementModel<T, N, M>>,
    resampler: Option<BoxedResampler<T, N>>,
    cache: MeasurementPredictionCache<ParticleMeasurementPrediction<T, M>>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> ParticleUpdater<T, N, M> {
    /// Creates an updater with a default measurement model and no resampler.
    pub fn new(measurement_model: SharedMeasurementModel<T, N, M>) -> Self {
        Self {
            measurement_model: Some(measurement_model),
            resampler: None,
            cache: MeasurementPredictionCache::new(),
        }
    }

    /// Creates an updater that relies on detection-specific models.
    pub fn without_model() -> Self {
        Self {
            measurement_model: None,
            resampler: None,
            cache: MeasurementPredictionCache::new(),
        }
    }

    /// Runs `resampler` after every update.
    pub fn with_resampler(mut self, resampler: impl Resampler<T, N> + Send + Sync + 'static) -> Self {
        self.resampler = Some(Box::new(resampler));
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
        self.measurement_model.as_ref()
    }

    pub fn cache(&self) -> &MeasurementPredictionCache<ParticleMeasurementPrediction<T, M>> {
        &self.cache
    }

    /// Reweights the predicted particles by the likelihood of the detection.
    ///
    /// The posterior weights sum to one. Fails with
    /// [`PflowError::NumericalInstability`] when every particle has zero
    /// likelihood.
    pub fn update(
        &self,
        hypothesis: &Arc<ParticleHypothesis<T, N, M>>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleStateUpdate<T, N, M>> {
        let detection = &hypothesis.measurement;
        let model = resolve_model(detection, self.measurement_model.as_ref())?;
        let prediction = &hypothesis.prediction;
        if prediction.is_empty() {
            return Err(PflowError::EmptyParticleSet);
        }

        let mut log_weights = prediction
            .particles
            .iter()
            .map(|p| {
                model
                    .log_likelihood(&detection.measurement, &p.state_vector)
                    .map(|log_l| p.weight.log_value() + log_l)
            })
            .collect::<Result<Vec<T>>>()?;
        normalize_log_weights(&mut log_weights)?;

        let particles: Vec<Particle<T, N>> = prediction
            .particles
            .iter()
            .zip(log_weights)
            .map(|(p, log_w)| Particle {
                weight: Probability::from_log(log_w),
                ..p.clone()
            })
            .collect();
        let mut state = ParticleState::new(particles, detection.timestamp);
        let ess = state.effective_sample_size()?;

        if let Some(resampler) = &self.resampler {
            state = resampler.resample(state, rng)?;
        }

        log::debug!(
            "particle update: {} particles at t={}, ess {}",
            state.len(),
            state.timestamp,
            ess
        );

        Ok(ParticleStateUpdate {
            state,
            hypothesis: Arc::clone(hypothesis),
        })
    }

    /// Maps the prediction into measurement space, memoized per prediction and model.
    pub fn predict_measurement(
        &self,
        prediction: &ParticleState<T, N>,
        model: Option<&SharedMeasurementModel<T, N, M>>,
    ) -> Result<Arc<ParticleMeasurementPrediction<T, M>>> {
        let model = requested_model(model, self.measurement_model.as_ref())?;
        cached_particle_measurement(&self.cache, prediction, model)
    }
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> Updater<T, N, M>
    for ParticleUpdater<T, N, M>
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

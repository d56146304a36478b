//! Gromov particle flow
//!
//! Instead of reweighting, particles migrate from the prior to the posterior
//! along the homotopy `p(x | λ) ∝ p(x) p(z | x)^λ`, λ ∈ [0, 1]. Each particle
//! follows the stochastic flow
//!
//! dx = f(x, λ) dλ + L(x, λ) dW
//!
//! with the measurement model linearized at the particle's current location:
//!
//! - A = P − λ P Hᵀ (R + λ H P Hᵀ)⁻¹ H P
//! - B = A Hᵀ R⁻¹
//! - f = B (z − h(x))
//! - L Lᵀ = B H A
//!
//! `P` is the prior covariance, held fixed for the whole flow. Weights are not
//! touched, so the particle count and weights of the prior carry over.

use std::sync::Arc;

use nalgebra::{RealField, SMatrix, SVector};
use num_traits::Float;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::cache::MeasurementPredictionCache;
use super::particle::cached_particle_measurement;
use super::{requested_model, resolve_model, Updater};
use crate::models::{linearize, DynMeasurementModel, SharedMeasurementModel};
use crate::types::hypothesis::ParticleHypothesis;
use crate::types::particles::{Particle, ParticleState};
use crate::types::prediction::{ParticleMeasurementPrediction, ParticleStateUpdate};
use crate::types::spaces::{Measurement, StateVector};
use crate::utils::{
    euler_maruyama, stabilized_cholesky, FlowSchedule, DEFAULT_FLOW_STEPS, DEFAULT_STEP_GROWTH,
};
use crate::{PflowError, Result};

/// Configuration for the Gromov flow pseudo-time discretization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GromovFlowConfig<T> {
    /// Number of Euler–Maruyama steps per update
    pub num_steps: usize,
    /// Ratio between consecutive step sizes
    pub growth_base: T,
}

impl<T: RealField + Float + Copy> Default for GromovFlowConfig<T> {
    fn default() -> Self {
        Self {
            num_steps: DEFAULT_FLOW_STEPS,
            growth_base: T::from_f64(DEFAULT_STEP_GROWTH).unwrap(),
        }
    }
}

impl<T: RealField + Float + Copy> GromovFlowConfig<T> {
    pub fn new(num_steps: usize, growth_base: T) -> Self {
        Self {
            num_steps,
            growth_base,
        }
    }

    /// Builds the schedule; rejects zero steps and bases not above one.
    pub fn schedule(&self) -> Result<FlowSchedule<T>> {
        FlowSchedule::exponential(self.num_steps, self.growth_base)
    }
}

// ============================================================================
// Flow Integration
// ============================================================================

/// Quantities shared by every particle of one flow.
struct FlowContext<'a, T: RealField, const N: usize, const M: usize> {
    model: &'a DynMeasurementModel<T, N, M>,
    measurement: Measurement<T, M>,
    prior_covariance: SMatrix<T, N, N>,
    noise: SMatrix<T, M, M>,
    noise_inv: SMatrix<T, M, M>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> FlowContext<'_, T, N, M> {
    /// Drift and diffusion at `x` and pseudo-time `lambda`.
    fn coefficients(&self, x: &SVector<T, N>, lambda: T) -> Result<(SVector<T, N>, SMatrix<T, N, N>)> {
        let state = StateVector::from_svector(*x);
        let h = linearize(self.model, &state)?.into_matrix();
        let p = &self.prior_covariance;

        let ph_t = p * h.transpose();
        let s = self.noise + (h * ph_t).scale(lambda);
        let s_inv = s.try_inverse().ok_or(PflowError::SingularMatrix)?;

        let a = p - ph_t * s_inv * (h * p).scale(lambda);
        let b = a * h.transpose() * self.noise_inv;

        let residual = self
            .model
            .residual(&self.measurement, &self.model.observe(&state));
        let drift = b * residual.as_svector();
        let diffusion = stabilized_cholesky(&(b * h * a))?;

        log::trace!("flow step at λ={}: |f|={}", lambda, drift.norm());
        Ok((drift, diffusion))
    }
}

/// Migrates every particle of `prediction` through the Gromov flow for
/// `measurement`.
///
/// Each particle integrates on its own RNG stream, seeded in particle order
/// from `rng`, so the result does not depend on whether particles are
/// integrated in parallel. Returned particles keep their weights and record
/// their prior index as `parent`.
///
/// # Errors
///
/// - [`PflowError::EmptyParticleSet`] for a prediction without particles
/// - [`PflowError::SingularMatrix`] when R cannot be inverted
/// - [`PflowError::ModelCapability`] when the model cannot be linearized
pub fn gromov_flow<T, const N: usize, const M: usize>(
    prediction: &ParticleState<T, N>,
    measurement: &Measurement<T, M>,
    model: &DynMeasurementModel<T, N, M>,
    schedule: &FlowSchedule<T>,
    rng: &mut dyn RngCore,
) -> Result<Vec<Particle<T, N>>>
where
    T: RealField + Float + Copy,
{
    if prediction.is_empty() {
        return Err(PflowError::EmptyParticleSet);
    }

    let noise = model.measurement_noise().into_matrix();
    let context = FlowContext {
        model,
        measurement: *measurement,
        prior_covariance: prediction.covariance()?.into_matrix(),
        noise,
        noise_inv: noise.try_inverse().ok_or(PflowError::SingularMatrix)?,
    };

    let seeds: Vec<u64> = (0..prediction.len()).map(|_| rng.next_u64()).collect();
    let migrate = |(index, (particle, seed)): (usize, (&Particle<T, N>, &u64))| -> Result<Particle<T, N>> {
        let mut stream = StdRng::seed_from_u64(*seed);
        let end = euler_maruyama(
            schedule,
            particle.state_vector.into_svector(),
            &mut stream,
            |x, lambda| context.coefficients(x, lambda),
        )?;
        Ok(particle.moved_to(StateVector::from_svector(end), index))
    };

    #[cfg(feature = "parallel")]
    let particles = prediction
        .particles
        .par_iter()
        .zip(seeds.par_iter())
        .enumerate()
        .map(migrate)
        .collect::<Result<Vec<_>>>();

    #[cfg(not(feature = "parallel"))]
    let particles = prediction
        .particles
        .iter()
        .zip(&seeds)
        .enumerate()
        .map(migrate)
        .collect::<Result<Vec<_>>>();

    particles
}

// ============================================================================
// Gromov Flow Updater
// ============================================================================

/// Particle updater that moves particles with the Gromov flow.
#[derive(Debug)]
pub struct GromovFlowParticleUpdater<T: RealField + Float + Copy, const N: usize, const M: usize> {
    measurement_model: Option<SharedMeasurementModel<T, N, M>>,
    schedule: FlowSchedule<T>,
    cache: MeasurementPredictionCache<ParticleMeasurementPrediction<T, M>>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> GromovFlowParticleUpdater<T, N, M> {
    /// Creates an updater with the default 20-step schedule.
    pub fn new(measurement_model: SharedMeasurementModel<T, N, M>) -> Self {
        Self {
            measurement_model: Some(measurement_model),
            schedule: FlowSchedule::default(),
            cache: MeasurementPredictionCache::new(),
        }
    }

    /// Creates an updater that relies on detection-specific models.
    pub fn without_model() -> Self {
        Self {
            measurement_model: None,
            schedule: FlowSchedule::default(),
            cache: MeasurementPredictionCache::new(),
        }
    }

    /// Creates an updater with a custom schedule.
    pub fn with_config(
        measurement_model: SharedMeasurementModel<T, N, M>,
        config: GromovFlowConfig<T>,
    ) -> Result<Self> {
        Ok(Self {
            schedule: config.schedule()?,
            ..Self::new(measurement_model)
        })
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

    pub fn schedule(&self) -> &FlowSchedule<T> {
        &self.schedule
    }

    pub fn cache(&self) -> &MeasurementPredictionCache<ParticleMeasurementPrediction<T, M>> {
        &self.cache
    }

    /// Migrates the predicted particles toward the posterior of the detection.
    pub fn update(
        &self,
        hypothesis: &Arc<ParticleHypothesis<T, N, M>>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleStateUpdate<T, N, M>> {
        let detection = &hypothesis.measurement;
        let model = resolve_model(detection, self.measurement_model.as_ref())?;

        let particles = gromov_flow(
            &hypothesis.prediction,
            &detection.measurement,
            model.as_ref(),
            &self.schedule,
            rng,
        )?;
        let state = ParticleState::new(particles, detection.timestamp);

        log::debug!(
            "flow update: {} particles over {} steps at t={}",
            state.len(),
            self.schedule.num_steps(),
            state.timestamp
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
    for GromovFlowParticleUpdater<T, N, M>
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinearGaussian, MeasurementModel};
    use crate::types::hypothesis::{Detection, SingleHypothesis};
    use crate::types::probability::Probability;
    use crate::types::spaces::MeasurementCovariance;
    use crate::types::transforms::ObservationMatrix;

    /// Observes the state directly but exposes no linearization.
    #[derive(Debug)]
    struct OpaqueSensor;

    impl MeasurementModel<f64, 2, 2> for OpaqueSensor {
        fn observe(&self, state: &StateVector<f64, 2>) -> Measurement<f64, 2> {
            Measurement::from_svector(state.into_svector())
        }

        fn measurement_noise(&self) -> MeasurementCovariance<f64, 2> {
            MeasurementCovariance::identity()
        }
    }

    fn grid_prior() -> ParticleState<f64, 2> {
        let mut particles = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                let sv = StateVector::from_array([i as f64 - 1.5, j as f64 - 1.5]);
                particles.push(Particle::new(sv, Probability::new((1 + i + j) as f64)));
            }
        }
        let mut prior = ParticleState::new(particles, 0.0);
        prior.normalize().unwrap();
        prior
    }

    fn hypothesis(
        prior: ParticleState<f64, 2>,
        model: Option<SharedMeasurementModel<f64, 2, 2>>,
    ) -> Arc<ParticleHypothesis<f64, 2, 2>> {
        let mut detection = Detection::new(Measurement::from_array([1.0, -1.0]), 1.0);
        detection.measurement_model = model;
        Arc::new(SingleHypothesis::new(prior, detection))
    }

    fn identity_model() -> SharedMeasurementModel<f64, 2, 2> {
        Arc::new(LinearGaussian::identity(1.0))
    }

    #[test]
    fn test_config_defaults() {
        let config = GromovFlowConfig::<f64>::default();
        assert_eq!(config.num_steps, 20);
        assert_eq!(config.growth_base, 2.0);
        assert_eq!(config.schedule().unwrap(), FlowSchedule::default());

        let updater = GromovFlowParticleUpdater::new(identity_model());
        assert_eq!(updater.schedule(), &config.schedule().unwrap());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = GromovFlowParticleUpdater::with_config(identity_model(), GromovFlowConfig::new(0, 2.0));
        assert!(matches!(result, Err(PflowError::InvalidConfig(_))));

        let result = GromovFlowParticleUpdater::with_config(identity_model(), GromovFlowConfig::new(10, 0.5));
        assert!(matches!(result, Err(PflowError::InvalidConfig(_))));
    }

    #[test]
    fn test_flow_keeps_weights_and_records_parents() {
        let prior = grid_prior();
        let updater = GromovFlowParticleUpdater::new(identity_model());
        let mut rng = StdRng::seed_from_u64(11);

        let update = updater.update(&hypothesis(prior.clone(), None), &mut rng).unwrap();

        assert_eq!(update.state.len(), prior.len());
        assert!((update.state.timestamp - 1.0).abs() < 1e-15);
        for (i, (before, after)) in prior.particles.iter().zip(&update.state.particles).enumerate() {
            assert_eq!(before.weight, after.weight);
            assert_eq!(after.parent, Some(i));
            assert!(after.state_vector.is_finite());
        }
        assert!(update.state.fixed_covariance.is_none());
    }

    #[test]
    fn test_flow_moves_mean_toward_measurement() {
        let prior = grid_prior();
        let updater = GromovFlowParticleUpdater::new(identity_model());
        let mut rng = StdRng::seed_from_u64(5);

        let before = prior.mean().unwrap();
        let update = updater.update(&hypothesis(prior, None), &mut rng).unwrap();
        let after = update.state.mean().unwrap();

        let z = [1.0, -1.0];
        let dist = |v: &StateVector<f64, 2>| ((v.index(0) - z[0]).powi(2) + (v.index(1) - z[1]).powi(2)).sqrt();
        assert!(dist(&after) < dist(&before));
    }

    #[test]
    fn test_same_seed_same_flow() {
        let prior = grid_prior();
        let updater = GromovFlowParticleUpdater::new(identity_model());
        let hyp = hypothesis(prior, None);

        let a = updater.update(&hyp, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = updater.update(&hyp, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a.state, b.state);
    }

    #[test]
    fn test_singular_noise() {
        let model: SharedMeasurementModel<f64, 2, 2> = Arc::new(LinearGaussian::new(
            ObservationMatrix::identity(),
            MeasurementCovariance::zeros(),
        ));
        let updater = GromovFlowParticleUpdater::new(model);
        let mut rng = StdRng::seed_from_u64(0);

        assert_eq!(
            updater.update(&hypothesis(grid_prior(), None), &mut rng).unwrap_err(),
            PflowError::SingularMatrix
        );
    }

    #[test]
    fn test_model_without_linearization() {
        let updater = GromovFlowParticleUpdater::<f64, 2, 2>::without_model();
        let mut rng = StdRng::seed_from_u64(0);
        let sensor: SharedMeasurementModel<f64, 2, 2> = Arc::new(OpaqueSensor);
        let hyp = hypothesis(grid_prior(), Some(sensor));

        assert_eq!(
            updater.update(&hyp, &mut rng).unwrap_err(),
            PflowError::ModelCapability
        );
    }

    #[test]
    fn test_empty_prediction() {
        let updater = GromovFlowParticleUpdater::new(identity_model());
        let mut rng = StdRng::seed_from_u64(0);
        let hyp = hypothesis(ParticleState::new(Vec::new(), 0.0), None);

        assert_eq!(
            updater.update(&hyp, &mut rng).unwrap_err(),
            PflowError::EmptyParticleSet
        );
    }

    #[test]
    fn test_collapsed_prior_stays_put() {
        // Zero prior covariance: no drift, negligible diffusion
        let prior = ParticleState::from_state_vectors(vec![StateVector::from_array([0.5, 0.5]); 3], 0.0);
        let updater = GromovFlowParticleUpdater::new(identity_model());
        let mut rng = StdRng::seed_from_u64(9);

        let update = updater.update(&hypothesis(prior, None), &mut rng).unwrap();
        for particle in &update.state.particles {
            assert!((particle.state_vector.index(0) - 0.5).abs() < 1e-6);
            assert!((particle.state_vector.index(1) - 0.5).abs() < 1e-6);
        }
    }
}

//! Common test helpers for updater integration tests

#![allow(dead_code)]

use std::sync::Arc;

use nalgebra::{SMatrix, SVector};
use pflow::models::{LinearGaussian, SharedMeasurementModel};
use pflow::types::hypothesis::{Detection, ParticleHypothesis, SingleHypothesis};
use pflow::types::particles::ParticleState;
use pflow::types::spaces::{Measurement, StateVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Installs a test logger once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Full-state sensor with isotropic noise.
pub fn identity_model<const N: usize>(variance: f64) -> SharedMeasurementModel<f64, N, N> {
    Arc::new(LinearGaussian::identity(variance))
}

/// Equally weighted particles drawn from N(mean, covariance).
pub fn sample_gaussian_prior<const N: usize>(
    mean: [f64; N],
    covariance: SMatrix<f64, N, N>,
    count: usize,
    rng: &mut StdRng,
) -> ParticleState<f64, N> {
    let sqrt_cov = covariance
        .cholesky()
        .expect("test covariance must be positive definite")
        .l();
    let mean = SVector::<f64, N>::from(mean);

    let state_vectors = (0..count)
        .map(|_| {
            let z = SVector::<f64, N>::from_fn(|_, _| StandardNormal.sample(&mut *rng));
            StateVector::from_svector(mean + sqrt_cov * z)
        })
        .collect();
    ParticleState::from_state_vectors(state_vectors, 0.0)
}

/// Hypothesis pairing `prior` with a detection at `z`, one second later.
pub fn make_hypothesis<const N: usize, const M: usize>(
    prior: ParticleState<f64, N>,
    z: [f64; M],
) -> Arc<ParticleHypothesis<f64, N, M>> {
    Arc::new(SingleHypothesis::new(
        prior,
        Detection::new(Measurement::from_array(z), 1.0),
    ))
}

/// Weighted sample mean and per-axis variance of a particle state.
pub fn sample_moments<const N: usize>(state: &ParticleState<f64, N>) -> ([f64; N], [f64; N]) {
    let mean = state.mean().expect("non-empty state");
    let weights = state.weights();
    let total: f64 = weights.iter().sum();

    let mut m = [0.0; N];
    let mut v = [0.0; N];
    for i in 0..N {
        m[i] = *mean.index(i);
        v[i] = state
            .particles
            .iter()
            .zip(&weights)
            .map(|(p, w)| w * (p.state_vector.index(i) - m[i]).powi(2))
            .sum::<f64>()
            / total;
    }
    (m, v)
}

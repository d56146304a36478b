//! Particle resampling strategies
//!
//! Resamplers replace a degenerate weighted particle set by an equally
//! weighted one drawn in proportion to the weights. Each output particle
//! records the index of the input particle it copies in `parent`.

use ::core::fmt;

use nalgebra::RealField;
use num_traits::Float;
use rand::{Rng, RngCore};

use crate::types::particles::{Particle, ParticleState};
use crate::types::probability::{normalized_weights, Probability};
use crate::{PflowError, Result};

/// Trait for resampling strategies.
///
/// The resampler alone decides whether to resample; an implementation may
/// return its input unchanged.
pub trait Resampler<T: RealField + Float + Copy, const N: usize>: fmt::Debug {
    fn resample(
        &self,
        particles: ParticleState<T, N>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleState<T, N>>;
}

/// Linear weights of a non-empty particle set, normalized to sum to one.
fn resampling_weights<T: RealField + Float + Copy, const N: usize>(
    particles: &ParticleState<T, N>,
) -> Result<Vec<T>> {
    if particles.is_empty() {
        return Err(PflowError::EmptyParticleSet);
    }
    normalized_weights(&particles.log_weights())
}

/// Equally weighted copies of the selected source particles.
fn select<T: RealField + Float + Copy, const N: usize>(
    particles: ParticleState<T, N>,
    indices: &[usize],
) -> ParticleState<T, N> {
    let weight = Probability::new(T::one() / T::from_usize(indices.len()).unwrap());
    let selected: Vec<Particle<T, N>> = indices
        .iter()
        .map(|&j| {
            let source = &particles.particles[j];
            Particle {
                state_vector: source.state_vector,
                weight,
                parent: Some(j),
                metadata: source.metadata.clone(),
            }
        })
        .collect();

    ParticleState {
        particles: selected,
        ..particles
    }
}

// ============================================================================
// Systematic Resampling
// ============================================================================

/// O(N) systematic resampling with a single uniform draw.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystematicResampler;

impl SystematicResampler {
    /// Source index for each of `weights.len()` evenly spaced points offset by `u0 ∈ [0, 1)`.
    fn indices<T: RealField + Float + Copy>(weights: &[T], u0: T) -> Vec<usize> {
        let n = weights.len();
        let n_t = T::from_usize(n).unwrap();
        let mut indices = Vec::with_capacity(n);
        let mut cumulative = T::zero();
        let mut j = 0;
        for i in 0..n {
            let threshold = (u0 + T::from_usize(i).unwrap()) / n_t;
            while cumulative + weights[j] < threshold && j + 1 < n {
                cumulative += weights[j];
                j += 1;
            }
            indices.push(j);
        }
        indices
    }
}

impl<T: RealField + Float + Copy, const N: usize> Resampler<T, N> for SystematicResampler {
    fn resample(
        &self,
        particles: ParticleState<T, N>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleState<T, N>> {
        let weights = resampling_weights(&particles)?;
        let u0 = T::from_f64(rng.random::<f64>()).unwrap();
        let indices = Self::indices(&weights, u0);
        Ok(select(particles, &indices))
    }
}

// ============================================================================
// Multinomial Resampling
// ============================================================================

/// Classic bootstrap resampling: N independent draws from the weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultinomialResampler;

impl<T: RealField + Float + Copy, const N: usize> Resampler<T, N> for MultinomialResampler {
    fn resample(
        &self,
        particles: ParticleState<T, N>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleState<T, N>> {
        let weights = resampling_weights(&particles)?;
        let n = weights.len();

        let cdf: Vec<T> = weights
            .iter()
            .scan(T::zero(), |acc, &w| {
                *acc += w;
                Some(*acc)
            })
            .collect();

        let indices: Vec<usize> = (0..n)
            .map(|_| {
                let u = T::from_f64(rng.random::<f64>()).unwrap();
                cdf.partition_point(|&c| c <= u).min(n - 1)
            })
            .collect();

        Ok(select(particles, &indices))
    }
}

// ============================================================================
// Effective Sample Size Gate
// ============================================================================

/// Resamples with an inner resampler only when the effective sample size
/// falls below a threshold.
///
/// The default threshold is half the particle count.
#[derive(Debug, Clone)]
pub struct EssResampler<T: RealField, R = SystematicResampler> {
    threshold: Option<T>,
    inner: R,
}

impl<T: RealField + Float + Copy> Default for EssResampler<T, SystematicResampler> {
    fn default() -> Self {
        Self {
            threshold: None,
            inner: SystematicResampler,
        }
    }
}

impl<T: RealField + Float + Copy> EssResampler<T, SystematicResampler> {
    /// ESS gate around systematic resampling with the default `N/2` threshold.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: RealField + Float + Copy, R> EssResampler<T, R> {
    /// ESS gate around an arbitrary resampler with the default `N/2` threshold.
    pub fn with_inner(inner: R) -> Self {
        Self {
            threshold: None,
            inner,
        }
    }

    /// Uses a fixed ESS threshold instead of `N/2`.
    ///
    /// # Panics
    /// Panics if `threshold` is negative or NaN.
    pub fn with_threshold(mut self, threshold: T) -> Self {
        assert!(threshold >= T::zero(), "ESS threshold must be non-negative");
        self.threshold = Some(threshold);
        self
    }

    /// Threshold applied to a set of `n` particles.
    pub fn threshold_for(&self, n: usize) -> T {
        self.threshold
            .unwrap_or_else(|| T::from_usize(n).unwrap() / T::from_f64(2.0).unwrap())
    }
}

impl<T, R, const N: usize> Resampler<T, N> for EssResampler<T, R>
where
    T: RealField + Float + Copy,
    R: Resampler<T, N>,
{
    fn resample(
        &self,
        particles: ParticleState<T, N>,
        rng: &mut dyn RngCore,
    ) -> Result<ParticleState<T, N>> {
        let ess = particles.effective_sample_size()?;
        let threshold = self.threshold_for(particles.len());

        if ess < threshold {
            log::debug!("ESS {} below threshold {}, resampling", ess, threshold);
            self.inner.resample(particles, rng)
        } else {
            Ok(particles)
        }
    }
}

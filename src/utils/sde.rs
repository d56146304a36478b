//! Stochastic differential equation integration
//!
//! Pseudo-time schedules for particle flow and an Euler–Maruyama integrator
//! for `dx = f(x, λ) dλ + L(x, λ) dW`.

use nalgebra::{RealField, SMatrix, SVector};
use num_traits::Float;
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

use crate::{PflowError, Result};

/// Flow steps per update unless configured otherwise.
pub const DEFAULT_FLOW_STEPS: usize = 20;

/// Ratio between consecutive flow step sizes unless configured otherwise.
pub const DEFAULT_STEP_GROWTH: f64 = 2.0;

/// Pseudo-time discretization of the unit interval `[0, 1]`.
///
/// Steps grow geometrically, so the flow takes small steps near `λ = 0`
/// where the prior dominates and larger ones as it approaches the posterior.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSchedule<T> {
    steps: Vec<T>,
    time_steps: Vec<T>,
}

impl<T: RealField + Float + Copy> FlowSchedule<T> {
    /// Geometric schedule of `num_steps` steps, each `base` times the last.
    ///
    /// `s_0 = (b - 1) / (b^N - 1)`, `s_n = s_0 b^n`, so the steps sum to one.
    pub fn exponential(num_steps: usize, base: T) -> Result<Self> {
        if num_steps == 0 {
            return Err(PflowError::InvalidConfig("flow needs at least one step"));
        }
        if !(base > T::one()) || !Float::is_finite(base) {
            return Err(PflowError::InvalidConfig("step growth base must be finite and above one"));
        }
        let exponent = i32::try_from(num_steps)
            .map_err(|_| PflowError::InvalidConfig("too many flow steps"))?;

        let s0 = (base - T::one()) / (Float::powi(base, exponent) - T::one());
        if !(s0 > T::zero()) {
            return Err(PflowError::InvalidConfig("first flow step underflows"));
        }

        Ok(Self::geometric(num_steps, base, s0))
    }

    fn geometric(num_steps: usize, base: T, s0: T) -> Self {
        let mut steps = Vec::with_capacity(num_steps);
        let mut step = s0;
        for _ in 0..num_steps {
            steps.push(step);
            step *= base;
        }

        let mut time_steps = Vec::with_capacity(num_steps + 1);
        time_steps.push(T::zero());
        let mut elapsed = T::zero();
        for &s in &steps {
            elapsed += s;
            time_steps.push(elapsed);
        }
        // Absorb rounding so the flow ends exactly at the posterior
        time_steps[num_steps] = T::one();

        Self { steps, time_steps }
    }

    /// Step sizes `s_n`.
    pub fn steps(&self) -> &[T] {
        &self.steps
    }

    /// Cumulative pseudo-times, from `0` to `1` inclusive.
    pub fn time_steps(&self) -> &[T] {
        &self.time_steps
    }

    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    /// `(λ, Δ)` for each step: start time and width.
    pub fn intervals(&self) -> impl Iterator<Item = (T, T)> + '_ {
        self.time_steps
            .windows(2)
            .map(|w| (w[0], w[1] - w[0]))
    }
}

impl<T: RealField + Float + Copy> Default for FlowSchedule<T> {
    /// [`DEFAULT_FLOW_STEPS`] steps growing by [`DEFAULT_STEP_GROWTH`].
    fn default() -> Self {
        let base = T::from_f64(DEFAULT_STEP_GROWTH).unwrap();
        let s0 = (base - T::one()) / (Float::powi(base, DEFAULT_FLOW_STEPS as i32) - T::one());
        Self::geometric(DEFAULT_FLOW_STEPS, base, s0)
    }
}

/// Integrates `dx = f dλ + L dW` over `schedule` with the Euler–Maruyama scheme.
///
/// `coefficients(x, λ)` returns the drift `f` and diffusion `L` at the
/// current state; each step applies
///
/// x ← x + f Δ + L ΔW,   ΔW ~ N(0, Δ I)
///
/// Errors from `coefficients` abort the integration.
pub fn euler_maruyama<T, F, const D: usize>(
    schedule: &FlowSchedule<T>,
    initial: SVector<T, D>,
    rng: &mut dyn RngCore,
    mut coefficients: F,
) -> Result<SVector<T, D>>
where
    T: RealField + Float + Copy,
    F: FnMut(&SVector<T, D>, T) -> Result<(SVector<T, D>, SMatrix<T, D, D>)>,
{
    let mut state = initial;
    for (lambda, delta) in schedule.intervals() {
        let (drift, diffusion) = coefficients(&state, lambda)?;

        let scale = Float::sqrt(delta);
        let delta_w = SVector::<T, D>::from_fn(|_, _| {
            let z: f64 = StandardNormal.sample(&mut *rng);
            T::from_f64(z).unwrap() * scale
        });

        state += drift.scale(delta) + diffusion * delta_w;
    }

    if !state.iter().all(|x| Float::is_finite(*x)) {
        return Err(PflowError::NumericalInstability);
    }
    Ok(state)
}

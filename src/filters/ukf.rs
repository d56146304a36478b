//! Unscented Kalman updater
//!
//! Propagates a symmetric set of sigma points through the measurement
//! function instead of linearizing it, so no Jacobian is required.
//!
//! # Sigma Point Selection
//!
//! - χ₀ = μ (mean)
//! - χᵢ = μ + √((n+λ)P)ᵢ for i = 1...n
//! - χᵢ₊ₙ = μ - √((n+λ)P)ᵢ for i = 1...n
//!
//! where λ = α²(n+κ) - n is the scaling parameter.

use std::sync::Arc;

use nalgebra::{RealField, SMatrix, SVector};
use num_traits::Float;

use super::kalman::GaussianUpdater;
use super::{requested_model, resolve_model};
use crate::models::{DynMeasurementModel, SharedMeasurementModel};
use crate::types::gaussian::GaussianState;
use crate::types::hypothesis::GaussianHypothesis;
use crate::types::prediction::{GaussianMeasurementPrediction, GaussianStateUpdate};
use crate::types::spaces::{Measurement, MeasurementCovariance, StateCovariance, StateVector};
use crate::utils::{stabilized_cholesky, stabilized_inverse};
use crate::{PflowError, Result};

// ============================================================================
// UKF Parameters
// ============================================================================

/// Parameters controlling the sigma point spread and weighting.
///
/// # Common Parameter Choices
///
/// - **Van der Merwe**: α=1e-3, β=2, κ=0 (the default)
/// - **Scaled UKF**: α=1, β=2, κ=3-n
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UkfParams<T: RealField> {
    /// Primary scaling parameter; smaller α keeps sigma points closer to the mean
    pub alpha: T,
    /// Prior knowledge of the distribution; 2 is optimal for Gaussians
    pub beta: T,
    /// Tertiary scaling parameter
    pub kappa: T,
}

impl<T: RealField + Float> Default for UkfParams<T> {
    fn default() -> Self {
        Self {
            alpha: T::from_f64(1e-3).unwrap(),
            beta: T::from_f64(2.0).unwrap(),
            kappa: T::zero(),
        }
    }
}

impl<T: RealField + Float + Copy> UkfParams<T> {
    /// # Panics
    /// Panics if α ≤ 0.
    pub fn new(alpha: T, beta: T, kappa: T) -> Self {
        assert!(alpha > T::zero(), "Alpha must be positive");
        Self { alpha, beta, kappa }
    }

    /// λ = α²(n + κ) - n
    #[inline]
    fn lambda(&self, n: usize) -> T {
        let n_t = T::from_usize(n).unwrap();
        self.alpha * self.alpha * (n_t + self.kappa) - n_t
    }

    /// γ = √(n + λ)
    #[inline]
    fn gamma(&self, n: usize) -> T {
        let n_t = T::from_usize(n).unwrap();
        Float::sqrt(n_t + self.lambda(n))
    }

    #[inline]
    fn weight_mean_0(&self, n: usize) -> T {
        let n_t = T::from_usize(n).unwrap();
        self.lambda(n) / (n_t + self.lambda(n))
    }

    #[inline]
    fn weight_cov_0(&self, n: usize) -> T {
        self.weight_mean_0(n) + (T::one() - self.alpha * self.alpha + self.beta)
    }

    /// Weight of every non-central point, for both mean and covariance.
    #[inline]
    fn weight_i(&self, n: usize) -> T {
        let n_t = T::from_usize(n).unwrap();
        T::one() / (T::from_f64(2.0).unwrap() * (n_t + self.lambda(n)))
    }
}

// ============================================================================
// Sigma Points
// ============================================================================

/// The 2n+1 sigma points of a Gaussian state with their weights.
#[derive(Debug, Clone)]
pub struct SigmaPoints<T: RealField, const N: usize> {
    /// [χ₀, χ₁, ..., χ₂ₙ]
    pub points: Vec<StateVector<T, N>>,
    pub weight_mean_0: T,
    pub weight_cov_0: T,
    pub weight_i: T,
}

impl<T: RealField + Float + Copy, const N: usize> SigmaPoints<T, N> {
    /// Symmetric sigma points around the mean of `state`.
    ///
    /// Fails with [`PflowError::NotPositiveDefinite`] when the covariance has
    /// no square root.
    pub fn generate(state: &GaussianState<T, N>, params: &UkfParams<T>) -> Result<Self> {
        let gamma = params.gamma(N);
        if !Float::is_finite(gamma) {
            return Err(PflowError::InvalidConfig("sigma point spread n + λ must be positive"));
        }
        let scaled_sqrt_p = stabilized_cholesky(state.covariance.as_matrix())?.scale(gamma);

        let mut points = Vec::with_capacity(2 * N + 1);
        points.push(state.mean);
        for i in 0..N {
            let offset = StateVector::from_svector(scaled_sqrt_p.column(i).into_owned());
            points.push(state.mean + offset);
            points.push(state.mean - offset);
        }

        Ok(Self {
            points,
            weight_mean_0: params.weight_mean_0(N),
            weight_cov_0: params.weight_cov_0(N),
            weight_i: params.weight_i(N),
        })
    }

    #[inline]
    fn mean_weight(&self, index: usize) -> T {
        if index == 0 {
            self.weight_mean_0
        } else {
            self.weight_i
        }
    }

    #[inline]
    fn cov_weight(&self, index: usize) -> T {
        if index == 0 {
            self.weight_cov_0
        } else {
            self.weight_i
        }
    }

    /// Weighted mean of transformed sigma points.
    pub fn recover_mean<const D: usize>(&self, transformed: &[SVector<T, D>]) -> SVector<T, D> {
        transformed
            .iter()
            .enumerate()
            .fold(SVector::zeros(), |acc, (i, t)| acc + t.scale(self.mean_weight(i)))
    }
}

// ============================================================================
// Unscented Kalman Updater
// ============================================================================

/// Kalman update using the unscented transform of the measurement function.
#[derive(Debug, Clone)]
pub struct UnscentedKalmanUpdater<T: RealField + Float + Copy, const N: usize, const M: usize> {
    measurement_model: Option<SharedMeasurementModel<T, N, M>>,
    pub params: UkfParams<T>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> UnscentedKalmanUpdater<T, N, M> {
    /// Creates an updater with default [`UkfParams`].
    #[inline]
    pub fn new(measurement_model: SharedMeasurementModel<T, N, M>) -> Self {
        Self::with_params(measurement_model, UkfParams::default())
    }

    #[inline]
    pub fn with_params(measurement_model: SharedMeasurementModel<T, N, M>, params: UkfParams<T>) -> Self {
        Self {
            measurement_model: Some(measurement_model),
            params,
        }
    }

    /// Measurement mean, innovation covariance and cross covariance.
    ///
    /// Deviations from the predicted measurement go through the model's
    /// residual so angular components wrap.
    fn unscented_prediction(
        &self,
        prediction: &GaussianState<T, N>,
        model: &DynMeasurementModel<T, N, M>,
    ) -> Result<GaussianMeasurementPrediction<T, N, M>> {
        let sigma = SigmaPoints::generate(prediction, &self.params)?;
        let observed: Vec<SVector<T, M>> = sigma
            .points
            .iter()
            .map(|x| model.observe(x).into_svector())
            .collect();
        let mean = Measurement::from_svector(sigma.recover_mean(&observed));

        let mut s = *model.measurement_noise().as_matrix();
        let mut cross = SMatrix::<T, N, M>::zeros();
        for (i, (point, z)) in sigma.points.iter().zip(&observed).enumerate() {
            let dz = model
                .residual(&Measurement::from_svector(*z), &mean)
                .into_svector();
            let dx = (*point - prediction.mean).into_svector();
            let w = sigma.cov_weight(i);
            s += (dz * dz.transpose()).scale(w);
            cross += (dx * dz.transpose()).scale(w);
        }

        Ok(GaussianMeasurementPrediction {
            mean,
            covariance: MeasurementCovariance::from_matrix(s).symmetrized(),
            cross_covariance: cross,
            timestamp: prediction.timestamp,
        })
    }
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> GaussianUpdater<T, N, M>
    for UnscentedKalmanUpdater<T, N, M>
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
        self.unscented_prediction(prediction, model.as_ref())
    }

    fn update(
        &self,
        hypothesis: &Arc<GaussianHypothesis<T, N, M>>,
    ) -> Result<GaussianStateUpdate<T, N, M>> {
        let detection = &hypothesis.measurement;
        let model = resolve_model(detection, self.measurement_model.as_ref())?;
        let prediction = &hypothesis.prediction;

        let predicted = self.unscented_prediction(prediction, model.as_ref())?;

        // K = P_xz * S^{-1}
        let s_inv = stabilized_inverse(predicted.covariance.as_matrix())?;
        let gain = predicted.cross_covariance * s_inv;

        let innovation = model.residual(&detection.measurement, &predicted.mean);
        let mean = StateVector::from_svector(prediction.mean.as_svector() + gain * innovation.as_svector());

        // P = P - K * S * K^T
        let covariance = StateCovariance::from_matrix(
            prediction.covariance.as_matrix()
                - gain * predicted.covariance.as_matrix() * gain.transpose(),
        )
        .symmetrized();

        Ok(GaussianStateUpdate {
            state: GaussianState::new(mean, covariance, detection.timestamp),
            hypothesis: Arc::clone(hypothesis),
        })
    }
}

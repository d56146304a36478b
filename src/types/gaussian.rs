//! Gaussian state estimates and densities
//!
//! The Gaussian view of a particle cloud, consumed by the linearized
//! updaters, and the multivariate normal log density used as the default
//! measurement likelihood.

use ::core::f64::consts::PI;
use nalgebra::{Cholesky, RealField};
use num_traits::Float;

use super::spaces::{Innovation, MeasurementCovariance, StateCovariance, StateVector};
use crate::{PflowError, Result};

// ============================================================================
// Gaussian State
// ============================================================================

/// A Gaussian state estimate at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianState<T: RealField, const N: usize> {
    /// Mean state vector
    pub mean: StateVector<T, N>,
    /// State covariance matrix
    pub covariance: StateCovariance<T, N>,
    /// Time of validity in seconds
    pub timestamp: T,
}

impl<T: RealField + Float + Copy, const N: usize> GaussianState<T, N> {
    #[inline]
    pub fn new(mean: StateVector<T, N>, covariance: StateCovariance<T, N>, timestamp: T) -> Self {
        Self {
            mean,
            covariance,
            timestamp,
        }
    }

    /// Returns true if mean and covariance contain only finite values.
    pub fn is_finite(&self) -> bool {
        self.mean.is_finite()
            && self
                .covariance
                .as_matrix()
                .iter()
                .all(|x| Float::is_finite(*x))
    }
}

// ============================================================================
// Gaussian Log Density
// ============================================================================

/// Log density of a zero-mean multivariate normal evaluated at `residual`.
///
/// ln N(r; 0, S) = -½ (M ln 2π + ln|S| + rᵀ S⁻¹ r)
///
/// Evaluated through the Cholesky factor of `S`, so very small densities
/// stay representable. Fails with [`PflowError::NotPositiveDefinite`] when
/// `S` has no Cholesky factor.
pub fn gaussian_log_likelihood<T: RealField + Float + Copy, const M: usize>(
    residual: &Innovation<T, M>,
    covariance: &MeasurementCovariance<T, M>,
) -> Result<T> {
    let chol = Cholesky::new(*covariance.as_matrix()).ok_or(PflowError::NotPositiveDefinite)?;

    let r = residual.as_svector();
    let mahal_sq = r.dot(&chol.solve(r));

    let two = T::from_f64(2.0).unwrap();
    let log_det = chol
        .l_dirty()
        .diagonal()
        .iter()
        .fold(T::zero(), |acc, &d| acc + two * Float::ln(d));

    let m = T::from_usize(M).unwrap();
    let log_two_pi = Float::ln(T::from_f64(2.0 * PI).unwrap());
    let half = T::from_f64(0.5).unwrap();

    let log_density = -half * (m * log_two_pi + log_det + mahal_sq);
    if Float::is_nan(log_density) {
        return Err(PflowError::NumericalInstability);
    }
    Ok(log_density)
}

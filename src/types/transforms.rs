//! Typed transformation matrices
//!
//! Matrices that transform vectors between spaces, with type-level
//! encoding of source and target spaces, plus the Kalman algebra built on them.

use ::core::hash::Hasher;
use ::core::marker::PhantomData;
use nalgebra::{RealField, SMatrix, Scalar};
use num_traits::Float;

use super::spaces::{
    hash_scalar, Innovation, InnovationSpace, Measurement, MeasurementCovariance,
    MeasurementSpace, StateCovariance, StateSpace, StateVector,
};
use crate::utils::stabilized_inverse;
use crate::Result;

// ============================================================================
// Transform Matrix
// ============================================================================

/// A transformation matrix that maps vectors from one space to another.
///
/// # Type Parameters
///
/// - `T`: Scalar type
/// - `ROWS`: Number of rows (dimension of target space)
/// - `COLS`: Number of columns (dimension of source space)
/// - `To`: Target space marker
/// - `From`: Source space marker
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq)]
pub struct Transform<T: Scalar, const ROWS: usize, const COLS: usize, To, From> {
    inner: SMatrix<T, ROWS, COLS>,
    _marker: PhantomData<(To, From)>,
}

impl<T: Scalar, const ROWS: usize, const COLS: usize, To, From> Transform<T, ROWS, COLS, To, From> {
    /// Creates a transform from a raw matrix.
    #[inline]
    pub fn from_matrix(inner: SMatrix<T, ROWS, COLS>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Returns a reference to the underlying matrix.
    #[inline]
    pub fn as_matrix(&self) -> &SMatrix<T, ROWS, COLS> {
        &self.inner
    }

    /// Consumes self and returns the underlying matrix.
    #[inline]
    pub fn into_matrix(self) -> SMatrix<T, ROWS, COLS> {
        self.inner
    }
}

impl<T: Scalar + Copy, const ROWS: usize, const COLS: usize, To: Clone, From: Clone> Copy
    for Transform<T, ROWS, COLS, To, From>
where
    SMatrix<T, ROWS, COLS>: Copy,
{
}

impl<T: RealField + Float + Copy, const ROWS: usize, const COLS: usize, To, From>
    Transform<T, ROWS, COLS, To, From>
{
    /// Creates a zero transform.
    #[inline]
    pub fn zeros() -> Self {
        Self::from_matrix(SMatrix::zeros())
    }

    /// Returns the transpose of this transform.
    ///
    /// The transpose maps from `To` to `From` (reversed).
    #[inline]
    pub fn transpose(&self) -> Transform<T, COLS, ROWS, From, To> {
        Transform::from_matrix(self.inner.transpose())
    }

    /// Writes the entry bit patterns into a fingerprint hasher.
    pub fn hash_bits(&self, hasher: &mut dyn Hasher) {
        hasher.write_usize(ROWS);
        hasher.write_usize(COLS);
        for x in self.inner.iter() {
            hash_scalar(hasher, *x);
        }
    }
}

// ============================================================================
// Type Aliases
// ============================================================================

/// Observation matrix: StateSpace -> MeasurementSpace
pub type ObservationMatrix<T, const M: usize, const N: usize> =
    Transform<T, M, N, MeasurementSpace, StateSpace>;

/// Kalman gain: InnovationSpace -> StateSpace
pub type KalmanGain<T, const N: usize, const M: usize> =
    Transform<T, N, M, StateSpace, InnovationSpace>;

// ============================================================================
// Specific Transform Applications
// ============================================================================

impl<T: RealField + Float + Copy, const M: usize, const N: usize> ObservationMatrix<T, M, N> {
    /// Applies the observation model to a state vector.
    #[inline]
    pub fn observe(&self, state: &StateVector<T, N>) -> Measurement<T, M> {
        Measurement::from_svector(self.inner * state.as_svector())
    }

    /// Projects state covariance to measurement space: H * P * H^T
    #[inline]
    pub fn project_covariance(&self, cov: &StateCovariance<T, N>) -> MeasurementCovariance<T, M> {
        MeasurementCovariance::from_matrix(self.inner * cov.as_matrix() * self.inner.transpose())
    }

    /// Cross covariance between state and predicted measurement: P * H^T
    #[inline]
    pub fn cross_covariance(&self, cov: &StateCovariance<T, N>) -> SMatrix<T, N, M> {
        cov.as_matrix() * self.inner.transpose()
    }
}

impl<T: RealField + Float + Copy, const N: usize> ObservationMatrix<T, N, N> {
    /// Observation matrix that measures the full state directly.
    #[inline]
    pub fn identity() -> Self {
        Self::from_matrix(SMatrix::identity())
    }
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> KalmanGain<T, N, M> {
    /// Applies the Kalman gain to an innovation vector.
    #[inline]
    pub fn correct(&self, innovation: &Innovation<T, M>) -> StateVector<T, N> {
        StateVector::from_svector(self.inner * innovation.as_svector())
    }
}

// ============================================================================
// Kalman Gain Computation
// ============================================================================

/// Computes the Kalman gain matrix.
///
/// K = P * H^T * S^{-1}
///
/// A singular S gets one jittered retry (see [`stabilized_inverse`]); fails
/// with [`crate::PflowError::SingularMatrix`] when that does not help either.
pub fn compute_kalman_gain<T: RealField + Float + Copy, const N: usize, const M: usize>(
    state_cov: &StateCovariance<T, N>,
    obs_matrix: &ObservationMatrix<T, M, N>,
    innovation_cov: &MeasurementCovariance<T, M>,
) -> Result<KalmanGain<T, N, M>> {
    let s_inv = stabilized_inverse(innovation_cov.as_matrix())?;

    Ok(KalmanGain::from_matrix(
        obs_matrix.cross_covariance(state_cov) * s_inv,
    ))
}

/// Computes the innovation covariance.
///
/// S = H * P * H^T + R
pub fn compute_innovation_covariance<T: RealField + Float + Copy, const N: usize, const M: usize>(
    state_cov: &StateCovariance<T, N>,
    obs_matrix: &ObservationMatrix<T, M, N>,
    meas_noise: &MeasurementCovariance<T, M>,
) -> MeasurementCovariance<T, M> {
    obs_matrix.project_covariance(state_cov) + *meas_noise
}

/// Updates state covariance using Joseph form for numerical stability.
///
/// P_updated = (I - K*H) * P * (I - K*H)^T + K * R * K^T
pub fn joseph_update<T: RealField + Float + Copy, const N: usize, const M: usize>(
    state_cov: &StateCovariance<T, N>,
    kalman_gain: &KalmanGain<T, N, M>,
    obs_matrix: &ObservationMatrix<T, M, N>,
    meas_noise: &MeasurementCovariance<T, M>,
) -> StateCovariance<T, N> {
    let i: SMatrix<T, N, N> = SMatrix::identity();
    let i_kh = i - kalman_gain.as_matrix() * obs_matrix.as_matrix();

    let term1 = i_kh * state_cov.as_matrix() * i_kh.transpose();
    let term2 =
        kalman_gain.as_matrix() * meas_noise.as_matrix() * kalman_gain.as_matrix().transpose();

    StateCovariance::from_matrix(term1 + term2)
}

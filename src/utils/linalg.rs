//! Numerically stabilized linear algebra helpers
//!
//! Weighted moments of particle clouds, plus a Cholesky factorization and an
//! inverse that tolerate the rank deficiency of flow diffusion matrices and
//! collapsed innovation covariances.

use nalgebra::{Cholesky, RealField, SMatrix, SVector};
use num_traits::Float;

use crate::{PflowError, Result};

/// Relative jitter used for the single regularized retry.
const RETRY_JITTER: f64 = 1e-8;

/// Lower-triangular square root `L` of a (nearly) positive semi-definite matrix.
///
/// The matrix is symmetrized and a jitter of `D·ε·max|diag|` is added to the
/// diagonal before factorizing, which absorbs rounding in exactly
/// semi-definite inputs. If that still fails, one retry is made with a
/// relative jitter of `1e-8`; after that the matrix is reported as
/// [`PflowError::NotPositiveDefinite`].
pub fn stabilized_cholesky<T: RealField + Float + Copy, const D: usize>(
    matrix: &SMatrix<T, D, D>,
) -> Result<SMatrix<T, D, D>> {
    let half = T::from_f64(0.5).unwrap();
    let symmetric = (matrix + matrix.transpose()).scale(half);

    if !symmetric.iter().all(|x| Float::is_finite(*x)) {
        return Err(PflowError::NumericalInstability);
    }

    let scale = symmetric
        .diagonal()
        .iter()
        .fold(T::zero(), |acc, &d| Float::max(acc, Float::abs(d)));
    let scale = Float::max(scale, <T as Float>::min_positive_value());
    let dim = T::from_usize(D).unwrap();
    let identity = SMatrix::<T, D, D>::identity();

    let jitter = dim * <T as Float>::epsilon() * scale;
    if let Some(chol) = Cholesky::new(symmetric + identity.scale(jitter)) {
        return Ok(chol.l());
    }

    let retry_jitter = T::from_f64(RETRY_JITTER).unwrap() * scale;
    log::debug!(
        "cholesky failed with jitter {}, retrying with {}",
        jitter,
        retry_jitter
    );
    Cholesky::new(symmetric + identity.scale(retry_jitter))
        .map(|chol| chol.l())
        .ok_or(PflowError::NotPositiveDefinite)
}

/// Inverse of a (nearly) symmetric matrix with one jittered retry.
///
/// When the plain inverse fails, `1e-8·max|diag|` is added to the diagonal
/// and the inversion is tried once more. A matrix with an all-zero diagonal,
/// or one that still cannot be inverted, is reported as
/// [`PflowError::SingularMatrix`].
pub fn stabilized_inverse<T: RealField + Float + Copy, const D: usize>(
    matrix: &SMatrix<T, D, D>,
) -> Result<SMatrix<T, D, D>> {
    if let Some(inverse) = matrix.try_inverse() {
        return Ok(inverse);
    }

    let scale = matrix
        .diagonal()
        .iter()
        .fold(T::zero(), |acc, &d| Float::max(acc, Float::abs(d)));
    if !(scale > T::zero()) || !Float::is_finite(scale) {
        return Err(PflowError::SingularMatrix);
    }

    let jitter = T::from_f64(RETRY_JITTER).unwrap() * scale;
    log::debug!("matrix inversion failed, retrying with jitter {}", jitter);
    (matrix + SMatrix::<T, D, D>::identity().scale(jitter))
        .try_inverse()
        .filter(|inverse| inverse.iter().all(|x| Float::is_finite(*x)))
        .ok_or(PflowError::SingularMatrix)
}

/// Weighted mean of a set of vectors; `weights` must sum to one.
pub fn weighted_mean<T: RealField + Float + Copy, const D: usize>(
    vectors: impl IntoIterator<Item = SVector<T, D>>,
    weights: &[T],
) -> SVector<T, D> {
    vectors
        .into_iter()
        .zip(weights)
        .fold(SVector::zeros(), |acc, (v, &w)| acc + v.scale(w))
}

/// Weighted (population, `ddof = 0`) covariance about `mean`; `weights` must sum to one.
pub fn weighted_covariance<T: RealField + Float + Copy, const D: usize>(
    vectors: impl IntoIterator<Item = SVector<T, D>>,
    weights: &[T],
    mean: &SVector<T, D>,
) -> SMatrix<T, D, D> {
    vectors
        .into_iter()
        .zip(weights)
        .fold(SMatrix::zeros(), |acc, (v, &w)| {
            let diff = v - mean;
            acc + (diff * diff.transpose()).scale(w)
        })
}

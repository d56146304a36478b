//! Log-domain probabilities
//!
//! Particle weights routinely shrink below the smallest representable
//! `f64` after a few sharp likelihoods. [`Probability`] keeps the natural
//! logarithm of the value so products, sums and normalization stay exact
//! where the linear value would have underflowed to zero.

use ::core::cmp::Ordering;
use ::core::fmt;
use ::core::iter::Sum;
use ::core::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Sub};

use nalgebra::RealField;
use num_traits::Float;

use crate::{PflowError, Result};

/// A non-negative probability stored as its natural logarithm.
///
/// Ordering and equality compare the log values, so `Probability::new(0.0)`
/// (log value `-inf`) compares below every positive probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probability<T> {
    log_value: T,
}

impl<T: RealField + Float + Copy> Probability<T> {
    /// Creates a probability from its linear value.
    ///
    /// # Panics
    /// Panics if `value` is negative or NaN.
    #[inline]
    pub fn new(value: T) -> Self {
        assert!(value >= T::zero(), "Probability must be non-negative");
        Self {
            log_value: Float::ln(value),
        }
    }

    /// Creates a probability from its natural logarithm.
    ///
    /// # Panics
    /// Panics if `log_value` is NaN.
    #[inline]
    pub fn from_log(log_value: T) -> Self {
        assert!(!Float::is_nan(log_value), "Log probability must not be NaN");
        Self { log_value }
    }

    /// Converts a slice of log values, e.g. a freshly normalized log-weight vector.
    pub fn from_log_slice(log_values: &[T]) -> Vec<Self> {
        log_values.iter().map(|&l| Self::from_log(l)).collect()
    }

    #[inline]
    pub fn zero() -> Self {
        Self {
            log_value: <T as Float>::neg_infinity(),
        }
    }

    #[inline]
    pub fn one() -> Self {
        Self {
            log_value: T::zero(),
        }
    }

    /// Linear value. Underflows to zero for log values below about -745 in `f64`.
    #[inline]
    pub fn value(&self) -> T {
        Float::exp(self.log_value)
    }

    /// Natural logarithm of the value (exact, never underflows).
    #[inline]
    pub fn log_value(&self) -> T {
        self.log_value
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.log_value == <T as Float>::neg_infinity()
    }

    #[inline]
    pub fn sqrt(&self) -> Self {
        Self {
            log_value: self.log_value * T::from_f64(0.5).unwrap(),
        }
    }

    /// Raises the probability to a non-negative power.
    #[inline]
    pub fn powf(&self, exponent: T) -> Self {
        if self.is_zero() && exponent == T::zero() {
            return Self::one();
        }
        Self {
            log_value: self.log_value * exponent,
        }
    }
}

// ============================================================================
// Arithmetic
// ============================================================================

impl<T: RealField + Float + Copy> Mul for Probability<T> {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        if self.is_zero() || rhs.is_zero() {
            return Self::zero();
        }
        Self {
            log_value: self.log_value + rhs.log_value,
        }
    }
}

impl<T: RealField + Float + Copy> Div for Probability<T> {
    type Output = Self;

    /// Division by zero yields an infinite probability, mirroring `f64`.
    #[inline]
    fn div(self, rhs: Self) -> Self {
        if self.is_zero() {
            return Self::zero();
        }
        Self {
            log_value: self.log_value - rhs.log_value,
        }
    }
}

impl<T: RealField + Float + Copy> Add for Probability<T> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        let (hi, lo) = if self.log_value >= rhs.log_value {
            (self.log_value, rhs.log_value)
        } else {
            (rhs.log_value, self.log_value)
        };
        if hi == <T as Float>::neg_infinity() || hi == <T as Float>::infinity() {
            return Self { log_value: hi };
        }
        Self {
            log_value: hi + Float::ln_1p(Float::exp(lo - hi)),
        }
    }
}

impl<T: RealField + Float + Copy> Sub for Probability<T> {
    type Output = Self;

    /// Absolute difference; a probability cannot go negative.
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        let (hi, lo) = if self.log_value >= rhs.log_value {
            (self.log_value, rhs.log_value)
        } else {
            (rhs.log_value, self.log_value)
        };
        if hi == <T as Float>::neg_infinity() {
            return Self::zero();
        }
        Self {
            log_value: hi + Float::ln(-Float::exp_m1(lo - hi)),
        }
    }
}

impl<T: RealField + Float + Copy> MulAssign for Probability<T> {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<T: RealField + Float + Copy> DivAssign for Probability<T> {
    #[inline]
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}

impl<T: RealField + Float + Copy> AddAssign for Probability<T> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<T: RealField + Float + Copy> Sum for Probability<T> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        let logs: Vec<T> = iter.map(|p| p.log_value).collect();
        Self {
            log_value: log_sum_exp(&logs),
        }
    }
}

impl<'a, T: RealField + Float + Copy> Sum<&'a Probability<T>> for Probability<T> {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl<T: PartialOrd> PartialOrd for Probability<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.log_value.partial_cmp(&other.log_value)
    }
}

impl<T: RealField + Float + Copy> fmt::Display for Probability<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value();
        if value == T::zero() && !self.is_zero() {
            write!(f, "exp({})", self.log_value)
        } else {
            fmt::Display::fmt(&value, f)
        }
    }
}

// ============================================================================
// Log-Sum-Exp
// ============================================================================

/// Computes `ln(Σ exp(v_i))` without overflow or underflow.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp<T: RealField + Float + Copy>(values: &[T]) -> T {
    let max = values
        .iter()
        .fold(<T as Float>::neg_infinity(), |acc, &v| Float::max(acc, v));

    if !Float::is_finite(max) {
        return max;
    }

    let sum = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + Float::exp(v - max));
    max + Float::ln(sum)
}

/// Normalizes log weights in place so that their linear values sum to one.
///
/// Returns the log normalizer that was subtracted. Fails with
/// [`PflowError::NumericalInstability`] when the normalizer is not finite
/// (all weights zero, an infinite weight, or a NaN), leaving `log_weights`
/// untouched.
pub fn normalize_log_weights<T: RealField + Float + Copy>(log_weights: &mut [T]) -> Result<T> {
    let log_norm = log_sum_exp(log_weights);
    if !Float::is_finite(log_norm) {
        return Err(PflowError::NumericalInstability);
    }
    for w in log_weights.iter_mut() {
        *w -= log_norm;
    }
    Ok(log_norm)
}

/// Linear weights that sum to one, computed from unnormalized log weights.
pub fn normalized_weights<T: RealField + Float + Copy>(log_weights: &[T]) -> Result<Vec<T>> {
    let mut normalized = log_weights.to_vec();
    normalize_log_weights(&mut normalized)?;
    Ok(normalized.into_iter().map(Float::exp).collect())
}

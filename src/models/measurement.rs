//! Measurement (sensor) models
//!
//! Describes how sensor measurements relate to target states:
//!
//! z = h(x) + v,   v ~ N(0, R)
//!
//! Linear models expose `H` through [`MeasurementModel::observation_matrix`];
//! nonlinear models expose a state-dependent Jacobian instead.

use ::core::any::type_name;
use ::core::f64::consts::PI;
use ::core::fmt;
use ::core::hash::Hasher;
use std::sync::Arc;

use nalgebra::{RealField, SMatrix};
use num_traits::Float;

use crate::types::gaussian::gaussian_log_likelihood;
use crate::types::spaces::{
    hash_scalar, ComputeInnovation, Innovation, Measurement, MeasurementCovariance, StateVector,
};
use crate::types::transforms::ObservationMatrix;
use crate::{PflowError, Result};

/// Trait for measurement models.
///
/// Only [`observe`](Self::observe) and
/// [`measurement_noise`](Self::measurement_noise) are required. Models used
/// with particle flow or a Kalman updater must also provide either
/// [`observation_matrix`](Self::observation_matrix) or
/// [`jacobian_at`](Self::jacobian_at).
pub trait MeasurementModel<T: RealField + Float + Copy, const N: usize, const M: usize>:
    fmt::Debug
{
    /// Noise-free measurement h(x) of a state.
    fn observe(&self, state: &StateVector<T, N>) -> Measurement<T, M>;

    /// Measurement noise covariance R.
    fn measurement_noise(&self) -> MeasurementCovariance<T, M>;

    /// Constant observation matrix H, for linear models.
    fn observation_matrix(&self) -> Option<ObservationMatrix<T, M, N>> {
        None
    }

    /// Jacobian of h evaluated at `state`, for nonlinear models.
    ///
    /// Returns `None` where the Jacobian is undefined.
    fn jacobian_at(&self, _state: &StateVector<T, N>) -> Option<ObservationMatrix<T, M, N>> {
        None
    }

    /// Difference `measurement - predicted`.
    ///
    /// Models with angular components override this to wrap angles.
    fn residual(
        &self,
        measurement: &Measurement<T, M>,
        predicted: &Measurement<T, M>,
    ) -> Innovation<T, M> {
        measurement.innovation(*predicted)
    }

    /// Log density of `measurement` given `state`.
    fn log_likelihood(&self, measurement: &Measurement<T, M>, state: &StateVector<T, N>) -> Result<T> {
        let predicted = self.observe(state);
        gaussian_log_likelihood(
            &self.residual(measurement, &predicted),
            &self.measurement_noise(),
        )
    }

    /// Writes an identity for this model into a cache fingerprint.
    ///
    /// Two models that feed the same bits must produce the same measurement
    /// predictions. The default covers the type, R and H; models with other
    /// parameters must add them.
    fn fingerprint(&self, hasher: &mut dyn Hasher) {
        hasher.write(type_name::<Self>().as_bytes());
        self.measurement_noise().hash_bits(hasher);
        if let Some(h) = self.observation_matrix() {
            h.hash_bits(hasher);
        }
    }
}

/// A measurement model shared across threads.
pub type DynMeasurementModel<T, const N: usize, const M: usize> =
    dyn MeasurementModel<T, N, M> + Send + Sync;

/// Reference-counted handle to a [`DynMeasurementModel`].
pub type SharedMeasurementModel<T, const N: usize, const M: usize> =
    Arc<DynMeasurementModel<T, N, M>>;

/// Local linearization of `model` at `state`.
///
/// The constant matrix takes precedence; the Jacobian is only evaluated when
/// the model has none. Fails with [`PflowError::ModelCapability`] when
/// neither is available.
pub fn linearize<T, Model, const N: usize, const M: usize>(
    model: &Model,
    state: &StateVector<T, N>,
) -> Result<ObservationMatrix<T, M, N>>
where
    T: RealField + Float + Copy,
    Model: MeasurementModel<T, N, M> + ?Sized,
{
    model
        .observation_matrix()
        .or_else(|| model.jacobian_at(state))
        .ok_or(PflowError::ModelCapability)
}

/// Wraps an angle into `[-π, π)`.
pub fn wrap_angle<T: RealField + Float + Copy>(angle: T) -> T {
    let pi = T::from_f64(PI).unwrap();
    let two_pi = pi + pi;
    let wrapped = (angle + pi) % two_pi;
    if wrapped < T::zero() {
        wrapped + two_pi - pi
    } else {
        wrapped - pi
    }
}

// ============================================================================
// Linear Gaussian Model
// ============================================================================

/// General linear model z = H x + v with arbitrary H and R.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearGaussian<T: RealField, const N: usize, const M: usize> {
    pub matrix: ObservationMatrix<T, M, N>,
    pub noise: MeasurementCovariance<T, M>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> LinearGaussian<T, N, M> {
    #[inline]
    pub fn new(matrix: ObservationMatrix<T, M, N>, noise: MeasurementCovariance<T, M>) -> Self {
        Self { matrix, noise }
    }
}

impl<T: RealField + Float + Copy, const N: usize> LinearGaussian<T, N, N> {
    /// Observes the full state with isotropic noise of the given variance.
    ///
    /// # Panics
    /// Panics if `variance <= 0`.
    pub fn identity(variance: T) -> Self {
        assert!(variance > T::zero(), "Measurement noise variance must be positive");
        Self::new(
            ObservationMatrix::identity(),
            MeasurementCovariance::identity().scale(variance),
        )
    }
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> MeasurementModel<T, N, M>
    for LinearGaussian<T, N, M>
{
    fn observe(&self, state: &StateVector<T, N>) -> Measurement<T, M> {
        self.matrix.observe(state)
    }

    fn measurement_noise(&self) -> MeasurementCovariance<T, M> {
        self.noise
    }

    fn observation_matrix(&self) -> Option<ObservationMatrix<T, M, N>> {
        Some(self.matrix)
    }
}

// ============================================================================
// Position Sensors
// ============================================================================

fn position_matrix<T: RealField + Float + Copy, const M: usize, const N: usize>(
) -> ObservationMatrix<T, M, N> {
    ObservationMatrix::from_matrix(SMatrix::<T, M, N>::identity())
}

/// Position-only sensor in 2D.
///
/// Observes [x, y] from state [x, y, vx, vy]
#[derive(Debug, Clone)]
pub struct PositionSensor2D<T: RealField> {
    /// Position measurement noise standard deviation
    pub sigma_pos: T,
}

impl<T: RealField + Float + Copy> PositionSensor2D<T> {
    /// # Panics
    /// Panics if `sigma_pos <= 0`.
    pub fn new(sigma_pos: T) -> Self {
        assert!(sigma_pos > T::zero(), "Measurement noise sigma_pos must be positive");
        Self { sigma_pos }
    }
}

impl<T: RealField + Float + Copy> MeasurementModel<T, 4, 2> for PositionSensor2D<T> {
    fn observe(&self, state: &StateVector<T, 4>) -> Measurement<T, 2> {
        Measurement::from_array([*state.index(0), *state.index(1)])
    }

    fn measurement_noise(&self) -> MeasurementCovariance<T, 2> {
        MeasurementCovariance::identity().scale(self.sigma_pos * self.sigma_pos)
    }

    fn observation_matrix(&self) -> Option<ObservationMatrix<T, 2, 4>> {
        Some(position_matrix())
    }
}

/// Position-only sensor in 3D.
///
/// Observes [x, y, z] from state [x, y, z, vx, vy, vz]
#[derive(Debug, Clone)]
pub struct PositionSensor3D<T: RealField> {
    /// Position measurement noise standard deviation
    pub sigma_pos: T,
}

impl<T: RealField + Float + Copy> PositionSensor3D<T> {
    /// # Panics
    /// Panics if `sigma_pos <= 0`.
    pub fn new(sigma_pos: T) -> Self {
        assert!(sigma_pos > T::zero(), "Measurement noise sigma_pos must be positive");
        Self { sigma_pos }
    }
}

impl<T: RealField + Float + Copy> MeasurementModel<T, 6, 3> for PositionSensor3D<T> {
    fn observe(&self, state: &StateVector<T, 6>) -> Measurement<T, 3> {
        Measurement::from_array([*state.index(0), *state.index(1), *state.index(2)])
    }

    fn measurement_noise(&self) -> MeasurementCovariance<T, 3> {
        MeasurementCovariance::identity().scale(self.sigma_pos * self.sigma_pos)
    }

    fn observation_matrix(&self) -> Option<ObservationMatrix<T, 3, 6>> {
        Some(position_matrix())
    }
}

// ============================================================================
// Range-Bearing Sensor
// ============================================================================

/// Range-bearing sensor (radar-like).
///
/// Nonlinear: measures [range, bearing] of a [x, y, vx, vy] state relative
/// to the sensor position. Offers a Jacobian but no constant matrix, and
/// wraps the bearing residual into `[-π, π)`.
#[derive(Debug, Clone)]
pub struct RangeBearingSensor<T: RealField> {
    /// Range measurement noise standard deviation
    pub sigma_range: T,
    /// Bearing measurement noise standard deviation (radians)
    pub sigma_bearing: T,
    /// Sensor position x
    pub sensor_x: T,
    /// Sensor position y
    pub sensor_y: T,
}

impl<T: RealField + Float + Copy> RangeBearingSensor<T> {
    /// Creates a new range-bearing sensor at the origin.
    ///
    /// # Panics
    /// Panics if a noise parameter is non-positive.
    pub fn new(sigma_range: T, sigma_bearing: T) -> Self {
        Self::at_position(sigma_range, sigma_bearing, T::zero(), T::zero())
    }

    /// Creates a sensor at a specific position.
    ///
    /// # Panics
    /// Panics if a noise parameter is non-positive.
    pub fn at_position(sigma_range: T, sigma_bearing: T, sensor_x: T, sensor_y: T) -> Self {
        assert!(sigma_range > T::zero(), "Range noise sigma_range must be positive");
        assert!(sigma_bearing > T::zero(), "Bearing noise sigma_bearing must be positive");
        Self {
            sigma_range,
            sigma_bearing,
            sensor_x,
            sensor_y,
        }
    }
}

impl<T: RealField + Float + Copy> MeasurementModel<T, 4, 2> for RangeBearingSensor<T> {
    fn observe(&self, state: &StateVector<T, 4>) -> Measurement<T, 2> {
        let dx = *state.index(0) - self.sensor_x;
        let dy = *state.index(1) - self.sensor_y;

        let range = Float::sqrt(dx * dx + dy * dy);
        let bearing = Float::atan2(dy, dx);

        Measurement::from_array([range, bearing])
    }

    fn measurement_noise(&self) -> MeasurementCovariance<T, 2> {
        MeasurementCovariance::from_diagonal(&nalgebra::vector![
            self.sigma_range * self.sigma_range,
            self.sigma_bearing * self.sigma_bearing
        ])
    }

    /// Returns `None` if the state is too close to the sensor position.
    fn jacobian_at(&self, state: &StateVector<T, 4>) -> Option<ObservationMatrix<T, 2, 4>> {
        let dx = *state.index(0) - self.sensor_x;
        let dy = *state.index(1) - self.sensor_y;

        let r_sq = dx * dx + dy * dy;
        let r = Float::sqrt(r_sq);
        let zero = T::zero();

        if r < T::from_f64(1e-10).unwrap() {
            return None;
        }

        // d_range/dx = dx/r, d_range/dy = dy/r
        // d_bearing/dx = -dy/r^2, d_bearing/dy = dx/r^2
        Some(ObservationMatrix::from_matrix(nalgebra::matrix![
            dx / r, dy / r, zero, zero;
            -dy / r_sq, dx / r_sq, zero, zero
        ]))
    }

    fn residual(&self, measurement: &Measurement<T, 2>, predicted: &Measurement<T, 2>) -> Innovation<T, 2> {
        let range = *measurement.index(0) - *predicted.index(0);
        let bearing = wrap_angle(*measurement.index(1) - *predicted.index(1));
        Innovation::from_array([range, bearing])
    }

    fn fingerprint(&self, hasher: &mut dyn Hasher) {
        hasher.write(type_name::<Self>().as_bytes());
        self.measurement_noise().hash_bits(hasher);
        hash_scalar(hasher, self.sensor_x);
        hash_scalar(hasher, self.sensor_y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::DefaultHasher;

    fn fingerprint_of<Model: MeasurementModel<f64, 4, 2>>(model: &Model) -> u64 {
        let mut hasher = DefaultHasher::new();
        model.fingerprint(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_position_sensor_2d() {
        let sensor = PositionSensor2D::new(1.0_f64);
        let state = StateVector::from_array([10.0, 20.0, 1.0, 2.0]);

        let z = sensor.observe(&state);
        assert!((z.index(0) - 10.0).abs() < 1e-10);
        assert!((z.index(1) - 20.0).abs() < 1e-10);

        let h = sensor.observation_matrix().unwrap();
        assert_eq!(h.observe(&state), z);
    }

    #[test]
    fn test_position_sensor_3d_matrix() {
        let sensor = PositionSensor3D::new(2.0_f64);
        let state = StateVector::from_array([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let h = sensor.observation_matrix().unwrap();
        assert_eq!(h.observe(&state), sensor.observe(&state));
        assert!((sensor.measurement_noise().trace() - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_identity_model_likelihood() {
        let model = LinearGaussian::<f64, 2, 2>::identity(0.01);
        let z = Measurement::from_array([1.0, 0.0]);
        let x = StateVector::from_array([0.0, 0.0]);

        // -0.5 * (2 ln 2π + ln(1e-4) + 100)
        let expected = -0.5 * (2.0 * (2.0 * PI).ln() + (1e-4_f64).ln() + 100.0);
        assert!((model.log_likelihood(&z, &x).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_range_bearing_sensor() {
        let sensor = RangeBearingSensor::new(1.0_f64, 0.01);
        let state = StateVector::from_array([10.0, 0.0, 0.0, 0.0]);

        let z = sensor.observe(&state);
        assert!((z.index(0) - 10.0).abs() < 1e-10);
        assert!(z.index(1).abs() < 1e-10);
    }

    #[test]
    fn test_range_bearing_jacobian() {
        let sensor = RangeBearingSensor::new(1.0_f64, 0.01);
        let state = StateVector::from_array([10.0, 0.0, 0.0, 0.0]);

        let jacobian = sensor.jacobian_at(&state).unwrap();

        // For target at (10, 0): d_bearing/dy = 1/r
        assert!((jacobian.as_matrix()[(0, 0)] - 1.0).abs() < 1e-10);
        assert!((jacobian.as_matrix()[(0, 1)] - 0.0).abs() < 1e-10);
        assert!((jacobian.as_matrix()[(1, 0)] - 0.0).abs() < 1e-10);
        assert!((jacobian.as_matrix()[(1, 1)] - 0.1).abs() < 1e-10);
    }

    #[test]
    fn test_range_bearing_at_sensor_position() {
        let sensor = RangeBearingSensor::new(1.0_f64, 0.01);
        let state = StateVector::from_array([0.0, 0.0, 0.0, 0.0]);

        assert!(sensor.jacobian_at(&state).is_none());
        assert_eq!(
            linearize(&sensor, &state).unwrap_err(),
            PflowError::ModelCapability
        );
    }

    #[test]
    fn test_bearing_residual_wraps() {
        let sensor = RangeBearingSensor::new(1.0_f64, 0.01);
        let z = Measurement::from_array([5.0, PI - 0.05]);
        let predicted = Measurement::from_array([5.0, -PI + 0.05]);

        let residual = sensor.residual(&z, &predicted);
        assert!((residual.index(1) + 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(1.5 * PI) + 0.5 * PI).abs() < 1e-12);
        assert!((wrap_angle(-0.5_f64) + 0.5).abs() < 1e-12);
        assert!((wrap_angle(2.0 * PI + 0.25) - 0.25).abs() < 1e-12);
        assert!((wrap_angle(-2.0 * PI - 0.25) + 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_linearize_prefers_matrix() {
        let model = LinearGaussian::<f64, 2, 2>::identity(1.0);
        let h = linearize(&model, &StateVector::from_array([3.0, 4.0])).unwrap();
        assert_eq!(h, ObservationMatrix::identity());
    }

    #[test]
    fn test_fingerprint_distinguishes_sensor_position() {
        let a = RangeBearingSensor::new(1.0_f64, 0.01);
        let b = RangeBearingSensor::at_position(1.0_f64, 0.01, 5.0, 0.0);

        assert_eq!(fingerprint_of(&a), fingerprint_of(&a.clone()));
        assert_ne!(fingerprint_of(&a), fingerprint_of(&b));
        assert_ne!(fingerprint_of(&a), fingerprint_of(&PositionSensor2D::new(1.0)));
    }
}

//! Integration tests for the Gromov flow updater with a parallel Kalman branch

mod common;

use std::sync::Arc;

use common::{identity_model, make_hypothesis, sample_gaussian_prior, seeded_rng};
use pflow::filters::flow::GromovFlowParticleUpdater;
use pflow::filters::flow_kalman::GromovFlowKalmanParticleUpdater;
use pflow::filters::kalman::{ExtendedKalmanUpdater, GaussianUpdater};
use pflow::filters::ukf::UnscentedKalmanUpdater;
use pflow::models::{LinearGaussian, PositionSensor2D, SharedMeasurementModel};
use pflow::types::gaussian::GaussianState;
use pflow::types::hypothesis::{GaussianHypothesis, SingleHypothesis};
use pflow::types::particles::ParticleState;
use pflow::types::prediction::{GaussianMeasurementPrediction, GaussianStateUpdate};
use pflow::types::spaces::{MeasurementCovariance, StateVector};
use pflow::types::transforms::ObservationMatrix;
use pflow::{PflowError, Result};

/// Gaussian updater that always fails.
#[derive(Debug)]
struct FailingUpdater;

impl GaussianUpdater<f64, 2, 2> for FailingUpdater {
    fn measurement_model(&self) -> Option<&SharedMeasurementModel<f64, 2, 2>> {
        None
    }

    fn predict_measurement(
        &self,
        _prediction: &GaussianState<f64, 2>,
        _model: Option<&SharedMeasurementModel<f64, 2, 2>>,
    ) -> Result<GaussianMeasurementPrediction<f64, 2, 2>> {
        Err(PflowError::SingularMatrix)
    }

    fn update(
        &self,
        _hypothesis: &Arc<GaussianHypothesis<f64, 2, 2>>,
    ) -> Result<GaussianStateUpdate<f64, 2, 2>> {
        Err(PflowError::SingularMatrix)
    }
}

fn correlated_prior(seed: u64) -> ParticleState<f64, 2> {
    sample_gaussian_prior(
        [1.0, -1.0],
        nalgebra::matrix![2.0, 0.3; 0.3, 1.0],
        500,
        &mut seeded_rng(seed),
    )
}

#[test]
fn test_covariance_equals_ekf_posterior() {
    let model = identity_model::<2>(0.5);
    let updater = GromovFlowKalmanParticleUpdater::new(model.clone());
    let prior = correlated_prior(1);
    let hypothesis = make_hypothesis(prior.clone(), [2.0, 0.0]);

    let update = updater.update(&hypothesis, &mut seeded_rng(10)).unwrap();

    let ekf = ExtendedKalmanUpdater::new(model)
        .update(&Arc::new(SingleHypothesis::new(
            prior.gaussian_view().unwrap(),
            hypothesis.measurement.clone(),
        )))
        .unwrap();

    assert_eq!(update.state.fixed_covariance, Some(ekf.state.covariance));
    assert_eq!(update.state.covariance().unwrap(), ekf.state.covariance);
}

#[test]
fn test_particles_equal_plain_flow() {
    let model = identity_model::<2>(0.5);
    let hybrid = GromovFlowKalmanParticleUpdater::new(model.clone());
    let flow = GromovFlowParticleUpdater::new(model);
    let hypothesis = make_hypothesis(correlated_prior(2), [0.0, 0.0]);

    let a = hybrid.update(&hypothesis, &mut seeded_rng(77)).unwrap();
    let b = flow.update(&hypothesis, &mut seeded_rng(77)).unwrap();

    assert_eq!(a.state.particles, b.state.particles);
    assert_eq!(a.state.timestamp, b.state.timestamp);
    assert!(b.state.fixed_covariance.is_none());
}

#[test]
fn test_kalman_failure_propagates() {
    let updater =
        GromovFlowKalmanParticleUpdater::new(identity_model::<2>(1.0)).with_kalman_updater(FailingUpdater);
    let prior = correlated_prior(3);

    assert_eq!(
        updater
            .update(&make_hypothesis(prior.clone(), [0.0, 0.0]), &mut seeded_rng(0))
            .unwrap_err(),
        PflowError::SingularMatrix
    );
    assert_eq!(
        updater.predict_measurement(&prior, None).unwrap_err(),
        PflowError::SingularMatrix
    );
    assert!(updater.cache().is_empty());
}

#[test]
fn test_singular_innovation_covariance() {
    let model: SharedMeasurementModel<f64, 2, 2> = Arc::new(LinearGaussian::new(
        ObservationMatrix::identity(),
        MeasurementCovariance::zeros(),
    ));
    let updater = GromovFlowKalmanParticleUpdater::new(model);

    // Noiseless sensor, prior spread along x = y: S = H P Hᵀ has det 0 and
    // the Kalman branch recovers with a jittered inverse
    let line = ParticleState::from_state_vectors(
        vec![
            StateVector::from_array([-1.0, -1.0]),
            StateVector::from_array([0.0, 0.0]),
            StateVector::from_array([1.0, 1.0]),
        ],
        0.0,
    );
    let gaussian = line.gaussian_view().unwrap();
    assert!(gaussian.covariance.try_inverse().is_none());
    let kalman = updater
        .kalman_updater()
        .update(&Arc::new(SingleHypothesis::new(
            gaussian,
            make_hypothesis(line, [0.5, 0.5]).measurement.clone(),
        )))
        .unwrap();
    assert!(kalman.state.covariance.as_matrix().iter().all(|x| x.is_finite()));
    assert!((kalman.state.mean.index(0) - 0.5).abs() < 1e-6);

    // Collapsed prior: S = 0, which no jitter can fix
    let collapsed = ParticleState::from_state_vectors(vec![StateVector::from_array([0.0, 0.0]); 4], 0.0);
    assert_eq!(
        updater
            .update(&make_hypothesis(collapsed, [1.0, 1.0]), &mut seeded_rng(0))
            .unwrap_err(),
        PflowError::SingularMatrix
    );
}

#[test]
fn test_predict_measurement_carries_innovation_covariance() {
    let model = identity_model::<2>(0.5);
    let updater = GromovFlowKalmanParticleUpdater::new(model.clone());
    let prior = correlated_prior(4);

    let predicted = updater.predict_measurement(&prior, None).unwrap();
    let plain = updater.flow().predict_measurement(&prior, None).unwrap();
    let gaussian = ExtendedKalmanUpdater::new(model)
        .predict_measurement(&prior.gaussian_view().unwrap(), None)
        .unwrap();

    assert_eq!(predicted.measurement_vectors, plain.measurement_vectors);
    assert_eq!(predicted.weights, plain.weights);
    assert_eq!(predicted.fixed_covariance, Some(gaussian.covariance));
    assert_eq!(predicted.covariance().unwrap(), gaussian.covariance);
    assert!(plain.fixed_covariance.is_none());

    let again = updater.predict_measurement(&prior, None).unwrap();
    assert!(Arc::ptr_eq(&predicted, &again));
}

#[test]
fn test_unscented_branch_on_position_sensor() {
    let sensor: SharedMeasurementModel<f64, 4, 2> = Arc::new(PositionSensor2D::new(1.0));
    let updater = GromovFlowKalmanParticleUpdater::new(sensor.clone())
        .with_kalman_updater(UnscentedKalmanUpdater::new(sensor));
    let prior = sample_gaussian_prior(
        [0.0, 0.0, 1.0, 0.0],
        nalgebra::Matrix4::from_diagonal(&nalgebra::vector![4.0, 4.0, 1.0, 1.0]),
        300,
        &mut seeded_rng(5),
    );

    let update = updater
        .update(&make_hypothesis(prior, [1.0, 1.0]), &mut seeded_rng(6))
        .unwrap();
    let cov = update.state.covariance().unwrap();

    // Position variance shrinks below min(P, R)
    assert!(cov.as_matrix()[(0, 0)] < 1.0);
    assert!(cov.as_matrix()[(1, 1)] < 1.0);
    assert!(update.state.particles.iter().all(|p| p.state_vector.is_finite()));
}

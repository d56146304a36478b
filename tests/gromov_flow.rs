//! Integration tests for the Gromov particle flow updater

mod common;

use std::sync::Arc;

use common::{
    identity_model, init_logging, make_hypothesis, sample_gaussian_prior, sample_moments, seeded_rng,
};
use pflow::filters::flow::{gromov_flow, GromovFlowConfig, GromovFlowParticleUpdater};
use pflow::filters::kalman::{ExtendedKalmanUpdater, GaussianUpdater};
use pflow::models::{LinearGaussian, RangeBearingSensor, SharedMeasurementModel};
use pflow::types::hypothesis::SingleHypothesis;
use pflow::types::spaces::{Measurement, MeasurementCovariance, StateCovariance};
use pflow::types::transforms::ObservationMatrix;
use pflow::utils::FlowSchedule;
use pflow::PflowError;

#[test]
fn test_linear_flow_matches_kalman_posterior() {
    init_logging();
    let mut rng = seeded_rng(2024);
    let prior = sample_gaussian_prior(
        [0.0, 0.0],
        nalgebra::Matrix2::identity() * 0.5,
        2000,
        &mut rng,
    );
    let model = identity_model::<2>(1.0);
    let updater = GromovFlowParticleUpdater::new(model.clone());
    let hypothesis = make_hypothesis(prior.clone(), [1.0, -1.0]);

    let update = updater.update(&hypothesis, &mut rng).unwrap();

    let kalman = ExtendedKalmanUpdater::new(model)
        .update(&Arc::new(SingleHypothesis::new(
            prior.gaussian_view().unwrap(),
            hypothesis.measurement.clone(),
        )))
        .unwrap()
        .state;

    let (mean, variance) = sample_moments(&update.state);
    for i in 0..2 {
        assert!(
            (mean[i] - kalman.mean.index(i)).abs() < 0.12,
            "axis {}: flow mean {} vs kalman {}",
            i,
            mean[i],
            kalman.mean.index(i)
        );
        assert!(
            (variance[i] - kalman.covariance.as_matrix()[(i, i)]).abs() < 0.06,
            "axis {}: flow variance {} vs kalman {}",
            i,
            variance[i],
            kalman.covariance.as_matrix()[(i, i)]
        );
    }
}

#[test]
fn test_flow_preserves_weights_and_count() {
    let mut rng = seeded_rng(8);
    let mut prior = sample_gaussian_prior([3.0, 1.0], nalgebra::Matrix2::identity(), 50, &mut rng);
    for (i, particle) in prior.particles.iter_mut().enumerate() {
        particle.weight = particle.weight * pflow::types::probability::Probability::new(1.0 + i as f64);
    }
    prior.normalize().unwrap();

    let updater = GromovFlowParticleUpdater::new(identity_model::<2>(2.0));
    let update = updater
        .update(&make_hypothesis(prior.clone(), [2.0, 2.0]), &mut rng)
        .unwrap();

    assert_eq!(update.state.len(), prior.len());
    for (i, (before, after)) in prior.particles.iter().zip(&update.state.particles).enumerate() {
        assert_eq!(before.weight, after.weight);
        assert_eq!(after.parent, Some(i));
        assert_ne!(before.state_vector, after.state_vector);
    }
}

#[test]
fn test_free_function_matches_updater() {
    let mut rng = seeded_rng(4);
    let prior = sample_gaussian_prior([0.0, 0.0], nalgebra::Matrix2::identity(), 20, &mut rng);
    let model = identity_model::<2>(1.0);
    let updater = GromovFlowParticleUpdater::new(model.clone());
    let hypothesis = make_hypothesis(prior.clone(), [0.5, 0.5]);

    let via_updater = updater.update(&hypothesis, &mut seeded_rng(99)).unwrap();
    let via_function = gromov_flow(
        &prior,
        &Measurement::from_array([0.5, 0.5]),
        model.as_ref(),
        &FlowSchedule::default(),
        &mut seeded_rng(99),
    )
    .unwrap();

    assert_eq!(via_updater.state.particles, via_function);
}

#[test]
fn test_custom_schedule() {
    let mut rng = seeded_rng(17);
    let prior = sample_gaussian_prior([0.0, 0.0], nalgebra::Matrix2::identity(), 400, &mut rng);
    let config = GromovFlowConfig::new(40, 1.2);
    let updater = GromovFlowParticleUpdater::with_config(identity_model::<2>(1.0), config).unwrap();
    assert_eq!(updater.schedule().num_steps(), 40);

    let update = updater
        .update(&make_hypothesis(prior, [2.0, 0.0]), &mut rng)
        .unwrap();
    let (mean, _) = sample_moments(&update.state);

    // Kalman posterior mean is z / 2
    assert!((mean[0] - 1.0).abs() < 0.25);
    assert!(mean[1].abs() < 0.25);
}

#[test]
fn test_nonlinear_range_bearing_flow() {
    let mut rng = seeded_rng(31);
    let sensor: SharedMeasurementModel<f64, 4, 2> =
        Arc::new(RangeBearingSensor::new(0.5, 0.01));
    let prior = sample_gaussian_prior(
        [10.0, 0.0, 0.0, 0.0],
        nalgebra::Matrix4::from_diagonal(&nalgebra::vector![1.0, 1.0, 0.1, 0.1]),
        300,
        &mut rng,
    );
    let updater = GromovFlowParticleUpdater::new(sensor);

    let update = updater
        .update(&make_hypothesis(prior, [11.0, 0.0]), &mut rng)
        .unwrap();
    let (mean, variance) = sample_moments(&update.state);

    assert!(update.state.particles.iter().all(|p| p.state_vector.is_finite()));
    assert!(mean[0] > 10.3 && mean[0] < 11.3, "x mean {}", mean[0]);
    assert!(mean[1].abs() < 0.3, "y mean {}", mean[1]);
    // Bearing is precise, so the cross-range spread collapses
    assert!(variance[1] < 0.5, "y variance {}", variance[1]);
}

#[test]
fn test_singular_measurement_noise() {
    let mut rng = seeded_rng(0);
    let prior = sample_gaussian_prior([0.0, 0.0], nalgebra::Matrix2::identity(), 10, &mut rng);
    let model: SharedMeasurementModel<f64, 2, 2> = Arc::new(LinearGaussian::new(
        ObservationMatrix::identity(),
        MeasurementCovariance::zeros(),
    ));
    let updater = GromovFlowParticleUpdater::new(model);

    assert_eq!(
        updater
            .update(&make_hypothesis(prior, [0.0, 0.0]), &mut rng)
            .unwrap_err(),
        PflowError::SingularMatrix
    );
}

#[test]
fn test_particle_at_sensor_cannot_be_linearized() {
    let sensor: SharedMeasurementModel<f64, 4, 2> =
        Arc::new(RangeBearingSensor::new(1.0, 0.1));
    let prior = pflow::types::particles::ParticleState::from_state_vectors(
        vec![pflow::types::spaces::StateVector::from_array([0.0, 0.0, 0.0, 0.0]); 3],
        0.0,
    );
    let updater = GromovFlowParticleUpdater::new(sensor);

    assert_eq!(
        updater
            .update(&make_hypothesis(prior, [1.0, 0.0]), &mut seeded_rng(0))
            .unwrap_err(),
        PflowError::ModelCapability
    );
}

#[test]
fn test_fixed_prior_covariance_drives_flow() {
    // Identical particles with a fixed covariance still flow toward z
    let prior = pflow::types::particles::ParticleState::from_state_vectors(
        vec![pflow::types::spaces::StateVector::from_array([0.0, 0.0]); 200],
        0.0,
    )
    .with_fixed_covariance(StateCovariance::identity());
    let updater = GromovFlowParticleUpdater::new(identity_model::<2>(1.0));
    let mut rng = seeded_rng(6);

    let update = updater
        .update(&make_hypothesis(prior, [2.0, 2.0]), &mut rng)
        .unwrap();
    let (mean, _) = sample_moments(&update.state);

    assert!(mean[0] > 0.5 && mean[1] > 0.5);
    assert!(update.state.fixed_covariance.is_none());
}

#[test]
fn test_predict_measurement_matches_particle_updater() {
    let mut rng = seeded_rng(12);
    let prior = sample_gaussian_prior([1.0, 0.0], nalgebra::Matrix2::identity(), 30, &mut rng);
    let model = identity_model::<2>(1.0);

    let flow = GromovFlowParticleUpdater::new(model.clone());
    let plain = pflow::filters::particle::ParticleUpdater::new(model);

    let a = flow.predict_measurement(&prior, None).unwrap();
    let b = plain.predict_measurement(&prior, None).unwrap();
    assert_eq!(*a, *b);
    assert!(Arc::ptr_eq(&a, &flow.predict_measurement(&prior, None).unwrap()));
}

//! Detections and single-target hypotheses
//!
//! A hypothesis pairs a predicted state with the detection it was associated
//! with. Association itself happens upstream; updaters consume the result.

use std::collections::BTreeMap;

use nalgebra::RealField;
use num_traits::Float;

use super::gaussian::GaussianState;
use super::particles::ParticleState;
use super::spaces::Measurement;
use crate::models::SharedMeasurementModel;

/// A measurement produced by a sensor or detector.
#[derive(Debug, Clone)]
pub struct Detection<T: RealField + Float + Copy, const N: usize, const M: usize> {
    pub measurement: Measurement<T, M>,
    /// Time of the measurement in seconds
    pub timestamp: T,
    /// Free-form detector output such as confidence or class label
    pub metadata: BTreeMap<String, String>,
    /// Overrides the updater's measurement model when set
    pub measurement_model: Option<SharedMeasurementModel<T, N, M>>,
}

impl<T: RealField + Float + Copy, const N: usize, const M: usize> Detection<T, N, M> {
    #[inline]
    pub fn new(measurement: Measurement<T, M>, timestamp: T) -> Self {
        Self {
            measurement,
            timestamp,
            metadata: BTreeMap::new(),
            measurement_model: None,
        }
    }

    /// Attaches a detection-specific measurement model.
    #[inline]
    pub fn with_model(mut self, model: SharedMeasurementModel<T, N, M>) -> Self {
        self.measurement_model = Some(model);
        self
    }

    #[inline]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A prediction paired with one detection.
#[derive(Debug, Clone)]
pub struct SingleHypothesis<P, T: RealField + Float + Copy, const N: usize, const M: usize> {
    pub prediction: P,
    pub measurement: Detection<T, N, M>,
}

impl<P, T: RealField + Float + Copy, const N: usize, const M: usize> SingleHypothesis<P, T, N, M> {
    #[inline]
    pub fn new(prediction: P, measurement: Detection<T, N, M>) -> Self {
        Self {
            prediction,
            measurement,
        }
    }
}

/// Hypothesis over a particle prediction.
pub type ParticleHypothesis<T, const N: usize, const M: usize> =
    SingleHypothesis<ParticleState<T, N>, T, N, M>;

/// Hypothesis over a Gaussian prediction.
pub type GaussianHypothesis<T, const N: usize, const M: usize> =
    SingleHypothesis<GaussianState<T, N>, T, N, M>;

//! Range sensor model.
//!
//! Compares each particle's expected front/bottom readings with the actual observation and
//! turns the mean squared range error into an importance weight, `1 / (error + floor)`.
//! The median of those errors is fed back into the next cycle, where it controls an
//! adaptive positional jitter:
//!
//! $$
//! \sigma = b + \frac{g}{1 + s e^{-r \cdot \tilde{e}}}
//! $$
//!
//! with $\tilde{e}$ the previous cycle's median squared error and the defaults $b = 1$,
//! $g = 15$, $s = 10$, $r = 0.01$. Small errors give a tight spread around the current
//! population; large errors widen it so the filter can re-acquire the agent. The formula is
//! a tuning heuristic and every coefficient is configurable.
use log::trace;
use nalgebra::DVector;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::barrier::{BarrierCorrector, ExpectedReadings};
use crate::particle::{ParticleSet, WeightVector};

/// Actual readings of the front and bottom range sensors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub front: f64,
    pub bottom: f64,
}
impl Observation {
    pub fn new(front: f64, bottom: f64) -> Self {
        Observation { front, bottom }
    }
}
impl From<(f64, f64)> for Observation {
    fn from(tuple: (f64, f64)) -> Self {
        Observation::new(tuple.0, tuple.1)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveJitterConfig {
    pub enabled: bool,
    pub base_std: f64,
    pub gain: f64,
    pub scale: f64,
    pub rate: f64,
}
impl Default for AdaptiveJitterConfig {
    fn default() -> Self {
        AdaptiveJitterConfig {
            enabled: true,
            base_std: 1.0,
            gain: 15.0,
            scale: 10.0,
            rate: 0.01,
        }
    }
}
impl AdaptiveJitterConfig {
    /// Jitter standard deviation for the previous cycle's median error.
    pub fn std_dev(&self, median_error: f64) -> f64 {
        let sd = self.base_std + self.gain / (1.0 + self.scale * (-self.rate * median_error).exp());
        if sd.is_finite() {
            sd.max(0.0)
        } else {
            (self.base_std + self.gain).max(0.0)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorModelConfig {
    /// Added to every mean squared error before inversion.
    pub error_floor: f64,
    pub jitter: AdaptiveJitterConfig,
}
impl Default for SensorModelConfig {
    fn default() -> Self {
        SensorModelConfig {
            error_floor: 1e-9,
            jitter: AdaptiveJitterConfig::default(),
        }
    }
}

/// Result of weighing a population against one observation.
#[derive(Clone, Debug)]
pub struct SensorUpdate {
    /// Raw, unnormalized weights.
    pub weights: WeightVector,
    /// Median of the per-particle mean squared range error.
    pub median_error: Option<f64>,
    pub readings: ExpectedReadings,
    /// Jitter spread applied this cycle, if any.
    pub jitter_std: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct SensorModel {
    config: SensorModelConfig,
}
impl SensorModel {
    pub fn new(config: SensorModelConfig) -> Self {
        SensorModel { config }
    }
    pub fn config(&self) -> &SensorModelConfig {
        &self.config
    }
    /// Apply the adaptive jitter. Nothing happens without a previous error signal.
    pub fn jitter<R: Rng + ?Sized>(
        &self,
        particles: &mut ParticleSet,
        last_median_error: Option<f64>,
        rng: &mut R,
    ) -> Option<f64> {
        if !self.config.jitter.enabled {
            return None;
        }
        let sd = self.config.jitter.std_dev(last_median_error?);
        particles.perturb(sd, sd, rng);
        Some(sd)
    }
    /// Per-particle mean of the two squared range errors.
    pub fn squared_errors(readings: &ExpectedReadings, observation: &Observation) -> DVector<f64> {
        readings.front.zip_map(&readings.bottom, |front, bottom| {
            ((observation.front - front).powi(2) + (observation.bottom - bottom).powi(2)) / 2.0
        })
    }
    /// Invert squared errors into raw weights.
    pub fn weights_from_errors(&self, errors: &DVector<f64>) -> WeightVector {
        let floor = if self.config.error_floor.is_finite() && self.config.error_floor > 0.0 {
            self.config.error_floor
        } else {
            SensorModelConfig::default().error_floor
        };
        WeightVector::from(errors.map(|e| 1.0 / (e + floor)))
    }
    /// Jitter (from the second cycle on), predict readings, and weigh every particle.
    pub fn update<R: Rng + ?Sized>(
        &self,
        particles: &mut ParticleSet,
        corrector: &BarrierCorrector,
        observation: &Observation,
        last_median_error: Option<f64>,
        rng: &mut R,
    ) -> SensorUpdate {
        let jitter_std = self.jitter(particles, last_median_error, rng);
        let readings = corrector.expected_readings(particles);
        let errors = Self::squared_errors(&readings, observation);
        let median_error = median(errors.as_slice());
        trace!(
            "Sensor update: jitter {:?}, median squared error {:?}",
            jitter_std, median_error
        );
        SensorUpdate {
            weights: self.weights_from_errors(&errors),
            median_error,
            readings,
            jitter_std,
        }
    }
}

/// Median of `values`; the mean of the two middle values for even lengths.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

//! Odometry-driven motion model.
//!
//! Each particle is advanced by the reported displacement `(vx, vy)` (dead reckoning) and
//! then spread with zero-mean Gaussian process noise whose size follows the reported
//! odometry variance, scaled by an amplification factor that keeps the population from
//! starving when the odometry is over-confident.
use log::{trace, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::particle::ParticleSet;

/// Smallest variance fed to any noise generator.
pub const MIN_VARIANCE: f64 = 1e-3;

/// Per-axis displacement since the last cycle and the variance of that displacement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    pub vx: f64,
    pub vy: f64,
    pub var_vx: f64,
    pub var_vy: f64,
}
impl Odometry {
    pub fn new(vx: f64, vy: f64, var_vx: f64, var_vy: f64) -> Self {
        Odometry {
            vx,
            vy,
            var_vx,
            var_vy,
        }
    }
}
impl From<(f64, f64, f64, f64)> for Odometry {
    fn from(tuple: (f64, f64, f64, f64)) -> Self {
        let (vx, vy, var_vx, var_vy) = tuple;
        Odometry::new(vx, vy, var_vx, var_vy)
    }
}
impl From<[f64; 4]> for Odometry {
    fn from(values: [f64; 4]) -> Self {
        Odometry::new(values[0], values[1], values[2], values[3])
    }
}

/// How the reported odometry variance is turned into a noise spread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NoiseInterpretation {
    /// Spread is the square root of the variance.
    #[default]
    StandardDeviation,
    /// Spread is the variance value itself.
    Variance,
}
impl NoiseInterpretation {
    /// Spread for `variance`, after flooring it at `min_variance`.
    pub fn spread(&self, variance: f64, min_variance: f64) -> f64 {
        let floor = if min_variance.is_finite() && min_variance > 0.0 {
            min_variance
        } else {
            MIN_VARIANCE
        };
        let variance = if variance.is_finite() && variance > floor {
            variance
        } else {
            floor
        };
        match self {
            NoiseInterpretation::StandardDeviation => variance.sqrt(),
            NoiseInterpretation::Variance => variance,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionModelConfig {
    /// Multiplier on the odometry noise spread.
    pub amplification: f64,
    pub noise_interpretation: NoiseInterpretation,
    pub min_variance: f64,
}
impl Default for MotionModelConfig {
    fn default() -> Self {
        MotionModelConfig {
            amplification: 1.5,
            noise_interpretation: NoiseInterpretation::StandardDeviation,
            min_variance: MIN_VARIANCE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MotionModel {
    config: MotionModelConfig,
}
impl MotionModel {
    pub fn new(config: MotionModelConfig) -> Self {
        MotionModel { config }
    }
    pub fn config(&self) -> &MotionModelConfig {
        &self.config
    }
    /// Standard deviation of the process noise for one axis.
    pub fn noise_std(&self, variance: f64) -> f64 {
        let amplification = if self.config.amplification.is_finite() {
            self.config.amplification.abs()
        } else {
            warn!(
                "Non-finite motion noise amplification {}; using 1.0",
                self.config.amplification
            );
            1.0
        };
        amplification
            * self
                .config
                .noise_interpretation
                .spread(variance, self.config.min_variance)
    }
    /// Dead-reckon every particle by the odometry displacement, then add process noise.
    pub fn propagate<R: Rng + ?Sized>(
        &self,
        particles: &mut ParticleSet,
        odometry: &Odometry,
        rng: &mut R,
    ) {
        let std_x = self.noise_std(odometry.var_vx);
        let std_y = self.noise_std(odometry.var_vy);
        trace!(
            "Motion update: displacement ({:.3}, {:.3}), noise std ({:.3}, {:.3})",
            odometry.vx, odometry.vy, std_x, std_y
        );
        particles.translate(odometry.vx, odometry.vy);
        particles.perturb(std_x, std_y, rng);
    }
}

//! Monte Carlo localization of a planar agent from odometry and two range sensors
//!
//! This crate estimates the 2D position of a mobile agent with a particle filter. Each cycle the
//! filter consumes one odometry reading (per-axis displacement and its variance) and one pair of
//! range readings: a "front" sensor looking along +x and a "bottom" sensor looking along +y, both
//! measured against the far edges of a rectangular field. Rectangular barriers inside the field
//! occlude those rays. The crate does not load maps, drive sensors or render anything; it is the
//! estimation core that an outer control loop calls once per sensor cycle.
//!
//! The crate is built on three dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): column storage for the particle population and
//!   the bulk vector arithmetic of every pipeline stage.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   random number generation for resampling, process noise and jitter.
//!
//! All other functionality is built on top of these crates or is auxiliary (configuration files,
//! CSV replay).
//!
//! ## Crate overview
//!
//! - [particle]: the particle population, weights, resampling strategies, normalization and pose
//!   extraction.
//! - [motion]: the odometry motion model.
//! - [barrier]: map bounds, barriers and obstacle-aware expected range readings.
//! - [measurements]: the range sensor model and its adaptive jitter.
//! - [filter]: the per-cycle pipeline and the [`filter::MonteCarloLocalizer`].
//! - [config]: replay configuration and its JSON/YAML/TOML representations.
//! - [sim]: CSV cycle logs, replay and synthetic tracks.
//!
//! ## Filter cycle
//!
//! Given the previous posterior $\{(x_i, w_i)\}_{i=1}^N$, odometry $(v_x, v_y, \sigma^2_x, \sigma^2_y)$
//! and an observation $(z_f, z_b)$, a cycle
//!
//! 1. draws $N$ ancestors with $P(i) = w_i$,
//! 2. moves every particle by $(v_x, v_y)$ plus Gaussian noise of spread $k \sqrt{\sigma^2}$ per axis,
//! 3. predicts the readings $\hat{z}_{f,i}, \hat{z}_{b,i}$ (distance to the map edge or to the nearest
//!    occluding barrier face) and sets
//!
//! $$
//! w_i = \left( \frac{(z_f - \hat{z}_{f,i})^2 + (z_b - \hat{z}_{b,i})^2}{2} + \epsilon \right)^{-1}
//! $$
//!
//! 4. normalizes the weights (falling back to $1/N$ when they carry no usable mass), and
//! 5. reports the weighted mean $\hat{x} = \sum_i w_i x_i$.
//!
//! From the second cycle on, particles are also jittered before prediction, with a spread driven by
//! the previous cycle's median error (see [measurements]).
pub mod barrier;
pub mod config;
pub mod filter;
pub mod measurements;
pub mod motion;
pub mod particle;
pub mod sim;

pub use barrier::{Barrier, BarrierCorrector, MapBounds};
pub use filter::{CycleOutput, FilterState, MclConfig, MonteCarloLocalizer};
pub use measurements::Observation;
pub use motion::Odometry;
pub use particle::{ParticleSet, WeightVector};

/// Product of two one-dimensional Gaussians.
///
/// Returns the mean and variance of $\mathcal{N}(\mu_1, \sigma^2_1) \cdot \mathcal{N}(\mu_2, \sigma^2_2)$:
///
/// $$
/// \mu = \frac{\sigma^2_1 \mu_2 + \sigma^2_2 \mu_1}{\sigma^2_1 + \sigma^2_2}, \quad
/// \sigma^2 = \left( \frac{1}{\sigma^2_1} + \frac{1}{\sigma^2_2} \right)^{-1}
/// $$
///
/// Non-positive (or NaN) variances are replaced by `var_min`.
pub fn fuse_gaussians(mu1: f64, var1: f64, mu2: f64, var2: f64, var_min: f64) -> (f64, f64) {
    let var1 = if var1 > 0.0 { var1 } else { var_min };
    let var2 = if var2 > 0.0 { var2 } else { var_min };
    let mean = (var1 * mu2 + var2 * mu1) / (var1 + var2);
    let variance = 1.0 / (1.0 / var1 + 1.0 / var2);
    (mean, variance)
}

//! Particle population, importance resampling, weight normalization and pose extraction.
//!
//! The population is stored column-wise: one [`DVector`] of x coordinates and one of y
//! coordinates, index-aligned with a [`WeightVector`]. Every bulk operation in the filter
//! (translation, noise, weighting, pose extraction) is then a vector operation over these
//! columns rather than a loop over individual particle structs.
use log::warn;
use nalgebra::{DVector, Matrix2, Vector2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Default population size.
pub const DEFAULT_PARTICLE_COUNT: usize = 250;

/// Fixed-size population of planar position hypotheses.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleSet {
    x: DVector<f64>,
    y: DVector<f64>,
}
impl Display for ParticleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.len().max(1) as f64;
        f.debug_struct("ParticleSet")
            .field("num_particles", &self.len())
            .field(
                "centroid",
                &format_args!("({:.3}, {:.3})", self.x.sum() / n, self.y.sum() / n),
            )
            .finish()
    }
}
impl ParticleSet {
    pub fn new(x: DVector<f64>, y: DVector<f64>) -> Self {
        assert_eq!(
            x.len(),
            y.len(),
            "Particle x and y columns must have the same length"
        );
        ParticleSet { x, y }
    }
    pub fn from_points(points: &[Vector2<f64>]) -> Self {
        ParticleSet {
            x: DVector::from_iterator(points.len(), points.iter().map(|p| p.x)),
            y: DVector::from_iterator(points.len(), points.iter().map(|p| p.y)),
        }
    }
    /// `n` copies of a single position.
    pub fn repeat(point: Vector2<f64>, n: usize) -> Self {
        ParticleSet {
            x: DVector::from_element(n, point.x),
            y: DVector::from_element(n, point.y),
        }
    }
    /// Scatter `n` particles around `center` with independent per-axis Gaussian offsets.
    ///
    /// `spread` holds the standard deviation for each axis. Negative or non-finite spreads
    /// are treated as zero.
    pub fn scatter<R: Rng + ?Sized>(
        center: Vector2<f64>,
        spread: Vector2<f64>,
        n: usize,
        rng: &mut R,
    ) -> Self {
        let sx = sanitize_spread(spread.x);
        let sy = sanitize_spread(spread.y);
        let x = DVector::from_fn(n, |_, _| center.x + rng.sample::<f64, _>(StandardNormal) * sx);
        let y = DVector::from_fn(n, |_, _| center.y + rng.sample::<f64, _>(StandardNormal) * sy);
        ParticleSet { x, y }
    }
    pub fn len(&self) -> usize {
        self.x.len()
    }
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }
    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }
    pub fn x_mut(&mut self) -> &mut DVector<f64> {
        &mut self.x
    }
    pub fn y_mut(&mut self) -> &mut DVector<f64> {
        &mut self.y
    }
    pub fn get(&self, index: usize) -> Option<Vector2<f64>> {
        if index < self.len() {
            Some(Vector2::new(self.x[index], self.y[index]))
        } else {
            None
        }
    }
    pub fn iter(&self) -> impl Iterator<Item = Vector2<f64>> + '_ {
        self.x
            .iter()
            .zip(self.y.iter())
            .map(|(&x, &y)| Vector2::new(x, y))
    }
    /// Build a new population from the particles at `indices` (duplicates allowed).
    pub fn gather(&self, indices: &[usize]) -> Self {
        ParticleSet {
            x: DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.x[i])),
            y: DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.y[i])),
        }
    }
    /// Shift every particle by `(dx, dy)`.
    pub fn translate(&mut self, dx: f64, dy: f64) {
        self.x.add_scalar_mut(dx);
        self.y.add_scalar_mut(dy);
    }
    /// Add independent zero-mean Gaussian noise with per-axis standard deviations.
    pub fn perturb<R: Rng + ?Sized>(&mut self, std_x: f64, std_y: f64, rng: &mut R) {
        let n = self.len();
        let sx = sanitize_spread(std_x);
        let sy = sanitize_spread(std_y);
        let noise_x = DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal) * sx);
        let noise_y = DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal) * sy);
        self.x += noise_x;
        self.y += noise_y;
    }
}

fn sanitize_spread(std: f64) -> f64 {
    if std.is_finite() && std > 0.0 { std } else { 0.0 }
}

/// Importance weights, index-aligned with a [`ParticleSet`].
#[derive(Clone, Debug, PartialEq)]
pub struct WeightVector(DVector<f64>);
impl WeightVector {
    pub fn uniform(n: usize) -> Self {
        WeightVector(DVector::from_element(n, 1.0 / n.max(1) as f64))
    }
    pub fn from_vec(weights: Vec<f64>) -> Self {
        WeightVector(DVector::from_vec(weights))
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn values(&self) -> &DVector<f64> {
        &self.0
    }
    pub fn as_slice(&self) -> &[f64] {
        self.0.as_slice()
    }
    pub fn sum(&self) -> f64 {
        self.0.sum()
    }
    pub fn iter(&self) -> impl Iterator<Item = &f64> + '_ {
        self.0.iter()
    }
    /// Rescale to a probability distribution. See [`normalize_weights`].
    pub fn normalize(&mut self) -> bool {
        normalize_weights(self)
    }
    /// N_eff = 1 / sum(w_i^2)
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares = self.0.norm_squared();
        if sum_of_squares > 0.0 && sum_of_squares.is_finite() {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
    pub fn min(&self) -> f64 {
        self.0.iter().cloned().fold(f64::INFINITY, f64::min)
    }
    pub fn max(&self) -> f64 {
        self.0.iter().cloned().fold(0.0, f64::max)
    }
}
impl From<DVector<f64>> for WeightVector {
    fn from(weights: DVector<f64>) -> Self {
        WeightVector(weights)
    }
}
impl From<Vec<f64>> for WeightVector {
    fn from(weights: Vec<f64>) -> Self {
        WeightVector::from_vec(weights)
    }
}

/// Divide every weight by the total so the vector sums to one.
///
/// NaN and negative entries count as zero. When the total is zero or not finite the
/// vector is reset to the uniform distribution and `true` is returned.
pub fn normalize_weights(weights: &mut WeightVector) -> bool {
    let n = weights.len();
    if n == 0 {
        return false;
    }
    weights
        .0
        .apply(|w| *w = if w.is_nan() || *w < 0.0 { 0.0 } else { *w });
    let sum = weights.0.sum();
    if sum > 0.0 && sum.is_finite() {
        weights.0 /= sum;
        false
    } else {
        warn!(
            "Weight total {} is degenerate; resetting {} weights to uniform",
            sum, n
        );
        weights.0.fill(1.0 / n as f64);
        true
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}
impl ParticleAveragingStrategy {
    pub fn estimate(&self, particles: &ParticleSet, weights: &WeightVector) -> Vector2<f64> {
        match self {
            ParticleAveragingStrategy::WeightedAverage => estimate_pose(particles, weights),
            ParticleAveragingStrategy::UnweightedAverage => {
                let n = particles.len().max(1) as f64;
                Vector2::new(particles.x.sum() / n, particles.y.sum() / n)
            }
            ParticleAveragingStrategy::HighestWeight => weights
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .and_then(|(i, _)| particles.get(i))
                .unwrap_or_else(|| estimate_pose(particles, weights)),
        }
    }
}

/// Weighted mean position, `(sum w_i x_i, sum w_i y_i)`.
pub fn estimate_pose(particles: &ParticleSet, weights: &WeightVector) -> Vector2<f64> {
    assert_eq!(
        particles.len(),
        weights.len(),
        "Particles and weights must be index-aligned"
    );
    Vector2::new(weights.0.dot(&particles.x), weights.0.dot(&particles.y))
}

/// Weighted 2x2 covariance of the population about its weighted mean.
pub fn estimate_covariance(particles: &ParticleSet, weights: &WeightVector) -> Matrix2<f64> {
    let mean = estimate_pose(particles, weights);
    let dx = particles.x.add_scalar(-mean.x);
    let dy = particles.y.add_scalar(-mean.y);
    let wdx = dx.component_mul(&weights.0);
    let wdy = dy.component_mul(&weights.0);
    let cxy = wdx.dot(&dy);
    Matrix2::new(wdx.dot(&dx), cxy, cxy, wdy.dot(&dy))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    /// Keep the population as is.
    Naive,
    #[default]
    Multinomial,
    Systematic,
    Stratified,
    Residual,
}
impl ParticleResamplingStrategy {
    /// Draw `weights.len()` ancestor indices.
    pub fn resample_indices<R: Rng + ?Sized>(
        &self,
        weights: &WeightVector,
        rng: &mut R,
    ) -> Vec<usize> {
        let w = weights.as_slice();
        match self {
            ParticleResamplingStrategy::Naive => (0..w.len()).collect(),
            ParticleResamplingStrategy::Multinomial => multinomial_resample(w, rng),
            ParticleResamplingStrategy::Systematic => systematic_resample(w, rng),
            ParticleResamplingStrategy::Stratified => stratified_resample(w, rng),
            ParticleResamplingStrategy::Residual => residual_resample(w, rng),
        }
    }
    /// Importance-resample `particles`. Weights are left untouched.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        particles: &ParticleSet,
        weights: &WeightVector,
        rng: &mut R,
    ) -> ParticleSet {
        assert_eq!(
            particles.len(),
            weights.len(),
            "Particles and weights must be index-aligned"
        );
        particles.gather(&self.resample_indices(weights, rng))
    }
}

/// Normalized cumulative distribution of `weights`, or `None` if the weights carry no
/// usable mass.
fn cumulative_distribution(weights: &[f64]) -> Option<Vec<f64>> {
    let mut total = 0.0;
    let mut cdf = Vec::with_capacity(weights.len());
    for &w in weights {
        if w.is_finite() && w > 0.0 {
            total += w;
        }
        cdf.push(total);
    }
    if total > 0.0 && total.is_finite() {
        for c in cdf.iter_mut() {
            *c /= total;
        }
        Some(cdf)
    } else {
        None
    }
}

fn select(cdf: &[f64], u: f64) -> usize {
    cdf.partition_point(|&c| c <= u).min(cdf.len() - 1)
}

fn uniform_indices<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    warn!("Resampling from degenerate weights; drawing {} indices uniformly", n);
    (0..n).map(|_| rng.random_range(0..n)).collect()
}

/// N independent draws with replacement, `P(i) = w_i`.
pub fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    match cumulative_distribution(weights) {
        Some(cdf) => (0..n).map(|_| select(&cdf, rng.random::<f64>())).collect(),
        None => uniform_indices(n, rng),
    }
}

/// One uniform offset, N evenly spaced pointers.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    match cumulative_distribution(weights) {
        Some(cdf) => {
            let step = 1.0 / n as f64;
            let offset = rng.random::<f64>() * step;
            (0..n)
                .map(|i| select(&cdf, offset + i as f64 * step))
                .collect()
        }
        None => uniform_indices(n, rng),
    }
}

/// One uniform draw inside each of N equal strata.
pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    match cumulative_distribution(weights) {
        Some(cdf) => (0..n)
            .map(|i| select(&cdf, (i as f64 + rng.random::<f64>()) / n as f64))
            .collect(),
        None => uniform_indices(n, rng),
    }
}

/// Deterministic `floor(N w_i)` copies, remainder drawn systematically from the residuals.
pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    let Some(cdf) = cumulative_distribution(weights) else {
        return uniform_indices(n, rng);
    };
    // Recover the normalized weights from the cdf so bad entries are already zeroed.
    let normalized: Vec<f64> = cdf
        .iter()
        .scan(0.0, |prev, &c| {
            let w = c - *prev;
            *prev = c;
            Some(w.max(0.0))
        })
        .collect();
    let mut indices = Vec::with_capacity(n);
    let mut residual = vec![0.0; n];
    for (i, &w) in normalized.iter().enumerate() {
        let copies = (w * n as f64).floor() as usize;
        residual[i] = w * n as f64 - copies as f64;
        for _ in 0..copies {
            if indices.len() < n {
                indices.push(i);
            }
        }
    }
    let remaining = n - indices.len();
    if remaining > 0 {
        match cumulative_distribution(&residual) {
            Some(residual_cdf) => {
                let step = 1.0 / remaining as f64;
                let offset = rng.random::<f64>() * step;
                for j in 0..remaining {
                    indices.push(select(&residual_cdf, offset + j as f64 * step));
                }
            }
            None => {
                for j in 0..remaining {
                    indices.push(select(&cdf, (j as f64 + 0.5) / remaining as f64));
                }
            }
        }
    }
    indices
}

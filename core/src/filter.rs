//! Monte Carlo localization: the per-cycle pipeline and the filter that owns its state.
//!
//! A cycle consumes one odometry reading and one range observation and runs, in order:
//!
//! 1. importance resampling of the previous posterior,
//! 2. the motion model (dead reckoning plus process noise),
//! 3. the sensor model (adaptive jitter, barrier-corrected expected readings, weighting),
//! 4. weight normalization,
//! 5. pose extraction.
//!
//! [`run_cycle`] is a pure step over an explicit [`FilterState`]; [`MonteCarloLocalizer`]
//! wraps it with configuration, models and a random number generator.
use anyhow::{Result, bail};
use log::{debug, info};
use nalgebra::{Matrix2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

use crate::barrier::{Barrier, BarrierCorrector, MapBounds};
use crate::measurements::{Observation, SensorModel, SensorModelConfig};
use crate::motion::{MotionModel, MotionModelConfig, Odometry};
use crate::particle::{
    DEFAULT_PARTICLE_COUNT, ParticleAveragingStrategy, ParticleResamplingStrategy, ParticleSet,
    WeightVector, estimate_covariance, normalize_weights,
};

/// Where the initial particle cloud is centered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InitialPlacement {
    /// Around the caller's initial position guess.
    #[default]
    Guess,
    /// Around a point drawn uniformly inside the map bounds; the guess is ignored.
    Random,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MclConfig {
    pub num_particles: usize,
    pub initial_placement: InitialPlacement,
    /// Per-axis standard deviation of the initial cloud.
    pub initial_spread: [f64; 2],
    pub resampling_strategy: ParticleResamplingStrategy,
    pub averaging_strategy: ParticleAveragingStrategy,
    /// Random seed, 0 draws one from the operating system.
    pub seed: u64,
    pub motion: MotionModelConfig,
    pub sensor: SensorModelConfig,
}
impl Default for MclConfig {
    fn default() -> Self {
        MclConfig {
            num_particles: DEFAULT_PARTICLE_COUNT,
            initial_placement: InitialPlacement::Guess,
            initial_spread: [150.0, 80.0],
            resampling_strategy: ParticleResamplingStrategy::Multinomial,
            averaging_strategy: ParticleAveragingStrategy::WeightedAverage,
            seed: 0,
            motion: MotionModelConfig::default(),
            sensor: SensorModelConfig::default(),
        }
    }
}
impl MclConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            bail!("num_particles must be positive");
        }
        if self
            .initial_spread
            .iter()
            .any(|s| !s.is_finite() || *s < 0.0)
        {
            bail!(
                "initial_spread must be finite and non-negative, got {:?}",
                self.initial_spread
            );
        }
        if !self.motion.amplification.is_finite() || self.motion.amplification < 0.0 {
            bail!(
                "motion.amplification must be finite and non-negative, got {}",
                self.motion.amplification
            );
        }
        if !self.motion.min_variance.is_finite() || self.motion.min_variance <= 0.0 {
            bail!(
                "motion.min_variance must be positive, got {}",
                self.motion.min_variance
            );
        }
        if !self.sensor.error_floor.is_finite() || self.sensor.error_floor <= 0.0 {
            bail!(
                "sensor.error_floor must be positive, got {}",
                self.sensor.error_floor
            );
        }
        let jitter = &self.sensor.jitter;
        if [jitter.base_std, jitter.gain, jitter.scale, jitter.rate]
            .iter()
            .any(|v| !v.is_finite())
        {
            bail!("sensor.jitter coefficients must be finite");
        }
        Ok(())
    }
}

/// Everything the filter carries from one cycle to the next.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    pub particles: ParticleSet,
    pub weights: WeightVector,
    /// Median squared range error of the last completed cycle.
    pub last_median_error: Option<f64>,
    /// Odometry variances `(var_vx, var_vy)` of the last completed cycle.
    pub last_variances: Option<(f64, f64)>,
}
impl FilterState {
    /// Uniformly weighted population, no feedback yet.
    pub fn new(particles: ParticleSet) -> Self {
        let weights = WeightVector::uniform(particles.len());
        FilterState {
            particles,
            weights,
            last_median_error: None,
            last_variances: None,
        }
    }
    /// Scatter `num_particles` around `center` with per-axis Gaussian `spread`.
    pub fn initialize<R: Rng + ?Sized>(
        center: Vector2<f64>,
        spread: Vector2<f64>,
        num_particles: usize,
        rng: &mut R,
    ) -> Self {
        FilterState::new(ParticleSet::scatter(center, spread, num_particles, rng))
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
}

/// Borrowed stage models for one cycle.
#[derive(Clone, Copy)]
pub struct CycleModels<'a> {
    pub resampling: ParticleResamplingStrategy,
    pub averaging: ParticleAveragingStrategy,
    pub motion: &'a MotionModel,
    pub sensor: &'a SensorModel,
    pub corrector: &'a BarrierCorrector,
}

/// Output of one cycle: the pose plus diagnostics.
#[derive(Clone, Debug)]
pub struct CycleOutput {
    pub pose: Vector2<f64>,
    pub particles: ParticleSet,
    pub weights: WeightVector,
    pub last_median_error: Option<f64>,
    pub effective_sample_size: f64,
    /// The raw weights were degenerate and were replaced by a uniform distribution.
    pub uniform_fallback: bool,
}

/// Run one resample / move / weigh / normalize / estimate cycle.
pub fn run_cycle<R: Rng + ?Sized>(
    state: &FilterState,
    models: &CycleModels<'_>,
    odometry: &Odometry,
    observation: &Observation,
    rng: &mut R,
) -> (FilterState, CycleOutput) {
    let mut particles = models
        .resampling
        .resample(&state.particles, &state.weights, rng);
    models.motion.propagate(&mut particles, odometry, rng);
    let update = models.sensor.update(
        &mut particles,
        models.corrector,
        observation,
        state.last_median_error,
        rng,
    );
    let mut weights = update.weights;
    let uniform_fallback = normalize_weights(&mut weights);
    let pose = models.averaging.estimate(&particles, &weights);
    let effective_sample_size = weights.effective_sample_size();
    debug!(
        "Cycle: pose ({:.3}, {:.3}), median error {:?}, N_eff {:.1}/{}",
        pose.x,
        pose.y,
        update.median_error,
        effective_sample_size,
        weights.len()
    );
    let next = FilterState {
        particles,
        weights,
        last_median_error: update.median_error,
        last_variances: Some((odometry.var_vx, odometry.var_vy)),
    };
    let output = CycleOutput {
        pose,
        particles: next.particles.clone(),
        weights: next.weights.clone(),
        last_median_error: next.last_median_error,
        effective_sample_size,
        uniform_fallback,
    };
    (next, output)
}

/// Range-aided Monte Carlo localization filter.
///
/// # Example
///
/// ```rust
/// use mcl::barrier::{Barrier, MapBounds};
/// use mcl::filter::{MclConfig, MonteCarloLocalizer};
/// use mcl::measurements::Observation;
/// use mcl::motion::Odometry;
/// use nalgebra::Vector2;
///
/// let config = MclConfig { seed: 7, ..Default::default() };
/// let mut mcl = MonteCarloLocalizer::new(
///     Vector2::new(100.0, 100.0),
///     MapBounds::new(400.0, 300.0),
///     vec![Barrier::new(250.0, 50.0, 20.0, 100.0)],
///     config,
/// );
/// let out = mcl.update(&Odometry::new(1.0, 0.0, 0.1, 0.1), &Observation::new(149.0, 200.0));
/// assert!(out.pose.x.is_finite() && out.pose.y.is_finite());
/// ```
pub struct MonteCarloLocalizer {
    config: MclConfig,
    state: FilterState,
    motion: MotionModel,
    sensor: SensorModel,
    corrector: BarrierCorrector,
    estimate: Vector2<f64>,
    rng: StdRng,
}
impl Debug for MonteCarloLocalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonteCarloLocalizer")
            .field("num_particles", &self.state.len())
            .field(
                "effective_particles",
                &self.state.weights.effective_sample_size(),
            )
            .field(
                "weight_range",
                &format_args!(
                    "[{:.4e}, {:.4e}]",
                    self.state.weights.min(),
                    self.state.weights.max()
                ),
            )
            .field(
                "estimate",
                &format_args!("({:.3}, {:.3})", self.estimate.x, self.estimate.y),
            )
            .field("last_median_error", &self.state.last_median_error)
            .field("barriers", &self.corrector.barriers().len())
            .finish()
    }
}
impl MonteCarloLocalizer {
    /// Create a filter scattered around `initial_guess` (or a random point, see
    /// [`InitialPlacement`]).
    pub fn new(
        initial_guess: Vector2<f64>,
        bounds: MapBounds,
        barriers: Vec<Barrier>,
        config: MclConfig,
    ) -> Self {
        assert!(
            config.num_particles > 0,
            "Number of particles must be positive"
        );
        let seed = if config.seed == 0 {
            rand::random()
        } else {
            config.seed
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let center = match config.initial_placement {
            InitialPlacement::Guess => initial_guess,
            InitialPlacement::Random => Vector2::new(
                rng.random::<f64>() * bounds.width.max(0.0),
                rng.random::<f64>() * bounds.height.max(0.0),
            ),
        };
        info!(
            "Initializing {} particles around ({:.2}, {:.2}) ({:?} placement)",
            config.num_particles, center.x, center.y, config.initial_placement
        );
        let spread = Vector2::new(config.initial_spread[0], config.initial_spread[1]);
        let state = FilterState::initialize(center, spread, config.num_particles, &mut rng);
        Self::from_state(state, bounds, barriers, config, rng)
    }
    /// Resume from an explicit state.
    pub fn with_state(
        state: FilterState,
        bounds: MapBounds,
        barriers: Vec<Barrier>,
        config: MclConfig,
    ) -> Self {
        assert!(!state.is_empty(), "Number of particles must be positive");
        assert_eq!(
            state.particles.len(),
            state.weights.len(),
            "Particles and weights must be index-aligned"
        );
        let seed = if config.seed == 0 {
            rand::random()
        } else {
            config.seed
        };
        Self::from_state(state, bounds, barriers, config, StdRng::seed_from_u64(seed))
    }
    fn from_state(
        state: FilterState,
        bounds: MapBounds,
        barriers: Vec<Barrier>,
        config: MclConfig,
        rng: StdRng,
    ) -> Self {
        let estimate = config
            .averaging_strategy
            .estimate(&state.particles, &state.weights);
        MonteCarloLocalizer {
            motion: MotionModel::new(config.motion.clone()),
            sensor: SensorModel::new(config.sensor.clone()),
            corrector: BarrierCorrector::new(bounds, barriers),
            config,
            state,
            estimate,
            rng,
        }
    }
    /// Run one cycle and replace the filter state with its result.
    pub fn update(&mut self, odometry: &Odometry, observation: &Observation) -> CycleOutput {
        let models = CycleModels {
            resampling: self.config.resampling_strategy,
            averaging: self.config.averaging_strategy,
            motion: &self.motion,
            sensor: &self.sensor,
            corrector: &self.corrector,
        };
        let (next, output) =
            run_cycle(&self.state, &models, odometry, observation, &mut self.rng);
        self.state = next;
        self.estimate = output.pose;
        output
    }
    /// One cycle returning `(x, y, particles, weights, last_median_error)`.
    pub fn calc_pose(
        &mut self,
        odometry: &Odometry,
        observation: &Observation,
    ) -> (f64, f64, ParticleSet, WeightVector, Option<f64>) {
        let out = self.update(odometry, observation);
        (
            out.pose.x,
            out.pose.y,
            out.particles,
            out.weights,
            out.last_median_error,
        )
    }
    pub fn config(&self) -> &MclConfig {
        &self.config
    }
    pub fn state(&self) -> &FilterState {
        &self.state
    }
    pub fn particles(&self) -> &ParticleSet {
        &self.state.particles
    }
    pub fn weights(&self) -> &WeightVector {
        &self.state.weights
    }
    pub fn last_median_error(&self) -> Option<f64> {
        self.state.last_median_error
    }
    pub fn corrector(&self) -> &BarrierCorrector {
        &self.corrector
    }
    /// Latest pose estimate (the initial cloud's mean before the first cycle).
    pub fn estimate(&self) -> Vector2<f64> {
        self.estimate
    }
    pub fn covariance(&self) -> Matrix2<f64> {
        estimate_covariance(&self.state.particles, &self.state.weights)
    }
    pub fn effective_sample_size(&self) -> f64 {
        self.state.weights.effective_sample_size()
    }
    pub fn num_particles(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn seeded(seed: u64) -> MclConfig {
        MclConfig {
            seed,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(MclConfig::default().validate().is_ok());
        assert_eq!(MclConfig::default().num_particles, 250);
    }

    #[test]
    fn test_invalid_configs() {
        let zero = MclConfig {
            num_particles: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let spread = MclConfig {
            initial_spread: [-1.0, 2.0],
            ..Default::default()
        };
        assert!(spread.validate().is_err());
        let mut floor = MclConfig::default();
        floor.sensor.error_floor = 0.0;
        assert!(floor.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "Number of particles must be positive")]
    fn test_zero_particles_panics() {
        let config = MclConfig {
            num_particles: 0,
            ..Default::default()
        };
        let _ = MonteCarloLocalizer::new(
            Vector2::new(0.0, 0.0),
            MapBounds::default(),
            vec![],
            config,
        );
    }

    #[test]
    fn test_initialization_honors_guess() {
        let config = MclConfig {
            num_particles: 4000,
            ..seeded(3)
        };
        let mcl = MonteCarloLocalizer::new(
            Vector2::new(120.0, 80.0),
            MapBounds::default(),
            vec![],
            config,
        );
        assert_eq!(mcl.num_particles(), 4000);
        for &w in mcl.weights().iter() {
            assert_approx_eq!(w, 1.0 / 4000.0, 1e-15);
        }
        assert!((mcl.estimate().x - 120.0).abs() < 10.0);
        assert!((mcl.estimate().y - 80.0).abs() < 6.0);
    }

    #[test]
    fn test_random_placement_stays_reproducible() {
        let config = MclConfig {
            initial_placement: InitialPlacement::Random,
            initial_spread: [0.0, 0.0],
            ..seeded(5)
        };
        let a = MonteCarloLocalizer::new(
            Vector2::new(-1000.0, -1000.0),
            MapBounds::new(400.0, 300.0),
            vec![],
            config.clone(),
        );
        let b = MonteCarloLocalizer::new(
            Vector2::new(-1000.0, -1000.0),
            MapBounds::new(400.0, 300.0),
            vec![],
            config,
        );
        let center = a.estimate();
        assert!((0.0..=400.0).contains(&center.x));
        assert!((0.0..=300.0).contains(&center.y));
        assert_eq!(a.particles(), b.particles());
    }

    #[test]
    fn test_first_cycle_skips_jitter() {
        // Zero spread, negligible motion noise: any displacement beyond it would be jitter.
        let mut config = MclConfig {
            num_particles: 50,
            initial_spread: [0.0, 0.0],
            ..seeded(9)
        };
        config.motion.amplification = 0.0;
        let mut mcl = MonteCarloLocalizer::new(
            Vector2::new(100.0, 100.0),
            MapBounds::new(400.0, 300.0),
            vec![],
            config,
        );
        assert_eq!(mcl.last_median_error(), None);
        let out = mcl.update(&Odometry::new(0.0, 0.0, 0.0, 0.0), &Observation::new(300.0, 200.0));
        assert!(out.particles.iter().all(|p| p == Vector2::new(100.0, 100.0)));
        assert_eq!(out.last_median_error, Some(0.0));
        // The second cycle has a feedback signal and jitters.
        let out = mcl.update(&Odometry::new(0.0, 0.0, 0.0, 0.0), &Observation::new(300.0, 200.0));
        assert!(out.particles.iter().any(|p| p != Vector2::new(100.0, 100.0)));
    }

    #[test]
    fn test_run_cycle_threads_state() {
        let mut rng = StdRng::seed_from_u64(2);
        let state = FilterState::initialize(
            Vector2::new(50.0, 50.0),
            Vector2::new(5.0, 5.0),
            30,
            &mut rng,
        );
        let motion = MotionModel::default();
        let sensor = SensorModel::default();
        let corrector = BarrierCorrector::new(MapBounds::new(400.0, 300.0), vec![]);
        let models = CycleModels {
            resampling: ParticleResamplingStrategy::Systematic,
            averaging: ParticleAveragingStrategy::WeightedAverage,
            motion: &motion,
            sensor: &sensor,
            corrector: &corrector,
        };
        let odometry = Odometry::new(1.0, -1.0, 0.2, 0.3);
        let observation = Observation::new(349.0, 251.0);
        let (next, out) = run_cycle(&state, &models, &odometry, &observation, &mut rng);
        assert_eq!(state.last_median_error, None);
        assert_eq!(next.len(), 30);
        assert_eq!(next.weights.len(), 30);
        assert_eq!(next.last_variances, Some((0.2, 0.3)));
        assert_eq!(next.last_median_error, out.last_median_error);
        assert_approx_eq!(next.weights.sum(), 1.0, 1e-12);
        assert!(!out.uniform_fallback);
    }

    #[test]
    fn test_calc_pose_tuple() {
        let mut mcl = MonteCarloLocalizer::new(
            Vector2::new(100.0, 100.0),
            MapBounds::new(400.0, 300.0),
            vec![Barrier::new(200.0, 60.0, 20.0, 80.0)],
            seeded(4),
        );
        let (x, y, particles, weights, error) =
            mcl.calc_pose(&Odometry::new(2.0, 1.0, 0.5, 0.5), &Observation::new(98.0, 199.0));
        assert!(x.is_finite() && y.is_finite());
        assert_eq!(particles.len(), 250);
        assert_eq!(weights.len(), 250);
        assert!(error.is_some());
        assert_eq!(mcl.estimate(), Vector2::new(x, y));
    }

    #[test]
    fn test_debug_format() {
        let mcl = MonteCarloLocalizer::new(
            Vector2::new(10.0, 10.0),
            MapBounds::default(),
            vec![],
            seeded(1),
        );
        let text = format!("{:?}", mcl);
        assert!(text.contains("MonteCarloLocalizer"));
        assert!(text.contains("effective_particles"));
    }
}

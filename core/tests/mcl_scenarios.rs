//! End-to-end tests of the localization cycle
//!
//! These tests drive the public API the way an outer control loop would: build a filter, feed it
//! odometry/observation pairs and inspect the pose and the diagnostic population. Statistical
//! assertions use fixed seeds and tolerances that are wide compared to the expected spread.
use assert_approx_eq::assert_approx_eq;
use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mcl::barrier::{Barrier, BarrierCorrector, MapBounds};
use mcl::filter::{CycleModels, FilterState, MclConfig, MonteCarloLocalizer, run_cycle};
use mcl::measurements::{Observation, SensorModel};
use mcl::motion::{MotionModel, MotionModelConfig, Odometry};
use mcl::particle::{
    ParticleAveragingStrategy, ParticleResamplingStrategy, ParticleSet, WeightVector,
    normalize_weights,
};
use mcl::sim::{TrackConfig, replay, synthesize_track};

fn map() -> MapBounds {
    MapBounds::new(400.0, 300.0)
}

#[test]
fn uniform_weights_and_exact_observation_keep_weights_uniform() {
    let n = 64;
    let mut rng = StdRng::seed_from_u64(1);
    let state = FilterState::new(ParticleSet::repeat(Vector2::new(120.0, 90.0), n));
    let motion = MotionModel::new(MotionModelConfig {
        amplification: 0.0,
        ..Default::default()
    });
    let sensor = SensorModel::default();
    let corrector = BarrierCorrector::new(map(), vec![]);
    let models = CycleModels {
        resampling: ParticleResamplingStrategy::Multinomial,
        averaging: ParticleAveragingStrategy::WeightedAverage,
        motion: &motion,
        sensor: &sensor,
        corrector: &corrector,
    };
    let observation = Observation::new(400.0 - 120.0, 300.0 - 90.0);
    let (next, out) = run_cycle(
        &state,
        &models,
        &Odometry::new(0.0, 0.0, 0.0, 0.0),
        &observation,
        &mut rng,
    );
    for &w in next.weights.iter() {
        assert_approx_eq!(w, 1.0 / n as f64, 1e-12);
    }
    let n_f = n as f64;
    let mean_x = next.particles.x().sum() / n_f;
    let mean_y = next.particles.y().sum() / n_f;
    assert_approx_eq!(out.pose.x, mean_x, 1e-9);
    assert_approx_eq!(out.pose.y, mean_y, 1e-9);
    assert!(!out.uniform_fallback);
}

#[test]
fn one_hot_weights_collapse_the_population() {
    let mut rng = StdRng::seed_from_u64(2);
    let particles = ParticleSet::scatter(
        Vector2::new(200.0, 150.0),
        Vector2::new(50.0, 50.0),
        100,
        &mut rng,
    );
    let mut raw = vec![0.0; 100];
    raw[42] = 1.0;
    let weights = WeightVector::from_vec(raw);
    let chosen = particles.get(42).unwrap();
    let resampled = ParticleResamplingStrategy::Multinomial.resample(&particles, &weights, &mut rng);
    assert_eq!(resampled.len(), 100);
    assert!(resampled.iter().all(|p| p == chosen));
}

#[test]
fn barrier_between_particle_and_front_edge_shortens_the_reading() {
    let particle = Vector2::new(100.0, 150.0);
    let barrier = Barrier::new(180.0, 100.0, 40.0, 100.0);
    let corrector = BarrierCorrector::new(map(), vec![barrier]);
    let readings = corrector.expected_readings(&ParticleSet::repeat(particle, 1));
    assert_approx_eq!(readings.front[0], barrier.x - particle.x, 1e-12);
    assert!(readings.front[0] < map().width - particle.x);
}

#[test]
fn hopeless_observation_falls_back_to_uniform_weights() {
    let mut mcl = MonteCarloLocalizer::new(
        Vector2::new(200.0, 150.0),
        map(),
        vec![],
        MclConfig {
            num_particles: 80,
            seed: 4,
            ..Default::default()
        },
    );
    let out = mcl.update(
        &Odometry::new(1.0, 1.0, 0.1, 0.1),
        &Observation::new(1e300, -1e300),
    );
    assert!(out.uniform_fallback);
    for &w in out.weights.iter() {
        assert_approx_eq!(w, 1.0 / 80.0, 1e-15);
    }
    assert!(out.pose.x.is_finite() && out.pose.y.is_finite());

    let mut zeros = WeightVector::from_vec(vec![0.0; 80]);
    assert!(normalize_weights(&mut zeros));
    assert!(zeros.iter().all(|w| !w.is_nan()));
}

#[test]
fn motion_of_single_particle_converges_to_displacement() {
    let model = MotionModel::default();
    let odometry = Odometry::new(5.0, 0.0, 0.0, 0.0);
    let mut rng = StdRng::seed_from_u64(5);
    let trials = 4000;
    let mut sum = Vector2::new(0.0, 0.0);
    let mut sum_sq_x = 0.0;
    for _ in 0..trials {
        let mut set = ParticleSet::repeat(Vector2::new(10.0, 10.0), 1);
        model.propagate(&mut set, &odometry, &mut rng);
        let p = set.get(0).unwrap();
        sum += p;
        sum_sq_x += (p.x - 15.0).powi(2);
    }
    let mean = sum / trials as f64;
    assert_approx_eq!(mean.x, 15.0, 0.01);
    assert_approx_eq!(mean.y, 10.0, 0.01);
    let std_x = (sum_sq_x / trials as f64).sqrt();
    let expected = model.noise_std(0.0);
    assert!((std_x - expected).abs() < 0.1 * expected);
}

#[test]
fn first_cycle_runs_without_feedback() {
    let mut mcl = MonteCarloLocalizer::new(
        Vector2::new(100.0, 100.0),
        map(),
        vec![Barrier::new(250.0, 50.0, 20.0, 100.0)],
        MclConfig {
            seed: 6,
            ..Default::default()
        },
    );
    assert_eq!(mcl.last_median_error(), None);
    let (x, y, particles, weights, error) =
        mcl.calc_pose(&Odometry::new(0.0, 0.0, 0.0, 0.0), &Observation::new(150.0, 200.0));
    assert!(x.is_finite() && y.is_finite());
    assert_eq!(particles.len(), weights.len());
    assert!(error.is_some());
}

#[test]
fn invariants_hold_over_random_cycles() {
    let mut rng = StdRng::seed_from_u64(7);
    let barriers = vec![
        Barrier::new(120.0, 80.0, 40.0, 60.0),
        Barrier::new(300.0, 10.0, 20.0, 200.0),
        Barrier::new(0.0, 0.0, 0.0, 0.0),
    ];
    for strategy in [
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Residual,
    ] {
        for n in [1usize, 2, 37, 250] {
            let mut mcl = MonteCarloLocalizer::new(
                Vector2::new(150.0, 120.0),
                map(),
                barriers.clone(),
                MclConfig {
                    num_particles: n,
                    resampling_strategy: strategy,
                    seed: 100 + n as u64,
                    ..Default::default()
                },
            );
            for _ in 0..20 {
                let odometry = Odometry::new(
                    rng.random_range(-3.0..3.0),
                    rng.random_range(-3.0..3.0),
                    rng.random_range(-0.5..2.0),
                    rng.random_range(-0.5..2.0),
                );
                let observation = Observation::new(
                    rng.random_range(0.0..400.0),
                    rng.random_range(0.0..300.0),
                );
                let out = mcl.update(&odometry, &observation);
                assert_eq!(out.particles.len(), n);
                assert_eq!(out.weights.len(), n);
                assert_approx_eq!(out.weights.sum(), 1.0, 1e-9);
                assert!(out.weights.iter().all(|w| *w >= 0.0));
                assert!(out.pose.x.is_finite() && out.pose.y.is_finite());
            }
        }
    }
}

#[test]
fn tracks_a_synthetic_agent() {
    let corrector = BarrierCorrector::new(map(), vec![]);
    let mut rng = StdRng::seed_from_u64(8);
    let track = TrackConfig {
        start: [60.0, 60.0],
        velocity: [2.0, 1.0],
        steps: 80,
        odometry_std: 0.3,
        range_std: 1.0,
    };
    let records = synthesize_track(&track, &corrector, &mut rng).unwrap();
    let mut mcl = MonteCarloLocalizer::new(
        Vector2::new(60.0, 60.0),
        map(),
        vec![],
        MclConfig {
            initial_spread: [10.0, 10.0],
            seed: 9,
            ..Default::default()
        },
    );
    let results = replay(&mut mcl, &records, false);
    let final_error = results.last().and_then(|r| r.error).unwrap();
    assert!(final_error < 25.0, "final error {}", final_error);
}

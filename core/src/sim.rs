//! Replay of recorded (or synthesized) cycle logs through the filter.
//!
//! A cycle log is a CSV file with one row per filter cycle:
//!
//! ```text
//! vx,vy,var_vx,var_vy,front,bottom,truth_x,truth_y
//! 1.0,0.0,0.1,0.1,298.8,199.6,101.0,100.0
//! ```
//!
//! `truth_x`/`truth_y` are optional; when present the replay reports the position error
//! of each estimate.
use anyhow::{Context, Result, bail};
use log::{info, warn};
use nalgebra::Vector2;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::barrier::BarrierCorrector;
use crate::filter::{CycleOutput, MonteCarloLocalizer};
use crate::fuse_gaussians;
use crate::measurements::Observation;
use crate::motion::{MIN_VARIANCE, Odometry};

/// One row of a cycle log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub vx: f64,
    pub vy: f64,
    pub var_vx: f64,
    pub var_vy: f64,
    pub front: f64,
    pub bottom: f64,
    #[serde(default)]
    pub truth_x: Option<f64>,
    #[serde(default)]
    pub truth_y: Option<f64>,
}
impl CycleRecord {
    pub fn odometry(&self) -> Odometry {
        Odometry::new(self.vx, self.vy, self.var_vx, self.var_vy)
    }
    pub fn observation(&self) -> Observation {
        Observation::new(self.front, self.bottom)
    }
    pub fn truth(&self) -> Option<Vector2<f64>> {
        Some(Vector2::new(self.truth_x?, self.truth_y?))
    }
    /// Read a cycle log from CSV.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let mut rdr = csv::Reader::from_path(path)
            .with_context(|| format!("opening cycle log {}", path.display()))?;
        let mut records = Vec::new();
        for (i, result) in rdr.deserialize().enumerate() {
            let record: Self =
                result.with_context(|| format!("parsing row {} of {}", i + 1, path.display()))?;
            records.push(record);
        }
        Ok(records)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One row of replay output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub step: usize,
    pub x: f64,
    pub y: f64,
    pub median_error: Option<f64>,
    pub effective_sample_size: f64,
    /// Distance to the ground truth, when the log carries it.
    pub error: Option<f64>,
}
impl EstimateRecord {
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Per-axis Gaussian blend of the filter estimate with the previous estimate moved by
/// odometry.
#[derive(Clone, Debug, Default)]
pub struct OdometrySmoother {
    state: Option<(Vector2<f64>, Vector2<f64>)>,
}
impl OdometrySmoother {
    pub fn new() -> Self {
        Self::default()
    }
    /// Fuse `output` with the prediction from the previous smoothed estimate.
    pub fn smooth(
        &mut self,
        odometry: &Odometry,
        output: &CycleOutput,
        covariance: Vector2<f64>,
    ) -> Vector2<f64> {
        let measured_var = covariance.map(|v| v.max(MIN_VARIANCE));
        let (mean, var) = match self.state {
            None => (output.pose, measured_var),
            Some((prev_mean, prev_var)) => {
                let (x, var_x) = fuse_gaussians(
                    prev_mean.x + odometry.vx,
                    prev_var.x + odometry.var_vx.max(0.0),
                    output.pose.x,
                    measured_var.x,
                    MIN_VARIANCE,
                );
                let (y, var_y) = fuse_gaussians(
                    prev_mean.y + odometry.vy,
                    prev_var.y + odometry.var_vy.max(0.0),
                    output.pose.y,
                    measured_var.y,
                    MIN_VARIANCE,
                );
                (Vector2::new(x, y), Vector2::new(var_x, var_y))
            }
        };
        self.state = Some((mean, var));
        mean
    }
}

/// Run every record through `localizer`, one cycle each.
pub fn replay(
    localizer: &mut MonteCarloLocalizer,
    records: &[CycleRecord],
    smoothing: bool,
) -> Vec<EstimateRecord> {
    let mut smoother = OdometrySmoother::new();
    let mut results = Vec::with_capacity(records.len());
    let mut fallbacks = 0usize;
    for (step, record) in records.iter().enumerate() {
        let odometry = record.odometry();
        let output = localizer.update(&odometry, &record.observation());
        if output.uniform_fallback {
            fallbacks += 1;
        }
        let pose = if smoothing {
            let cov = localizer.covariance();
            smoother.smooth(&odometry, &output, Vector2::new(cov[(0, 0)], cov[(1, 1)]))
        } else {
            output.pose
        };
        let error = record.truth().map(|truth| (pose - truth).norm());
        results.push(EstimateRecord {
            step,
            x: pose.x,
            y: pose.y,
            median_error: output.last_median_error,
            effective_sample_size: output.effective_sample_size,
            error,
        });
    }
    if fallbacks > 0 {
        warn!(
            "{} of {} cycles reset the weights to uniform",
            fallbacks,
            records.len()
        );
    }
    let errors: Vec<f64> = results.iter().filter_map(|r| r.error).collect();
    if !errors.is_empty() {
        info!(
            "Replayed {} cycles, mean position error {:.3}, final {:.3}",
            results.len(),
            errors.iter().sum::<f64>() / errors.len() as f64,
            errors[errors.len() - 1]
        );
    } else {
        info!("Replayed {} cycles", results.len());
    }
    results
}

/// Straight-line ground-truth track with noisy odometry and range readings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub start: [f64; 2],
    /// Displacement per cycle.
    pub velocity: [f64; 2],
    pub steps: usize,
    /// Standard deviation of the odometry displacement noise.
    pub odometry_std: f64,
    /// Standard deviation of the range noise.
    pub range_std: f64,
}
impl Default for TrackConfig {
    fn default() -> Self {
        TrackConfig {
            start: [50.0, 50.0],
            velocity: [2.0, 1.0],
            steps: 100,
            odometry_std: 0.3,
            range_std: 1.0,
        }
    }
}

/// Synthesize a cycle log for `track` inside the corrector's map.
pub fn synthesize_track<R: Rng + ?Sized>(
    track: &TrackConfig,
    corrector: &BarrierCorrector,
    rng: &mut R,
) -> Result<Vec<CycleRecord>> {
    if track.odometry_std < 0.0 || track.range_std < 0.0 {
        bail!("noise standard deviations must be non-negative");
    }
    let mut position = Vector2::new(track.start[0], track.start[1]);
    let velocity = Vector2::new(track.velocity[0], track.velocity[1]);
    let odometry_var = track.odometry_std.powi(2);
    let mut records = Vec::with_capacity(track.steps);
    for _ in 0..track.steps {
        position += velocity;
        let (front, bottom) = corrector.expected_reading_at(position.x, position.y);
        let mut noise = || rng.sample::<f64, _>(StandardNormal);
        records.push(CycleRecord {
            vx: velocity.x + noise() * track.odometry_std,
            vy: velocity.y + noise() * track.odometry_std,
            var_vx: odometry_var,
            var_vy: odometry_var,
            front: front + noise() * track.range_std,
            bottom: bottom + noise() * track.range_std,
            truth_x: Some(position.x),
            truth_y: Some(position.y),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{Barrier, MapBounds};
    use crate::filter::MclConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn corrector() -> BarrierCorrector {
        BarrierCorrector::new(
            MapBounds::new(400.0, 300.0),
            vec![Barrier::new(250.0, 40.0, 20.0, 120.0)],
        )
    }

    #[test]
    fn test_synthesized_track_is_noise_free_when_asked() {
        let mut rng = StdRng::seed_from_u64(1);
        let track = TrackConfig {
            start: [100.0, 100.0],
            velocity: [1.0, 0.0],
            steps: 3,
            odometry_std: 0.0,
            range_std: 0.0,
        };
        let records = synthesize_track(&track, &corrector(), &mut rng).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].truth(), Some(Vector2::new(101.0, 100.0)));
        assert_eq!(records[0].front, 250.0 - 101.0);
        assert_eq!(records[0].bottom, 200.0);
        assert_eq!(records[2].vx, 1.0);
    }

    #[test]
    fn test_negative_noise_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let track = TrackConfig {
            range_std: -1.0,
            ..Default::default()
        };
        assert!(synthesize_track(&track, &corrector(), &mut rng).is_err());
    }

    #[test]
    fn test_replay_produces_one_estimate_per_record() {
        let mut rng = StdRng::seed_from_u64(2);
        let records = synthesize_track(&TrackConfig::default(), &corrector(), &mut rng).unwrap();
        let config = MclConfig {
            seed: 12,
            ..Default::default()
        };
        for smoothing in [false, true] {
            let mut mcl = MonteCarloLocalizer::new(
                Vector2::new(50.0, 50.0),
                MapBounds::new(400.0, 300.0),
                corrector().barriers().to_vec(),
                config.clone(),
            );
            let results = replay(&mut mcl, &records, smoothing);
            assert_eq!(results.len(), records.len());
            for (i, r) in results.iter().enumerate() {
                assert_eq!(r.step, i);
                assert!(r.x.is_finite() && r.y.is_finite());
                assert!(r.error.is_some());
                assert!(r.effective_sample_size >= 1.0 - 1e-9);
            }
        }
    }

    #[test]
    fn test_smoother_first_estimate_passes_through() {
        let mut mcl = MonteCarloLocalizer::new(
            Vector2::new(50.0, 50.0),
            MapBounds::new(400.0, 300.0),
            vec![],
            MclConfig {
                seed: 3,
                ..Default::default()
            },
        );
        let odometry = Odometry::new(1.0, 1.0, 0.1, 0.1);
        let output = mcl.update(&odometry, &Observation::new(349.0, 249.0));
        let mut smoother = OdometrySmoother::new();
        let smoothed = smoother.smooth(&odometry, &output, Vector2::new(4.0, 4.0));
        assert_eq!(smoothed, output.pose);
    }

    #[test]
    fn test_csv_round_trip_with_optional_truth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(
            &path,
            "vx,vy,var_vx,var_vy,front,bottom,truth_x,truth_y\n1,0,0.1,0.1,299,200,101,100\n1,0,0.1,0.1,298,200,,\n",
        )
        .unwrap();
        let records = CycleRecord::from_csv(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].truth(), Some(Vector2::new(101.0, 100.0)));
        assert_eq!(records[1].truth(), None);
        let out = dir.path().join("copy.csv");
        CycleRecord::to_csv(&records, &out).unwrap();
        assert_eq!(CycleRecord::from_csv(&out).unwrap(), records);
    }
}

//! Range expectations against the map edges with occlusion by rectangular barriers.
//!
//! The front sensor looks along +x towards the far edge `x = width`; the bottom sensor looks
//! along +y towards `y = height`. A barrier shortens a ray when the particle sits at or
//! before the barrier's near face on the ray axis and inside the barrier's span on the
//! other axis. This stands in for ray casting: only axis-aligned rectangles are modelled
//! and the test is evaluated for the whole population at once.
use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::particle::ParticleSet;

/// Axis-aligned occluding rectangle in map coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Barrier {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}
impl Barrier {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Barrier {
            x,
            y,
            width,
            height,
        }
    }
    /// Zero, negative or non-finite geometry. Such barriers never occlude.
    pub fn is_degenerate(&self) -> bool {
        !(self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width > 0.0
            && self.height > 0.0)
    }
    /// Whether the front (+x) ray from `(px, py)` hits this barrier's near face.
    pub fn occludes_front(&self, px: f64, py: f64) -> bool {
        !self.is_degenerate() && px <= self.x && self.y <= py && py <= self.y + self.height
    }
    /// Whether the bottom (+y) ray from `(px, py)` hits this barrier's near face.
    pub fn occludes_bottom(&self, px: f64, py: f64) -> bool {
        !self.is_degenerate() && py <= self.y && self.x <= px && px <= self.x + self.width
    }
}
impl From<(f64, f64, f64, f64)> for Barrier {
    fn from(tuple: (f64, f64, f64, f64)) -> Self {
        let (x, y, width, height) = tuple;
        Barrier::new(x, y, width, height)
    }
}
impl From<[f64; 4]> for Barrier {
    fn from(values: [f64; 4]) -> Self {
        Barrier::new(values[0], values[1], values[2], values[3])
    }
}

/// Extent of the field the range sensors measure against.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub width: f64,
    pub height: f64,
}
impl Default for MapBounds {
    fn default() -> Self {
        MapBounds {
            width: 400.0,
            height: 300.0,
        }
    }
}
impl MapBounds {
    pub fn new(width: f64, height: f64) -> Self {
        MapBounds { width, height }
    }
    /// Unoccluded `(front, bottom)` distances from a single point to the far edges.
    pub fn edge_distances(&self, x: f64, y: f64) -> (f64, f64) {
        (self.width - x, self.height - y)
    }
}

/// Predicted front and bottom readings for every particle.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpectedReadings {
    pub front: DVector<f64>,
    pub bottom: DVector<f64>,
}
impl ExpectedReadings {
    pub fn len(&self) -> usize {
        self.front.len()
    }
    pub fn is_empty(&self) -> bool {
        self.front.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BarrierCorrector {
    bounds: MapBounds,
    barriers: Vec<Barrier>,
}
impl BarrierCorrector {
    pub fn new(bounds: MapBounds, barriers: Vec<Barrier>) -> Self {
        let degenerate = barriers.iter().filter(|b| b.is_degenerate()).count();
        if degenerate > 0 {
            debug!(
                "{} of {} barriers have degenerate geometry and will be ignored",
                degenerate,
                barriers.len()
            );
        }
        BarrierCorrector { bounds, barriers }
    }
    pub fn bounds(&self) -> &MapBounds {
        &self.bounds
    }
    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }
    /// Distances to the map edges, ignoring barriers.
    pub fn naive_readings(&self, particles: &ParticleSet) -> ExpectedReadings {
        ExpectedReadings {
            front: particles.x().map(|x| self.bounds.width - x),
            bottom: particles.y().map(|y| self.bounds.height - y),
        }
    }
    /// Distances to the nearest occluder along each ray.
    ///
    /// Barriers are applied in list order and a later barrier overrides an earlier one
    /// for the same particle and axis. A corrected reading is capped at the edge distance,
    /// so a barrier that pokes past the map edge cannot lengthen a ray.
    pub fn expected_readings(&self, particles: &ParticleSet) -> ExpectedReadings {
        let mut readings = self.naive_readings(particles);
        let x = particles.x();
        let y = particles.y();
        for barrier in self.barriers.iter().filter(|b| !b.is_degenerate()) {
            let front_face = barrier.x.min(self.bounds.width);
            let bottom_face = barrier.y.min(self.bounds.height);
            readings.front = readings.front.zip_zip_map(x, y, |current, px, py| {
                if barrier.occludes_front(px, py) {
                    front_face - px
                } else {
                    current
                }
            });
            readings.bottom = readings.bottom.zip_zip_map(x, y, |current, px, py| {
                if barrier.occludes_bottom(px, py) {
                    bottom_face - py
                } else {
                    current
                }
            });
        }
        readings
    }
    /// Expected `(front, bottom)` readings for a single position.
    pub fn expected_reading_at(&self, x: f64, y: f64) -> (f64, f64) {
        let (mut front, mut bottom) = self.bounds.edge_distances(x, y);
        for barrier in self.barriers.iter().filter(|b| !b.is_degenerate()) {
            if barrier.occludes_front(x, y) {
                front = barrier.x.min(self.bounds.width) - x;
            }
            if barrier.occludes_bottom(x, y) {
                bottom = barrier.y.min(self.bounds.height) - y;
            }
        }
        (front, bottom)
    }
}

//! Replay configuration and its file formats.
//!
//! A [`SimulationConfig`] bundles the map geometry, the barrier list, the initial position
//! guess and the filter settings. It can be stored as JSON, YAML or TOML; the format is
//! chosen from the file extension.
//!
//! ```
//! use mcl::barrier::{Barrier, MapBounds};
//! use mcl::config::SimulationConfig;
//!
//! let cfg = SimulationConfig {
//!     map: MapBounds::new(400.0, 300.0),
//!     barriers: vec![Barrier::new(250.0, 50.0, 20.0, 100.0)],
//!     initial_position: [100.0, 100.0],
//!     ..Default::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::barrier::{Barrier, MapBounds};
use crate::filter::MclConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Initial position guess `[x, y]` in map coordinates.
    pub initial_position: [f64; 2],
    /// Cycle log to replay (CSV).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    /// Where estimates are written (CSV).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Blend each estimate with the odometry-propagated previous estimate.
    pub smoothing: bool,
    pub map: MapBounds,
    pub filter: MclConfig,
    pub barriers: Vec<Barrier>,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            initial_position: [200.0, 150.0],
            input: None,
            output: None,
            smoothing: false,
            map: MapBounds::default(),
            filter: MclConfig::default(),
            barriers: Vec::new(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.map.width.is_finite() && self.map.height.is_finite())
            || self.map.width <= 0.0
            || self.map.height <= 0.0
        {
            bail!(
                "map bounds must be positive, got {} x {}",
                self.map.width,
                self.map.height
            );
        }
        if self.initial_position.iter().any(|v| !v.is_finite()) {
            bail!("initial_position must be finite");
        }
        self.filter.validate()
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Write using the format implied by the extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Read using the format implied by the extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!(
            "Unsupported configuration format: {} (expected .json, .yaml, .yml or .toml)",
            path.display()
        ),
    )
}

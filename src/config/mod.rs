//! Configuration loading for the flow compensator.
//!
//! Configuration lives in a JSON file mapping material names to response
//! curve control points, with optional per-extruder material assignments
//! and global output/detection settings:
//!
//! ```json
//! {
//!   "materials": {
//!     "PETG": { "curve_points": [[0, 1.0], [10, 1.0], [20, 1.025], [30, 1.06]] },
//!     "default": { "curve_points": [[0, 1.0], [40, 1.0]] }
//!   },
//!   "extruder_mapping": { "T0": "PETG", "T1": "PLA" },
//!   "detection": { "filament_diameter": 1.75, "fallback_material": "default" },
//!   "output": { "min_compensation": 0.8, "max_compensation": 1.5 }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::curve::MaterialProfile;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no material profile named '{0}' in configuration")]
    MissingMaterial(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Material name to response-curve definition.
    #[serde(default)]
    pub materials: HashMap<String, MaterialConfig>,

    /// Tool name (`"T0"`, `"T1"`, ...) to material name. Empty means
    /// single-material mode.
    #[serde(default)]
    pub extruder_mapping: HashMap<String, String>,

    /// Fallbacks used when the G-code header lacks information.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Output and safety settings.
    #[serde(default)]
    pub output: OutputConfig,
}

/// One material's response curve definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialConfig {
    /// Optional display name; the map key is the canonical name.
    #[serde(default)]
    pub name: Option<String>,

    /// `(flow rate mm³/s, multiplier)` control points.
    pub curve_points: Vec<(f64, f64)>,
}

/// Defaults applied when header metadata is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Filament diameter in mm when no `M200 D` command is present.
    #[serde(default = "default_filament_diameter")]
    pub filament_diameter: f64,

    /// Material used when the requested one is unknown or none is detected.
    #[serde(default = "default_fallback_material")]
    pub fallback_material: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            filament_diameter: default_filament_diameter(),
            fallback_material: default_fallback_material(),
        }
    }
}

/// Output and multiplier safety settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Lower multiplier safety bound.
    #[serde(default = "default_min_compensation")]
    pub min_compensation: f64,

    /// Upper multiplier safety bound.
    #[serde(default = "default_max_compensation")]
    pub max_compensation: f64,

    /// Append a comment to each compensated line.
    #[serde(default = "default_true")]
    pub log_changes: bool,

    /// Print the statistics report after processing.
    #[serde(default = "default_true")]
    pub statistics: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            min_compensation: default_min_compensation(),
            max_compensation: default_max_compensation(),
            log_changes: true,
            statistics: true,
        }
    }
}

fn default_filament_diameter() -> f64 {
    1.75
}

fn default_fallback_material() -> String {
    "default".to_string()
}

fn default_min_compensation() -> f64 {
    0.8
}

fn default_max_compensation() -> f64 {
    1.5
}

fn default_true() -> bool {
    true
}

impl FlowConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Look up a material by name, exact match first, then
    /// case-insensitively.
    pub fn find_material<'a>(&'a self, name: &'a str) -> Option<(&'a str, &'a MaterialConfig)> {
        if let Some(mat) = self.materials.get(name) {
            return Some((name, mat));
        }
        self.materials
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(key, mat)| (key.as_str(), mat))
    }

    /// Resolve a (possibly absent, possibly unknown) material name to a
    /// profile.
    ///
    /// An unknown name falls back to the configured fallback material with a
    /// warning; a missing fallback is an error, since running without any
    /// curve would silently produce unmodified output.
    pub fn resolve_material(&self, requested: Option<&str>) -> ConfigResult<MaterialProfile> {
        if let Some(name) = requested {
            if let Some((key, mat)) = self.find_material(name) {
                return Ok(MaterialProfile::new(key, mat.curve_points.clone()));
            }
            warn!(
                "material '{name}' not found, using fallback: {}",
                self.detection.fallback_material
            );
        }

        let fallback = &self.detection.fallback_material;
        self.find_material(fallback)
            .map(|(key, mat)| MaterialProfile::new(key, mat.curve_points.clone()))
            .ok_or_else(|| ConfigError::MissingMaterial(fallback.clone()))
    }

    /// Parse the extruder mapping into tool id → material name, sorted by
    /// tool id. Keys that do not look like `T<n>` are skipped with a
    /// warning.
    pub fn tool_mapping(&self) -> BTreeMap<usize, String> {
        let mut mapping = BTreeMap::new();
        for (key, material) in &self.extruder_mapping {
            let tool = key
                .strip_prefix('T')
                .or_else(|| key.strip_prefix('t'))
                .and_then(|digits| digits.parse::<usize>().ok());
            match tool {
                Some(tool) => {
                    mapping.insert(tool, material.clone());
                }
                None => warn!("invalid tool name '{key}' in extruder_mapping, skipping"),
            }
        }
        mapping
    }
}

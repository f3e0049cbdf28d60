use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::calibration::CoefficientSource;

/// Levenberg-Marquardt settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterSettings {
    pub max_iterations: usize,
    /// Relative cost decrease below which a step counts as converged
    pub tolerance: f64,
    /// Initial damping
    pub lambda: f64,
    pub lambda_factor: f64,
}

impl Default for FitterSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            lambda: 0.01,
            lambda_factor: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Maximum radial order of the Zernike basis
    pub zernike_order: usize,
    /// Use the stored reference coefficients or fit them to the PRF
    pub coefficients: CoefficientSource,
    /// Zernike modes with |coefficient| <= cutoff are masked out
    pub mode_cutoff: f64,
    /// Shared x/y shift is bounded to [-shift_limit, shift_limit]
    pub shift_limit: f64,
    pub fitter: FitterSettings,
    pub calibration_fitter: FitterSettings,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            zernike_order: 4,
            coefficients: CoefficientSource::Reference,
            mode_cutoff: 0.0,
            shift_limit: 2.0,
            fitter: FitterSettings::default(),
            calibration_fitter: FitterSettings {
                max_iterations: 200,
                ..FitterSettings::default()
            },
        }
    }
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse model configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model configuration: {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Invalid model configuration in {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize model configuration")
    }
}

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Centring and scaling of the temperature basis for one family of data sets
///
/// Cycles with a different operating envelope (for example ramped modal cycles and transient
/// FTP cycles) are centred differently. When no basis configuration is supplied the raw
/// polynomial basis $[T^2, T, 1]$ is used.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct BasisConfig {
    /// Centre temperature $T_0$
    pub t0: f64,
    /// Temperature range $T_r$ mapping the operating envelope onto roughly $[-1, 1]$
    pub tr: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingKind {
    /// Every classified sample carries the same weight
    Uniform,
    /// Weights are inversely proportional to a kernel density estimate of the operating point
    #[default]
    Density,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WeightingConfig {
    pub kind: WeightingKind,
    /// Multiplier applied to the Scott's rule bandwidth
    pub bandwidth_scale: f64,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            kind: WeightingKind::Density,
            bandwidth_scale: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iter: u32,
    pub tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tolerance: 1e-8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    /// Closed form maximum likelihood scale
    MaximumLikelihood,
    /// Scale minimising the Kolmogorov-Smirnov distance, seeded from the likelihood estimate
    #[default]
    KolmogorovSmirnov,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FitConfig {
    pub method: FitMethod,
    pub max_iters: u64,
    /// Attach a terminal logger to the scale search
    pub log_iterations: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            method: FitMethod::KolmogorovSmirnov,
            max_iters: 100,
            log_iterations: false,
        }
    }
}

/// Settings for one identification run
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Upper edge of the residual band classifying a sample as near-saturated
    pub eps_max: f64,
    /// Minimum number of classified samples needed to refine and calibrate the model
    pub min_samples: usize,
    pub basis: Option<BasisConfig>,
    pub weighting: WeightingConfig,
    pub solver: SolverConfig,
    pub fit: FitConfig,
}

/// Three coefficients need at least one residual degree of freedom for the scale fit.
pub const MIN_SATURATED_SAMPLES: usize = 4;

impl Default for Config {
    fn default() -> Self {
        Self {
            eps_max: 3.0,
            min_samples: MIN_SATURATED_SAMPLES,
            basis: None,
            weighting: WeightingConfig::default(),
            solver: SolverConfig::default(),
            fit: FitConfig::default(),
        }
    }
}

impl Config {
    /// Read and validate a configuration from a TOML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid TOML for a [`Config`], or fails
    /// [`Config::validate`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// # Errors
    /// Returns an error if `contents` does not describe a valid [`Config`].
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !(self.eps_max.is_finite() && self.eps_max > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "eps_max must be positive, got {}",
                self.eps_max
            )));
        }
        if self.min_samples < MIN_SATURATED_SAMPLES {
            return Err(Error::InvalidConfig(format!(
                "min_samples must be at least {MIN_SATURATED_SAMPLES}, got {}",
                self.min_samples
            )));
        }
        if let Some(basis) = self.basis {
            if !(basis.tr.is_finite() && basis.tr > 0.0) || !basis.t0.is_finite() {
                return Err(Error::InvalidConfig(format!(
                    "basis requires finite t0 and positive tr, got {basis:?}"
                )));
            }
        }
        if !(self.weighting.bandwidth_scale > 0.0) {
            return Err(Error::InvalidConfig(
                "weighting.bandwidth_scale must be positive".into(),
            ));
        }
        if !(self.solver.tolerance > 0.0) || self.solver.max_iter == 0 {
            return Err(Error::InvalidConfig(
                "solver needs a positive tolerance and iteration limit".into(),
            ));
        }
        if self.fit.max_iters == 0 {
            return Err(Error::InvalidConfig("fit.max_iters must be positive".into()));
        }
        Ok(())
    }
}

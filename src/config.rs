use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DustMapError, Result};
use crate::solver::SolverConfig;

/// Run options, passed explicitly into the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Run the per-pixel fit at all.
    pub fitting: bool,
    /// Write a per-pixel SED diagnostic table.
    pub sed_plotting: bool,
    /// Render the summary T / τ maps.
    pub plotting: bool,
    /// Keep unconverged solver output instead of writing NaN.
    pub accept_unconverged: bool,
    /// Directory for SED diagnostics.
    pub sed_dir: PathBuf,
    pub solver: SolverConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            fitting: true,
            sed_plotting: false,
            plotting: true,
            accept_unconverged: false,
            sed_dir: PathBuf::from("SED_plots"),
            solver: SolverConfig::default(),
        }
    }
}

impl FitConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| DustMapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FitConfig = serde_json::from_str(&text)
            .map_err(|e| DustMapError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.solver;
        if s.max_iterations == 0 {
            return Err(DustMapError::Config("solver.max_iterations must be >= 1".into()));
        }
        for (name, v) in [("xtol", s.xtol), ("ftol", s.ftol), ("gtol", s.gtol)] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(DustMapError::Config(format!("solver.{name} must be finite and >= 0")));
            }
        }
        if !(s.initial_lambda.is_finite() && s.initial_lambda > 0.0) {
            return Err(DustMapError::Config("solver.initial_lambda must be > 0".into()));
        }
        Ok(())
    }
}

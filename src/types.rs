use serde::{Deserialize, Serialize};

use crate::constants::{
    BAND_NOMINAL_FREQUENCIES_HZ, BAND_WAVELENGTHS_UM, INITIAL_TAU, INITIAL_TEMPERATURE, MICRON_CM,
    SPEED_OF_LIGHT,
};

/// Number of photometric bands in a fit.
pub const NUM_BANDS: usize = 4;

/// Photometric band. Discriminant order is the fit order.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Band {
    Pacs70,
    Pacs160,
    Spire250,
    Spire350,
}

impl Band {
    pub const ALL: [Band; NUM_BANDS] = [Band::Pacs70, Band::Pacs160, Band::Spire250, Band::Spire350];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn wavelength_um(self) -> f64 {
        BAND_WAVELENGTHS_UM[self.index()]
    }

    /// Fit frequency c / λ [Hz].
    pub fn frequency_hz(self) -> f64 {
        SPEED_OF_LIGHT / self.wavelength_um() / MICRON_CM
    }

    /// Instrument nominal frequency [Hz], used for diagnostics only.
    pub fn nominal_frequency_hz(self) -> f64 {
        BAND_NOMINAL_FREQUENCIES_HZ[self.index()]
    }

    pub fn label(self) -> &'static str {
        match self {
            Band::Pacs70 => "70um",
            Band::Pacs160 => "160um",
            Band::Spire250 => "250um",
            Band::Spire350 => "350um",
        }
    }
}

/// Fit frequencies for all bands, in band order.
pub fn band_frequencies() -> [f64; NUM_BANDS] {
    Band::ALL.map(Band::frequency_hz)
}

/// Observed flux densities for one pixel [erg s⁻¹ cm⁻² Hz⁻¹ sr⁻¹], in band order.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct FluxVector(pub [f64; NUM_BANDS]);

impl FluxVector {
    pub fn get(&self, band: Band) -> f64 {
        self.0[band.index()]
    }

    /// True when every band is finite and strictly positive, i.e. loggable.
    pub fn is_loggable(&self) -> bool {
        self.0.iter().all(|f| f.is_finite() && *f > 0.0)
    }

    /// Natural log of each band.
    pub fn ln(&self) -> [f64; NUM_BANDS] {
        self.0.map(f64::ln)
    }
}

/// Fitted (or candidate) model parameters.
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ParameterVector {
    /// Dust temperature [K].
    pub temperature: f64,
    /// Optical depth at 160 µm.
    pub tau: f64,
}

impl ParameterVector {
    pub const fn new(temperature: f64, tau: f64) -> Self {
        ParameterVector { temperature, tau }
    }

    pub const fn initial_guess() -> Self {
        ParameterVector::new(INITIAL_TEMPERATURE, INITIAL_TAU)
    }

    pub const fn nan() -> Self {
        ParameterVector::new(f64::NAN, f64::NAN)
    }

    pub fn is_finite(&self) -> bool {
        self.temperature.is_finite() && self.tau.is_finite()
    }

    pub(crate) fn to_array(self) -> [f64; 2] {
        [self.temperature, self.tau]
    }

    pub(crate) fn from_array(p: [f64; 2]) -> Self {
        ParameterVector::new(p[0], p[1])
    }
}

/// Outcome of one pixel's fit.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum FitStatus {
    /// Solver met a convergence criterion.
    Converged,
    /// Iteration cap reached or damping exhausted without convergence.
    NotConverged,
    /// A band flux was zero, negative or non-finite; the solver was not run.
    InvalidFlux,
    /// The solver ended on parameters where the model is non-finite.
    ModelDomain,
    /// Fitting disabled for this run.
    Skipped,
}

impl FitStatus {
    pub const ALL: [FitStatus; 5] = [
        FitStatus::Converged,
        FitStatus::NotConverged,
        FitStatus::InvalidFlux,
        FitStatus::ModelDomain,
        FitStatus::Skipped,
    ];

    /// Status plane encoding written next to the cube.
    pub fn code(self) -> u8 {
        match self {
            FitStatus::Converged => 0,
            FitStatus::NotConverged => 1,
            FitStatus::InvalidFlux => 2,
            FitStatus::ModelDomain => 3,
            FitStatus::Skipped => 4,
        }
    }
}

/// Result of fitting a single pixel.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct PixelFit {
    pub row: usize,
    pub col: usize,
    /// Parameters as stored in the output cube (NaN when rejected).
    pub params: ParameterVector,
    pub status: FitStatus,
    pub iterations: usize,
    /// Final sum of squared log residuals.
    pub cost: f64,
}

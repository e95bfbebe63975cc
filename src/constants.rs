//! Physical constants and fixed fit settings, CGS units throughout.
//!
//! The values deliberately match the historical reduction (h = 6.626e-27,
//! k = 1.38e-16, c = 3e10) so fitted maps compare bit-for-bit against
//! earlier products.

/// Planck constant [erg s].
pub const PLANCK_H: f64 = 6.626e-27;

/// Boltzmann constant [erg / K].
pub const BOLTZMANN_K: f64 = 1.38e-16;

/// Speed of light [cm / s].
pub const SPEED_OF_LIGHT: f64 = 3.0e10;

/// c² [cm² / s²], the denominator of the Planck prefactor.
pub const SPEED_OF_LIGHT_SQ: f64 = 9.0e20;

/// Opacity reference wavelength, 160 µm [cm].
pub const REFERENCE_WAVELENGTH_CM: f64 = 160.0e-4;

/// Dust spectral index β. Held fixed; never fitted.
pub const BETA: f64 = 2.0;

/// Microns to centimetres.
pub const MICRON_CM: f64 = 1.0e-4;

/// Initial dust temperature [K].
pub const INITIAL_TEMPERATURE: f64 = 20.0;

/// Initial optical depth at 160 µm.
pub const INITIAL_TAU: f64 = 6.3e-3;

/// Band wavelengths [µm], in fit order.
pub const BAND_WAVELENGTHS_UM: [f64; 4] = [70.0, 160.0, 250.0, 350.0];

/// Nominal band frequencies [Hz] as tabulated for the instruments.
///
/// The fit itself uses c / λ (see [`crate::types::Band::frequency_hz`]);
/// these are only used for labelling diagnostics.
pub const BAND_NOMINAL_FREQUENCIES_HZ: [f64; 4] = [4.28e12, 1.87e12, 1.199e12, 8.565e11];

/// Frequency grid for SED diagnostic curves [Hz]: start, stop (exclusive), step.
pub const SED_CURVE_GRID_HZ: (f64, f64, f64) = (2.0e11, 9.0e12, 1.5e10);

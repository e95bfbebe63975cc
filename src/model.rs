//! Modified-blackbody dust emission model.
//!
//! S(ν) = B(ν, T) · (1 − exp(−τ₁₆₀ · (λ_ref ν / c)^β))
//!
//! All quantities CGS. The fit works on ln S, so the log-space forms here
//! are evaluated without forming B first (stable at both low and high T).

use crate::constants::{
    BETA, BOLTZMANN_K, PLANCK_H, REFERENCE_WAVELENGTH_CM, SPEED_OF_LIGHT, SPEED_OF_LIGHT_SQ,
};
use crate::types::{ParameterVector, NUM_BANDS};

/// Planck spectral radiance B(ν, T) [erg s⁻¹ cm⁻² Hz⁻¹ sr⁻¹].
///
/// Returns NaN for T ≤ 0, ν ≤ 0 or non-finite inputs. Callers treat a
/// non-finite radiance as a domain error; nothing is clamped here.
pub fn planck(nu: f64, temperature: f64) -> f64 {
    if !in_domain(nu, temperature) {
        return f64::NAN;
    }
    2.0 * PLANCK_H * nu.powi(3) / SPEED_OF_LIGHT_SQ
        / ((PLANCK_H * nu / BOLTZMANN_K / temperature).exp() - 1.0)
}

/// ln B(ν, T), computed as ln(2hν³/c²) − x − ln(1 − e^{−x}) with x = hν/kT.
pub fn ln_planck(nu: f64, temperature: f64) -> f64 {
    if !in_domain(nu, temperature) {
        return f64::NAN;
    }
    let x = PLANCK_H * nu / BOLTZMANN_K / temperature;
    (2.0 * PLANCK_H * nu.powi(3) / SPEED_OF_LIGHT_SQ).ln() - x - (-(-x).exp_m1()).ln()
}

/// ∂ ln B / ∂T = (x / T) / (1 − e^{−x}).
pub fn ln_planck_dt(nu: f64, temperature: f64) -> f64 {
    if !in_domain(nu, temperature) {
        return f64::NAN;
    }
    let x = PLANCK_H * nu / BOLTZMANN_K / temperature;
    (x / temperature) / -(-x).exp_m1()
}

#[inline]
fn in_domain(nu: f64, temperature: f64) -> bool {
    nu.is_finite() && nu > 0.0 && temperature.is_finite() && temperature > 0.0
}

/// Forward model: blackbody attenuated by a power-law opacity.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ModifiedBlackbody {
    /// Opacity spectral index.
    pub beta: f64,
    /// Wavelength at which τ is quoted [cm].
    pub reference_wavelength_cm: f64,
}

impl Default for ModifiedBlackbody {
    fn default() -> Self {
        ModifiedBlackbody {
            beta: BETA,
            reference_wavelength_cm: REFERENCE_WAVELENGTH_CM,
        }
    }
}

impl ModifiedBlackbody {
    /// (λ_ref ν / c)^β, the optical depth per unit τ₁₆₀ at ν.
    pub fn opacity_scale(&self, nu: f64) -> f64 {
        (self.reference_wavelength_cm / SPEED_OF_LIGHT * nu).powf(self.beta)
    }

    /// Predicted flux density at ν.
    pub fn flux(&self, p: ParameterVector, nu: f64) -> f64 {
        let s = self.opacity_scale(nu);
        planck(nu, p.temperature) * -(-p.tau * s).exp_m1()
    }

    /// ln of [`Self::flux`]. Non-finite whenever T ≤ 0 or τ ≤ 0.
    pub fn ln_flux(&self, p: ParameterVector, nu: f64) -> f64 {
        let s = self.opacity_scale(nu);
        ln_planck(nu, p.temperature) + (-(-p.tau * s).exp_m1()).ln()
    }

    /// Gradient of [`Self::ln_flux`] with respect to (T, τ).
    pub fn ln_flux_gradient(&self, p: ParameterVector, nu: f64) -> [f64; 2] {
        let s = self.opacity_scale(nu);
        [ln_planck_dt(nu, p.temperature), s / (p.tau * s).exp_m1()]
    }

    /// Predicted flux at each band frequency.
    pub fn sed(&self, p: ParameterVector, freqs: &[f64; NUM_BANDS]) -> [f64; NUM_BANDS] {
        freqs.map(|nu| self.flux(p, nu))
    }
}

/// Log-space residuals: ln(observed) − ln(model), one per band.
///
/// `log_observed` must already be logged; the sweep does that once per pixel.
pub fn residuals(
    model: &ModifiedBlackbody,
    p: ParameterVector,
    freqs: &[f64; NUM_BANDS],
    log_observed: &[f64; NUM_BANDS],
) -> [f64; NUM_BANDS] {
    let mut r = [0.0; NUM_BANDS];
    for i in 0..NUM_BANDS {
        r[i] = log_observed[i] - model.ln_flux(p, freqs[i]);
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::band_frequencies;

    #[test]
    fn test_planck_positive_finite() {
        for &nu in &band_frequencies() {
            for t in [3.0, 5.0, 10.0, 20.0, 50.0, 100.0, 500.0, 5000.0] {
                let b = planck(nu, t);
                assert!(b.is_finite() && b > 0.0, "B({nu}, {t}) = {b}");
            }
        }
    }

    #[test]
    fn test_planck_matches_reference_value() {
        // 2 h ν³ / c² / (exp(hν/kT) - 1) evaluated by hand at 160 µm, 20 K
        let nu: f64 = 1.875e12;
        let x = 6.626e-27 * nu / 1.38e-16 / 20.0;
        let expected = 2.0 * 6.626e-27 * nu * nu * nu / 9e20 / (x.exp() - 1.0);
        let b = planck(nu, 20.0);
        assert!((b - expected).abs() / expected < 1e-12, "{b} vs {expected}");
    }

    #[test]
    fn test_planck_nonpositive_temperature_is_nan() {
        assert!(planck(1e12, 0.0).is_nan());
        assert!(planck(1e12, -5.0).is_nan());
        assert!(ln_planck(1e12, 0.0).is_nan());
        assert!(planck(0.0, 20.0).is_nan());
    }

    #[test]
    fn test_ln_planck_consistent() {
        for &nu in &band_frequencies() {
            for t in [8.0, 15.0, 30.0, 120.0] {
                let direct = planck(nu, t).ln();
                let stable = ln_planck(nu, t);
                assert!((direct - stable).abs() < 1e-10, "nu={nu} t={t}: {direct} vs {stable}");
            }
        }
    }

    #[test]
    fn test_ln_planck_derivative_numeric() {
        let nu = 4.2857e12;
        for t in [10.0, 25.0, 80.0] {
            let h = 1e-5 * t;
            let numeric = (ln_planck(nu, t + h) - ln_planck(nu, t - h)) / (2.0 * h);
            let analytic = ln_planck_dt(nu, t);
            assert!((numeric - analytic).abs() / analytic.abs() < 1e-6, "t={t}");
        }
    }

    #[test]
    fn test_opacity_scale_unity_at_reference() {
        let m = ModifiedBlackbody::default();
        let nu_ref = SPEED_OF_LIGHT / REFERENCE_WAVELENGTH_CM;
        assert!((m.opacity_scale(nu_ref) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_flux_optically_thin_limit() {
        // τ ≪ 1: S ≈ B · τ · (ν/ν_ref)^β
        let m = ModifiedBlackbody::default();
        let p = ParameterVector::new(18.0, 1e-6);
        let nu = 1.2e12;
        let thin = planck(nu, 18.0) * 1e-6 * m.opacity_scale(nu);
        let s = m.flux(p, nu);
        assert!((s - thin).abs() / thin < 1e-5);
    }

    #[test]
    fn test_ln_flux_gradient_numeric() {
        let m = ModifiedBlackbody::default();
        let p = ParameterVector::new(22.0, 0.02);
        for &nu in &band_frequencies() {
            let g = m.ln_flux_gradient(p, nu);
            let ht = 1e-5;
            let htau = 1e-8;
            let dt = (m.ln_flux(ParameterVector::new(22.0 + ht, 0.02), nu)
                - m.ln_flux(ParameterVector::new(22.0 - ht, 0.02), nu))
                / (2.0 * ht);
            let dtau = (m.ln_flux(ParameterVector::new(22.0, 0.02 + htau), nu)
                - m.ln_flux(ParameterVector::new(22.0, 0.02 - htau), nu))
                / (2.0 * htau);
            assert!((g[0] - dt).abs() / dt.abs() < 1e-5, "dT at {nu}");
            assert!((g[1] - dtau).abs() / dtau.abs() < 1e-5, "dtau at {nu}");
        }
    }

    #[test]
    fn test_residuals_zero_for_exact_model() {
        let m = ModifiedBlackbody::default();
        let freqs = band_frequencies();
        let p = ParameterVector::new(25.0, 0.01);
        let log_obs = m.sed(p, &freqs).map(f64::ln);
        let r = residuals(&m, p, &freqs, &log_obs);
        assert!(r.iter().all(|v| v.abs() < 1e-12), "{r:?}");
    }

    #[test]
    fn test_residuals_nonfinite_outside_domain() {
        let m = ModifiedBlackbody::default();
        let freqs = band_frequencies();
        let log_obs = [0.0; NUM_BANDS];
        let r = residuals(&m, ParameterVector::new(-1.0, 0.01), &freqs, &log_obs);
        assert!(r.iter().all(|v| !v.is_finite()));
        let r = residuals(&m, ParameterVector::new(20.0, -0.01), &freqs, &log_obs);
        assert!(r.iter().all(|v| !v.is_finite()));
    }
}

use log::{debug, warn};
use ndarray::Array2;
use rayon::prelude::*;

use crate::config::FitConfig;
use crate::error::{DustMapError, Result};
use crate::formats::CoordinateMetadata;
use crate::model::ModifiedBlackbody;
use crate::output::OutputCube;
use crate::solver::{self, SedModel, SolverConfig};
use crate::types::{band_frequencies, Band, FitStatus, FluxVector, ParameterVector, PixelFit, NUM_BANDS};

/// Four co-registered band maps, validated to share one (rows, cols) grid.
pub struct BandImages {
    planes: [Array2<f64>; NUM_BANDS],
}

impl BandImages {
    /// Planes in [`Band::ALL`] order.
    pub fn new(planes: [Array2<f64>; NUM_BANDS]) -> Result<Self> {
        let expected = planes[0].dim();
        for band in Band::ALL.iter().skip(1) {
            let found = planes[band.index()].dim();
            if found != expected {
                return Err(DustMapError::InputShapeMismatch {
                    band: *band,
                    expected,
                    found,
                });
            }
        }
        Ok(BandImages { planes })
    }

    /// Check the reference header against the data grid.
    pub fn check_metadata(&self, metadata: &CoordinateMetadata) -> Result<()> {
        let (rows, cols) = self.shape();
        if metadata.shape() != (rows, cols) {
            return Err(DustMapError::MetadataMismatch {
                expected: (metadata.width, metadata.height),
                found: (cols, rows),
            });
        }
        Ok(())
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.planes[0].dim()
    }

    pub fn plane(&self, band: Band) -> &Array2<f64> {
        &self.planes[band.index()]
    }

    pub fn flux_at(&self, row: usize, col: usize) -> FluxVector {
        FluxVector(Band::ALL.map(|b| self.planes[b.index()][[row, col]]))
    }
}

/// Fit one pixel's SED.
///
/// Invalid flux short-circuits to NaN without running the solver.
/// Unconverged results become NaN unless `accept_unconverged` is set.
/// `ModelDomain` marks a model that is undefined at the initial guess; the
/// modified blackbody is defined there for any loggable flux.
pub fn fit_flux<M: SedModel>(
    model: &M,
    freqs: &[f64; NUM_BANDS],
    flux: &FluxVector,
    solver_config: &SolverConfig,
    accept_unconverged: bool,
) -> (ParameterVector, FitStatus, usize, f64) {
    if !flux.is_loggable() {
        return (ParameterVector::nan(), FitStatus::InvalidFlux, 0, f64::NAN);
    }

    let log_flux = flux.ln();
    let res = solver::solve(model, freqs, &log_flux, ParameterVector::initial_guess(), solver_config);

    if !res.params.is_finite() || !res.cost.is_finite() {
        return (ParameterVector::nan(), FitStatus::ModelDomain, res.iterations, res.cost);
    }
    if !res.converged {
        let params = if accept_unconverged { res.params } else { ParameterVector::nan() };
        return (params, FitStatus::NotConverged, res.iterations, res.cost);
    }
    (res.params, FitStatus::Converged, res.iterations, res.cost)
}

/// Fit every pixel of `images` independently and collect the results.
///
/// Pixels are processed in parallel over a flat row-major index; each task
/// reads one pixel and produces one [`PixelFit`], so ordering never affects
/// the result. Runs on the current rayon pool.
pub fn sweep_pixels(images: &BandImages, config: &FitConfig) -> Vec<PixelFit> {
    let (rows, cols) = images.shape();
    let model = ModifiedBlackbody::default();
    let freqs = band_frequencies();

    (0..rows * cols)
        .into_par_iter()
        .map(|idx| {
            let (row, col) = (idx / cols, idx % cols);
            let flux = images.flux_at(row, col);
            let (params, status, iterations, cost) =
                fit_flux(&model, &freqs, &flux, &config.solver, config.accept_unconverged);
            debug!(
                "pixel ({row}, {col}): T={:.4} tau={:.4e} {:?} after {iterations} iterations",
                params.temperature, params.tau, status
            );
            PixelFit {
                row,
                col,
                params,
                status,
                iterations,
                cost,
            }
        })
        .collect()
}

/// Run the sweep (when enabled) into a fresh cube.
pub fn sweep(images: &BandImages, config: &FitConfig) -> (OutputCube, Vec<PixelFit>) {
    let (rows, cols) = images.shape();
    let mut cube = OutputCube::new(rows, cols);
    if !config.fitting {
        return (cube, Vec::new());
    }

    let fits = sweep_pixels(images, config);
    for fit in &fits {
        cube.record(fit);
    }

    let failed = fits.iter().filter(|f| f.status != FitStatus::Converged).count();
    if failed > 0 {
        warn!("{failed} of {} pixels did not produce a converged fit", fits.len());
    }
    (cube, fits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(rows: usize, cols: usize, flux: [f64; NUM_BANDS]) -> BandImages {
        BandImages::new(flux.map(|f| Array2::from_elem((rows, cols), f))).unwrap()
    }

    fn model_flux(t: f64, tau: f64) -> [f64; NUM_BANDS] {
        ModifiedBlackbody::default().sed(ParameterVector::new(t, tau), &band_frequencies())
    }

    #[test]
    fn test_shape_mismatch_names_band() {
        let planes = [
            Array2::zeros((10, 10)),
            Array2::zeros((10, 10)),
            Array2::zeros((10, 10)),
            Array2::zeros((9, 10)),
        ];
        match BandImages::new(planes) {
            Err(DustMapError::InputShapeMismatch { band, expected, found }) => {
                assert_eq!(band, Band::Spire350);
                assert_eq!(expected, (10, 10));
                assert_eq!(found, (9, 10));
            }
            _ => panic!("expected InputShapeMismatch"),
        }
    }

    #[test]
    fn test_metadata_mismatch() {
        let images = uniform(3, 4, [1.0; NUM_BANDS]);
        assert!(images.check_metadata(&CoordinateMetadata::new(4, 3)).is_ok());
        assert!(matches!(
            images.check_metadata(&CoordinateMetadata::new(3, 4)),
            Err(DustMapError::MetadataMismatch { .. })
        ));
    }

    #[test]
    fn test_flux_at_band_order() {
        let planes = [
            Array2::from_elem((1, 2), 1.0),
            Array2::from_elem((1, 2), 2.0),
            Array2::from_elem((1, 2), 3.0),
            Array2::from_elem((1, 2), 4.0),
        ];
        let images = BandImages::new(planes).unwrap();
        assert_eq!(images.flux_at(0, 1), FluxVector([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_uniform_image_identical_fits() {
        let images = uniform(2, 2, model_flux(24.0, 0.012));
        let (_, fits) = sweep(&images, &FitConfig::default());
        assert_eq!(fits.len(), 4);
        for f in &fits {
            assert_eq!(f.status, FitStatus::Converged);
            assert_eq!(f.params, fits[0].params);
        }
        assert!((fits[0].params.temperature - 24.0).abs() < 0.24);
    }

    #[test]
    fn test_bad_pixel_does_not_stop_sweep() {
        let good = model_flux(20.0, 0.01);
        let planes = [
            Array2::from_shape_vec((1, 3), vec![good[0], 0.0, good[0]]).unwrap(),
            Array2::from_shape_vec((1, 3), vec![good[1], good[1], good[1]]).unwrap(),
            Array2::from_shape_vec((1, 3), vec![good[2], good[2], -1.0]).unwrap(),
            Array2::from_shape_vec((1, 3), vec![good[3], good[3], good[3]]).unwrap(),
        ];
        let images = BandImages::new(planes).unwrap();
        let (_, fits) = sweep(&images, &FitConfig::default());
        assert_eq!(fits[0].status, FitStatus::Converged);
        assert_eq!(fits[1].status, FitStatus::InvalidFlux);
        assert_eq!(fits[2].status, FitStatus::InvalidFlux);
        assert!(fits[1].params.temperature.is_nan());
        assert_eq!(fits[1].iterations, 0);
    }

    #[test]
    fn test_fitting_disabled_leaves_cube_empty() {
        let images = uniform(2, 3, model_flux(20.0, 0.01));
        let config = FitConfig {
            fitting: false,
            ..FitConfig::default()
        };
        let (cube, fits) = sweep(&images, &config);
        assert!(fits.is_empty());
        assert_eq!(cube.shape(), (2, 3));
    }

    #[test]
    fn test_unconverged_policy() {
        let flux = FluxVector(model_flux(45.0, 0.002));
        let model = ModifiedBlackbody::default();
        let freqs = band_frequencies();
        let capped = SolverConfig {
            max_iterations: 1,
            ..SolverConfig::default()
        };
        let (p, status, _, _) = fit_flux(&model, &freqs, &flux, &capped, false);
        assert_eq!(status, FitStatus::NotConverged);
        assert!(p.temperature.is_nan());

        let (p, status, _, _) = fit_flux(&model, &freqs, &flux, &capped, true);
        assert_eq!(status, FitStatus::NotConverged);
        assert!(p.is_finite());
    }

    /// A blackbody that is only defined above 30 K.
    struct WarmOnly(ModifiedBlackbody);

    impl SedModel for WarmOnly {
        fn ln_flux(&self, p: ParameterVector, nu: f64) -> f64 {
            if p.temperature < 30.0 {
                f64::NAN
            } else {
                self.0.ln_flux(p, nu)
            }
        }

        fn ln_flux_gradient(&self, p: ParameterVector, nu: f64) -> [f64; 2] {
            self.0.ln_flux_gradient(p, nu)
        }

        fn constrain(&self, trial: &mut [f64; 2], prev: &[f64; 2]) {
            SedModel::constrain(&self.0, trial, prev)
        }
    }

    #[test]
    fn test_model_undefined_at_start_is_domain_error() {
        let flux = FluxVector(model_flux(40.0, 0.01));
        let model = WarmOnly(ModifiedBlackbody::default());
        let (p, status, iterations, _) =
            fit_flux(&model, &band_frequencies(), &flux, &SolverConfig::default(), true);
        assert_eq!(status, FitStatus::ModelDomain);
        assert_eq!(iterations, 0);
        assert!(p.temperature.is_nan() && p.tau.is_nan());
    }

    /// Deterministic uniform samples in [0, 1).
    struct Lcg(u64);

    impl Lcg {
        fn next_f64(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64
        }
    }

    #[test]
    fn test_noisy_seds_converge() {
        // Real SEDs leave a non-zero residual at the minimum
        let model = ModifiedBlackbody::default();
        let freqs = band_frequencies();
        let config = SolverConfig::default();
        let mut rng = Lcg(12345);
        for _ in 0..500 {
            let t = 10.0 + 40.0 * rng.next_f64();
            let tau = 10f64.powf(-4.0 + 3.0 * rng.next_f64());
            let flux = model_flux(t, tau).map(|f| f * (1.0 + 0.4 * (rng.next_f64() - 0.5)));
            let (p, status, iterations, cost) =
                fit_flux(&model, &freqs, &FluxVector(flux), &config, false);
            assert_eq!(
                status,
                FitStatus::Converged,
                "flux={flux:?} truth T={t} tau={tau}: T={} tau={} after {iterations} iterations",
                p.temperature,
                p.tau
            );
            assert!(p.is_finite() && cost.is_finite() && cost > 0.0);
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let planes: [Array2<f64>; NUM_BANDS] = std::array::from_fn(|b| {
            Array2::from_shape_fn((4, 5), |(r, c)| {
                let t = 15.0 + r as f64 * 3.0;
                let tau = 0.004 * (1.0 + c as f64);
                model_flux(t, tau)[b]
            })
        });
        let images = BandImages::new(planes).unwrap();
        let config = FitConfig::default();
        let par = sweep_pixels(&images, &config);

        let model = ModifiedBlackbody::default();
        let freqs = band_frequencies();
        for f in &par {
            let (p, status, _, _) = fit_flux(&model, &freqs, &images.flux_at(f.row, f.col), &config.solver, false);
            assert_eq!(f.params.temperature.to_bits(), p.temperature.to_bits());
            assert_eq!(f.params.tau.to_bits(), p.tau.to_bits());
            assert_eq!(f.status, status);
        }
    }
}

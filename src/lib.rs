//! Dust temperature and optical-depth maps from four-band far-infrared images.
//!
//! Every pixel's 70/160/250/350 µm fluxes are fitted independently with a
//! modified blackbody (β = 2) in log space. The result is a 3-plane FITS cube
//! (T_dust, τ₁₆₀, β) on the input grid.

pub mod config;
pub mod constants;
pub mod error;
pub mod formats;
pub mod model;
pub mod output;
pub mod sed;
pub mod solver;
pub mod sweep;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;

pub use config::FitConfig;
pub use error::DustMapError;
pub use formats::CoordinateMetadata;
pub use output::{FinishedCube, FitSummary, OutputCube};
pub use solver::SolverConfig;
pub use sweep::BandImages;
pub use types::{Band, FitStatus, FluxVector, ParameterVector, PixelFit};

/// Input band files, in [`Band::ALL`] order.
#[derive(Debug, Clone)]
pub struct BandPaths(pub [PathBuf; types::NUM_BANDS]);

impl BandPaths {
    pub fn new<P: AsRef<Path>>(p70: P, p160: P, p250: P, p350: P) -> Self {
        BandPaths([p70, p160, p250, p350].map(|p| p.as_ref().to_path_buf()))
    }

    pub fn get(&self, band: Band) -> &Path {
        &self.0[band.index()]
    }
}

/// Files produced by a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub cube_path: PathBuf,
    pub map_paths: Vec<PathBuf>,
    pub sed_paths: Vec<PathBuf>,
    pub summary: FitSummary,
}

/// Per-pixel SED fitter with builder pattern.
pub struct DustMapper {
    config: FitConfig,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl DustMapper {
    pub fn new() -> Self {
        DustMapper {
            config: FitConfig::default(),
            thread_pool: None,
        }
    }

    /// Replace every option at once, e.g. from a JSON file.
    pub fn with_config(mut self, config: FitConfig) -> Self {
        self.config = config;
        self
    }

    /// Skip (false) or run (true) the per-pixel fit.
    pub fn with_fitting(mut self, enabled: bool) -> Self {
        self.config.fitting = enabled;
        self
    }

    /// Write per-pixel SED tables into `dir`.
    pub fn with_sed_plotting<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.config.sed_plotting = true;
        self.config.sed_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Render summary T / τ maps next to the cube.
    pub fn with_plotting(mut self, enabled: bool) -> Self {
        self.config.plotting = enabled;
        self
    }

    /// Keep solver output for unconverged pixels instead of writing NaN.
    pub fn accept_unconverged(mut self) -> Self {
        self.config.accept_unconverged = true;
        self
    }

    /// Iteration cap for each pixel's solve.
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.config.solver.max_iterations = n.max(1);
        self
    }

    /// Use a custom rayon thread pool.
    pub fn with_thread_pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.thread_pool = Some(pool);
        self
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fit pre-loaded band maps. No I/O.
    pub fn fit_images(
        &self,
        images: &BandImages,
        metadata: CoordinateMetadata,
    ) -> Result<(FinishedCube, Vec<PixelFit>)> {
        images.check_metadata(&metadata)?;
        let (cube, fits) = match &self.thread_pool {
            Some(pool) => pool.install(|| sweep::sweep(images, &self.config)),
            None => sweep::sweep(images, &self.config),
        };
        Ok((cube.finalize(metadata), fits))
    }

    /// Read four band files, fit, and write `<output_stem>.fits` plus any
    /// enabled diagnostics.
    pub fn run<P: AsRef<Path>>(&self, inputs: &BandPaths, output_stem: P) -> Result<RunReport> {
        let start = Instant::now();
        self.config.validate()?;
        let output_stem = output_stem.as_ref();

        let mut reference = None;
        let mut planes = Vec::with_capacity(types::NUM_BANDS);
        for band in Band::ALL {
            let path = inputs.get(band);
            let image = formats::read_band_image(path)
                .with_context(|| format!("Failed to read {} image {}", band.label(), path.display()))?;
            info!(
                "{}: {} ({}x{})",
                band.label(),
                path.display(),
                image.metadata.width,
                image.metadata.height
            );
            // Calibration comes from the longest-wavelength map
            if band == Band::Spire350 {
                reference = Some(image.metadata);
            }
            planes.push(image.data);
        }
        let metadata = reference.context("Missing 350um reference image")?;
        let planes: [ndarray::Array2<f64>; types::NUM_BANDS] = planes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Expected {} band images", types::NUM_BANDS))?;
        let images = BandImages::new(planes)?;

        let (rows, cols) = images.shape();
        info!(
            "Fitting {} pixels ({}x{}), fitting={} sed_plotting={} plotting={}",
            rows * cols,
            cols,
            rows,
            self.config.fitting,
            self.config.sed_plotting,
            self.config.plotting
        );

        let (cube, fits) = self.fit_images(&images, metadata)?;
        log_summary(cube.summary());

        let cube_path = stem_with_extension(output_stem, "fits");
        cube.write(&cube_path).context("Failed to write output cube")?;

        let mut map_paths = Vec::new();
        if self.config.plotting {
            for (channel, suffix) in [
                (output::CHANNEL_TEMPERATURE, "tdust"),
                (output::CHANNEL_TAU, "tau160"),
            ] {
                let path = stem_sibling(output_stem, suffix, "png");
                output::save_map_png(cube.channel(channel), &path)
                    .with_context(|| format!("Failed to render {}", path.display()))?;
                map_paths.push(path);
            }
        }

        let mut sed_paths = Vec::new();
        if self.config.sed_plotting {
            for fit in &fits {
                let flux = images.flux_at(fit.row, fit.col);
                let path = sed::write_sed_table(&self.config.sed_dir, fit, &flux)
                    .context("Failed to write SED table")?;
                sed_paths.push(path);
            }
            info!("Wrote {} SED tables to {}", sed_paths.len(), self.config.sed_dir.display());
        }

        info!("Finished in {:.1?}", start.elapsed());

        Ok(RunReport {
            cube_path,
            map_paths,
            sed_paths,
            summary: cube.summary().clone(),
        })
    }
}

impl Default for DustMapper {
    fn default() -> Self {
        Self::new()
    }
}

fn stem_with_extension(stem: &Path, ext: &str) -> PathBuf {
    let name = stem
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    stem.with_file_name(format!("{name}.{ext}"))
}

fn stem_sibling(stem: &Path, suffix: &str, ext: &str) -> PathBuf {
    let name = stem
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    stem.with_file_name(format!("{name}_{suffix}.{ext}"))
}

fn log_summary(summary: &FitSummary) {
    let counts: Vec<String> = summary
        .counts
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(s, n)| format!("{s:?}={n}"))
        .collect();
    info!("Fit status: {}", counts.join(" "));
    if let Some(t) = summary.temperature {
        info!("T_dust [K]: min {:.3} median {:.3} max {:.3}", t.min, t.median, t.max);
    }
    if let Some(tau) = summary.tau {
        info!("tau_160: min {:.3e} median {:.3e} max {:.3e}", tau.min, tau.median, tau.max);
    }
}

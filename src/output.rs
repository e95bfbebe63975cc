//! Output cube assembly and persistence.
//!
//! Channel 0 = T_dust [K], channel 1 = τ₁₆₀, channel 2 = β (constant).

use std::path::Path;

use image::{ImageBuffer, RgbImage};
use log::info;
use ndarray::{s, Array2, Array3, ArrayView2};

use crate::constants::BETA;
use crate::error::{DustMapError, Result};
use crate::formats::{write_fits_image, CoordinateMetadata, HeaderCard};
use crate::types::{FitStatus, PixelFit};

pub const CHANNEL_TEMPERATURE: usize = 0;
pub const CHANNEL_TAU: usize = 1;
pub const CHANNEL_BETA: usize = 2;
const NUM_CHANNELS: usize = 3;

/// Cube being filled by a sweep. Each pixel is written once via [`OutputCube::record`].
pub struct OutputCube {
    data: Array3<f64>,
    status: Array2<FitStatus>,
}

impl OutputCube {
    /// Zeroed cube; every pixel starts as [`FitStatus::Skipped`].
    pub fn new(rows: usize, cols: usize) -> Self {
        OutputCube {
            data: Array3::zeros((NUM_CHANNELS, rows, cols)),
            status: Array2::from_elem((rows, cols), FitStatus::Skipped),
        }
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.status.dim()
    }

    pub fn record(&mut self, fit: &PixelFit) {
        self.data[[CHANNEL_TEMPERATURE, fit.row, fit.col]] = fit.params.temperature;
        self.data[[CHANNEL_TAU, fit.row, fit.col]] = fit.params.tau;
        self.status[[fit.row, fit.col]] = fit.status;
    }

    /// Broadcast β and attach the reference calibration.
    pub fn finalize(mut self, metadata: CoordinateMetadata) -> FinishedCube {
        self.data.slice_mut(s![CHANNEL_BETA, .., ..]).fill(BETA);
        let summary = FitSummary::from_cube(&self.data, &self.status);
        FinishedCube {
            data: self.data,
            status: self.status,
            metadata,
            summary,
        }
    }
}

/// Completed cube, ready to be written once.
pub struct FinishedCube {
    data: Array3<f64>,
    status: Array2<FitStatus>,
    metadata: CoordinateMetadata,
    summary: FitSummary,
}

impl FinishedCube {
    /// Shape as (channels, rows, cols).
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn status(&self) -> &Array2<FitStatus> {
        &self.status
    }

    pub fn metadata(&self) -> &CoordinateMetadata {
        &self.metadata
    }

    pub fn summary(&self) -> &FitSummary {
        &self.summary
    }

    pub fn channel(&self, channel: usize) -> ArrayView2<'_, f64> {
        self.data.slice(s![channel, .., ..])
    }

    /// Write the cube as `path`, replacing any existing file, and the
    /// status plane as `<stem>_status.fits` next to it.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut cards: Vec<HeaderCard> = vec![
            HeaderCard::Text("PLANE1", "TDUST".into(), Some("dust temperature [K]")),
            HeaderCard::Text("PLANE2", "TAU160".into(), Some("optical depth at 160 um")),
            HeaderCard::Text("PLANE3", "BETA".into(), Some("fixed spectral index")),
            HeaderCard::Float("BETA", BETA, Some("opacity spectral index (fixed)")),
        ];
        cards.extend(self.metadata.cards.iter().cloned().map(HeaderCard::Raw));
        write_fits_image(path, &self.data, &cards)?;

        let status_path = sibling(path, "_status", "fits");
        let codes = self.status.mapv(|s| s.code() as f64);
        let mut status_cards = vec![HeaderCard::Text(
            "CONTENT",
            "FITSTAT".into(),
            Some("0=ok 1=noconv 2=badflux 3=domain 4=skip"),
        )];
        status_cards.extend(self.metadata.cards.iter().cloned().map(HeaderCard::Raw));
        write_fits_image(&status_path, &codes, &status_cards)?;

        info!("Wrote {} and {}", path.display(), status_path.display());
        Ok(())
    }
}

/// Per-status counts and parameter ranges over fitted pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub counts: Vec<(FitStatus, usize)>,
    pub temperature: Option<ValueRange>,
    pub tau: Option<ValueRange>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub median: f64,
    pub max: f64,
}

impl FitSummary {
    fn from_cube(data: &Array3<f64>, status: &Array2<FitStatus>) -> Self {
        let counts = FitStatus::ALL
            .iter()
            .map(|&st| (st, status.iter().filter(|&&s| s == st).count()))
            .collect();
        FitSummary {
            counts,
            temperature: value_range(data.slice(s![CHANNEL_TEMPERATURE, .., ..]), status),
            tau: value_range(data.slice(s![CHANNEL_TAU, .., ..]), status),
        }
    }

    pub fn count(&self, status: FitStatus) -> usize {
        self.counts
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }

    /// Pixels whose output slot is a NaN sentinel.
    pub fn failed(&self) -> usize {
        self.count(FitStatus::NotConverged)
            + self.count(FitStatus::InvalidFlux)
            + self.count(FitStatus::ModelDomain)
    }
}

fn value_range(plane: ArrayView2<f64>, status: &Array2<FitStatus>) -> Option<ValueRange> {
    let mut vals: Vec<f64> = plane
        .iter()
        .zip(status.iter())
        .filter(|(v, s)| v.is_finite() && **s != FitStatus::Skipped)
        .map(|(v, _)| *v)
        .collect();
    if vals.is_empty() {
        return None;
    }
    vals.sort_unstable_by(|a, b| a.total_cmp(b));
    Some(ValueRange {
        min: vals[0],
        median: vals[vals.len() / 2],
        max: vals[vals.len() - 1],
    })
}

fn sibling(path: &Path, suffix: &str, ext: &str) -> std::path::PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    path.with_file_name(format!("{stem}{suffix}.{ext}"))
}

/// Render a parameter map as an 8-bit colour PNG.
///
/// Log-normalised between the smallest and largest positive values;
/// non-positive and non-finite pixels take the smallest positive value.
/// Row 0 is drawn at the bottom.
pub fn save_map_png(plane: ArrayView2<f64>, path: &Path) -> Result<()> {
    let (rows, cols) = plane.dim();
    let positive = plane.iter().copied().filter(|v| v.is_finite() && *v > 0.0);
    let (lo, hi) = positive.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });

    let mut rgb = vec![0u8; rows * cols * 3];
    if lo.is_finite() {
        let (log_lo, log_hi) = (lo.ln(), hi.ln());
        let span = if log_hi > log_lo { log_hi - log_lo } else { 1.0 };
        for ((r, c), &v) in plane.indexed_iter() {
            let v = if v.is_finite() && v > 0.0 { v } else { lo };
            let t = ((v.ln() - log_lo) / span).clamp(0.0, 1.0);
            let out_row = rows - 1 - r;
            let off = (out_row * cols + c) * 3;
            rgb[off..off + 3].copy_from_slice(&viridis(t));
        }
    }

    let img: RgbImage = ImageBuffer::from_raw(cols as u32, rows as u32, rgb).ok_or_else(|| {
        DustMapError::OutputWrite {
            path: path.to_path_buf(),
            source: std::io::Error::other("image buffer size mismatch"),
        }
    })?;
    img.save(path).map_err(|e| DustMapError::OutputWrite {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    Ok(())
}

/// Piecewise-linear approximation of the viridis colour map.
fn viridis(t: f64) -> [u8; 3] {
    const STOPS: [[f64; 3]; 5] = [
        [68.0, 1.0, 84.0],
        [59.0, 82.0, 139.0],
        [33.0, 145.0, 140.0],
        [94.0, 201.0, 98.0],
        [253.0, 231.0, 37.0],
    ];
    let x = t.clamp(0.0, 1.0) * (STOPS.len() - 1) as f64;
    let i = (x.floor() as usize).min(STOPS.len() - 2);
    let f = x - i as f64;
    let mut out = [0u8; 3];
    for k in 0..3 {
        out[k] = (STOPS[i][k] + f * (STOPS[i + 1][k] - STOPS[i][k])).round() as u8;
    }
    out
}

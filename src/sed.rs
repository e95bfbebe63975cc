//! Per-pixel SED diagnostic tables.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::constants::SED_CURVE_GRID_HZ;
use crate::error::{DustMapError, Result};
use crate::model::ModifiedBlackbody;
use crate::types::{Band, FluxVector, PixelFit};

#[derive(Serialize)]
struct SedRow<'a> {
    kind: &'a str,
    band: &'a str,
    frequency_hz: f64,
    flux: f64,
}

/// Path of the diagnostic table for pixel (row, col).
pub fn sed_table_path(dir: &Path, row: usize, col: usize) -> PathBuf {
    dir.join(format!("SED_({row}, {col}).csv"))
}

/// Write observed band fluxes and, when the fit produced finite parameters,
/// the model curve over the diagnostic frequency grid.
pub fn write_sed_table(dir: &Path, fit: &PixelFit, flux: &FluxVector) -> Result<PathBuf> {
    let path = sed_table_path(dir, fit.row, fit.col);
    let wrap = |source: std::io::Error| DustMapError::OutputWrite {
        path: path.clone(),
        source,
    };

    fs::create_dir_all(dir).map_err(wrap)?;
    let mut writer = csv::Writer::from_path(&path).map_err(|e| wrap(e.into()))?;

    for band in Band::ALL {
        writer
            .serialize(SedRow {
                kind: "observed",
                band: band.label(),
                frequency_hz: band.nominal_frequency_hz(),
                flux: flux.get(band),
            })
            .map_err(|e| wrap(e.into()))?;
    }

    if fit.params.is_finite() {
        let model = ModifiedBlackbody::default();
        let (start, stop, step) = SED_CURVE_GRID_HZ;
        let steps = ((stop - start) / step).ceil() as usize;
        for i in 0..steps {
            let nu = start + i as f64 * step;
            writer
                .serialize(SedRow {
                    kind: "model",
                    band: "",
                    frequency_hz: nu,
                    flux: model.flux(fit.params, nu),
                })
                .map_err(|e| wrap(e.into()))?;
        }
    }

    writer.flush().map_err(wrap)?;
    Ok(path)
}

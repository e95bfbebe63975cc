pub mod fits;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{DustMapError, Result};

pub use fits::{read_fits_image, write_fits_image, CoordinateMetadata, FitsImage, HeaderCard};

/// Read a band map. Only FITS is supported; the check mirrors the
/// extension-or-magic sniffing used for inputs elsewhere.
pub fn read_band_image(path: &Path) -> Result<FitsImage> {
    if !is_fits(path) {
        return Err(DustMapError::InvalidFits(format!(
            "{} is not a FITS file",
            path.display()
        )));
    }
    read_fits_image(path)
}

fn is_fits(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if ext.eq_ignore_ascii_case("fits")
            || ext.eq_ignore_ascii_case("fit")
            || ext.eq_ignore_ascii_case("fts")
        {
            return true;
        }
    }
    // Check magic bytes: "SIMPLE  ="
    if let Ok(mut f) = File::open(path) {
        let mut buf = [0u8; 9];
        if f.read_exact(&mut buf).is_ok() && &buf == b"SIMPLE  =" {
            return true;
        }
    }
    false
}

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::warn;
use ndarray::{Array2, ArrayBase, Data, Dimension};
use rayon::prelude::*;

use crate::error::{DustMapError, Result};

const FITS_BLOCK_SIZE: usize = 2880;
const FITS_CARD_SIZE: usize = 80;

/// Keyword prefixes describing spatial calibration. Carried from the
/// reference input onto the output cube.
const CALIBRATION_PREFIXES: &[&str] = &[
    "WCSAXES", "CTYPE", "CRVAL", "CRPIX", "CDELT", "CUNIT", "CROTA", "CD1_", "CD2_", "PC1_",
    "PC2_", "EQUINOX", "EPOCH", "RADESYS", "RADECSYS", "LONPOLE", "LATPOLE", "DATE-OBS",
    "MJD-OBS", "OBJECT", "TELESCOP",
];

/// Spatial grid and calibration of an image, carried through to the output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoordinateMetadata {
    /// NAXIS1: columns.
    pub width: usize,
    /// NAXIS2: rows.
    pub height: usize,
    /// Raw 80-column calibration cards, in header order.
    pub cards: Vec<String>,
}

impl CoordinateMetadata {
    pub fn new(width: usize, height: usize) -> Self {
        CoordinateMetadata {
            width,
            height,
            cards: Vec::new(),
        }
    }

    /// Numeric value of a carried card, e.g. `CRVAL1`.
    pub fn float_value(&self, keyword: &str) -> Option<f64> {
        self.cards
            .iter()
            .find_map(|c| parse_float_keyword(c, &pad_keyword(keyword)))
    }

    /// String value of a carried card, e.g. `CTYPE1`.
    pub fn string_value(&self, keyword: &str) -> Option<String> {
        self.cards
            .iter()
            .find_map(|c| parse_string_keyword(c, &pad_keyword(keyword)))
    }

    /// Grid shape as (rows, cols).
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// A 2-D primary-HDU image converted to f64.
pub struct FitsImage {
    pub metadata: CoordinateMetadata,
    /// Pixel values, shape (NAXIS2, NAXIS1).
    pub data: Array2<f64>,
}

struct FitsHeader {
    bitpix: i32,
    naxis: i32,
    naxis1: usize,
    naxis2: usize,
    extra_planes: usize,
    bzero: f64,
    bscale: f64,
    blank: Option<i64>,
    calibration: Vec<String>,
}

fn pad_keyword(keyword: &str) -> String {
    format!("{:<8}", keyword)
}

fn get_keyword_value(card: &str, keyword: &str) -> Option<String> {
    if !card.starts_with(keyword) {
        return None;
    }
    let eq_pos = card.find('=')?;
    let val = card[eq_pos + 1..].trim_start();
    Some(val.to_string())
}

fn parse_int_keyword(card: &str, keyword: &str) -> Option<i64> {
    let val = get_keyword_value(card, keyword)?;
    let num_str: String = val
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-' || *c == '+')
        .collect();
    num_str.parse().ok()
}

fn parse_float_keyword(card: &str, keyword: &str) -> Option<f64> {
    let val = get_keyword_value(card, keyword)?;
    let num_str: String = val
        .chars()
        .take_while(|c| {
            c.is_ascii_digit() || matches!(*c, '-' | '+' | '.' | 'E' | 'e' | 'D' | 'd')
        })
        .map(|c| if c == 'D' || c == 'd' { 'E' } else { c })
        .collect();
    num_str.parse().ok()
}

fn parse_string_keyword(card: &str, keyword: &str) -> Option<String> {
    let val = get_keyword_value(card, keyword)?;
    let val = val.strip_prefix('\'')?;
    let end = val.find('\'')?;
    Some(val[..end].trim_end().to_string())
}

fn is_calibration_card(card: &str) -> bool {
    let key = card.get(..8).unwrap_or(card).trim_end();
    CALIBRATION_PREFIXES.iter().any(|p| key.starts_with(p))
        && card.as_bytes().get(8) == Some(&b'=')
}

fn read_fits_header<R: Read>(reader: &mut R) -> Result<FitsHeader> {
    let mut hdr = FitsHeader {
        bitpix: 0,
        naxis: 0,
        naxis1: 0,
        naxis2: 0,
        extra_planes: 1,
        bzero: 0.0,
        bscale: 1.0,
        blank: None,
        calibration: Vec::new(),
    };

    let mut block = [0u8; FITS_BLOCK_SIZE];
    let mut found_end = false;
    let mut first_card = true;

    let mut block_index = 0;
    while !found_end {
        reader
            .read_exact(&mut block)
            .map_err(|e| DustMapError::InvalidFits(format!("truncated header: {e}")))?;

        block_index += 1;
        for i in 0..(FITS_BLOCK_SIZE / FITS_CARD_SIZE) {
            let card_bytes = &block[i * FITS_CARD_SIZE..(i + 1) * FITS_CARD_SIZE];
            let card = match std::str::from_utf8(card_bytes) {
                Ok(c) => c,
                Err(_) => {
                    warn!("Skipping non-ASCII header card {}", (block_index - 1) * 36 + i + 1);
                    ""
                }
            };

            if first_card {
                if !card.starts_with("SIMPLE  =") {
                    return Err(DustMapError::InvalidFits("missing SIMPLE card".into()));
                }
                first_card = false;
                continue;
            }

            if card.starts_with("END") && card.as_bytes().get(3).map_or(true, |&b| b == b' ') {
                found_end = true;
                break;
            }

            if let Some(v) = parse_int_keyword(card, "BITPIX  ") {
                hdr.bitpix = v as i32;
            } else if let Some(v) = parse_int_keyword(card, "NAXIS   ") {
                hdr.naxis = v as i32;
            } else if let Some(v) = parse_int_keyword(card, "NAXIS1  ") {
                hdr.naxis1 = v.max(0) as usize;
            } else if let Some(v) = parse_int_keyword(card, "NAXIS2  ") {
                hdr.naxis2 = v.max(0) as usize;
            } else if card.starts_with("NAXIS") {
                // Higher axes must be degenerate for a 2-D map
                if let Some(v) = card
                    .get(..8)
                    .and_then(|k| parse_int_keyword(card, k))
                {
                    hdr.extra_planes = hdr
                        .extra_planes
                        .checked_mul(v.max(0) as usize)
                        .ok_or_else(|| DustMapError::InvalidFits("axis lengths overflow".into()))?;
                }
            } else if let Some(v) = parse_float_keyword(card, "BZERO   ") {
                hdr.bzero = v;
            } else if let Some(v) = parse_float_keyword(card, "BSCALE  ") {
                hdr.bscale = v;
            } else if let Some(v) = parse_int_keyword(card, "BLANK   ") {
                hdr.blank = Some(v);
            } else if is_calibration_card(card) {
                hdr.calibration.push(card.to_string());
            }
        }
    }

    if hdr.bitpix == 0 {
        return Err(DustMapError::InvalidFits("missing BITPIX keyword".into()));
    }
    if !matches!(hdr.bitpix, 8 | 16 | 32 | -32 | -64) {
        return Err(DustMapError::InvalidFits(format!(
            "unsupported BITPIX value: {}",
            hdr.bitpix
        )));
    }
    if hdr.naxis < 2 {
        return Err(DustMapError::InvalidFits(
            "image must have at least 2 dimensions".into(),
        ));
    }
    if hdr.naxis1 == 0 || hdr.naxis2 == 0 {
        return Err(DustMapError::InvalidFits("invalid image dimensions".into()));
    }
    if hdr.extra_planes != 1 {
        return Err(DustMapError::InvalidFits(format!(
            "expected a single 2-D plane, found {} planes",
            hdr.extra_planes
        )));
    }

    Ok(hdr)
}

/// Read the primary HDU of a FITS file as an f64 map.
///
/// Integer BLANK values and non-finite floats come back as NaN; BZERO and
/// BSCALE are applied.
pub fn read_fits_image(path: &Path) -> Result<FitsImage> {
    let file = File::open(path).map_err(|source| DustMapError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let hdr = read_fits_header(&mut reader)?;

    let bytes_per_pixel = (hdr.bitpix.unsigned_abs() as usize) / 8;
    let data_len = hdr
        .naxis1
        .checked_mul(hdr.naxis2)
        .and_then(|n| n.checked_mul(bytes_per_pixel))
        .ok_or_else(|| DustMapError::InvalidFits("image size overflows".into()))?;
    let mut raw_data = vec![0u8; data_len];
    reader
        .read_exact(&mut raw_data)
        .map_err(|e| DustMapError::InvalidFits(format!("truncated data unit: {e}")))?;

    let values = decode_samples(&raw_data, &hdr)?;
    let data = Array2::from_shape_vec((hdr.naxis2, hdr.naxis1), values)
        .map_err(|e| DustMapError::InvalidFits(e.to_string()))?;

    Ok(FitsImage {
        metadata: CoordinateMetadata {
            width: hdr.naxis1,
            height: hdr.naxis2,
            cards: hdr.calibration,
        },
        data,
    })
}

fn decode_samples(raw: &[u8], hdr: &FitsHeader) -> Result<Vec<f64>> {
    const CHUNK: usize = 65536;
    const PAR_THRESHOLD: usize = CHUNK * 2;

    let bytes_per_pixel = (hdr.bitpix.unsigned_abs() as usize) / 8;
    let num_pixels = raw.len() / bytes_per_pixel;
    let bzero = hdr.bzero;
    let bscale = hdr.bscale;
    let blank = hdr.blank;

    let scale_int = move |v: i64| -> f64 {
        if blank == Some(v) {
            f64::NAN
        } else {
            bzero + bscale * v as f64
        }
    };
    let scale_float = move |v: f64| -> f64 {
        if v.is_finite() {
            bzero + bscale * v
        } else {
            f64::NAN
        }
    };

    let convert: Box<dyn Fn(&[u8], &mut [f64]) + Sync> = match hdr.bitpix {
        8 => Box::new(move |s: &[u8], d: &mut [f64]| {
            for i in 0..d.len() {
                d[i] = scale_int(s[i] as i64);
            }
        }),
        16 => Box::new(move |s: &[u8], d: &mut [f64]| {
            for i in 0..d.len() {
                d[i] = scale_int(i16::from_be_bytes([s[i * 2], s[i * 2 + 1]]) as i64);
            }
        }),
        32 => Box::new(move |s: &[u8], d: &mut [f64]| {
            for i in 0..d.len() {
                let off = i * 4;
                let v = i32::from_be_bytes([s[off], s[off + 1], s[off + 2], s[off + 3]]);
                d[i] = scale_int(v as i64);
            }
        }),
        -32 => Box::new(move |s: &[u8], d: &mut [f64]| {
            for i in 0..d.len() {
                let off = i * 4;
                let v = f32::from_be_bytes([s[off], s[off + 1], s[off + 2], s[off + 3]]);
                d[i] = scale_float(v as f64);
            }
        }),
        -64 => Box::new(move |s: &[u8], d: &mut [f64]| {
            for i in 0..d.len() {
                let off = i * 8;
                let mut b = [0u8; 8];
                b.copy_from_slice(&s[off..off + 8]);
                d[i] = scale_float(f64::from_be_bytes(b));
            }
        }),
        other => {
            return Err(DustMapError::InvalidFits(format!(
                "unsupported BITPIX value: {other}"
            )))
        }
    };

    let mut out = vec![0f64; num_pixels];
    if num_pixels >= PAR_THRESHOLD {
        raw.par_chunks(CHUNK * bytes_per_pixel)
            .zip(out.par_chunks_mut(CHUNK))
            .for_each(|(s, d)| convert(s, d));
    } else {
        convert(raw, &mut out);
    }
    Ok(out)
}

fn format_card(keyword: &str, value: &str, comment: Option<&str>) -> String {
    let mut card = format!("{:<8}= {:>20}", keyword, value);
    if let Some(c) = comment {
        card.push_str(" / ");
        card.push_str(c);
    }
    fit_card(card)
}

fn format_string_card(keyword: &str, value: &str, comment: Option<&str>) -> String {
    let quoted = format!("'{:<8}'", value.replace('\'', "''"));
    let mut card = format!("{:<8}= {:<20}", keyword, quoted);
    if let Some(c) = comment {
        card.push_str(" / ");
        card.push_str(c);
    }
    fit_card(card)
}

fn fit_card(mut card: String) -> String {
    card.truncate(FITS_CARD_SIZE);
    format!("{:<80}", card)
}

/// A keyword card for [`write_fits_image`].
pub enum HeaderCard {
    Float(&'static str, f64, Option<&'static str>),
    Text(&'static str, String, Option<&'static str>),
    /// A pre-formatted 80-column card, e.g. carried calibration.
    Raw(String),
}

impl HeaderCard {
    fn render(&self) -> String {
        match self {
            HeaderCard::Float(k, v, c) => format_card(k, &format_float(*v), *c),
            HeaderCard::Text(k, v, c) => format_string_card(k, v, *c),
            HeaderCard::Raw(card) => fit_card(card.clone()),
        }
    }
}

fn format_float(v: f64) -> String {
    let s = format!("{:E}", v);
    if s.contains('.') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        s.replacen('E', ".0E", 1)
    }
}

/// Write `data` as a BITPIX -64 primary HDU, overwriting `path`.
///
/// Axis order follows FITS: the last ndarray axis is NAXIS1.
pub fn write_fits_image<S, D>(path: &Path, data: &ArrayBase<S, D>, cards: &[HeaderCard]) -> Result<()>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    let wrap = |source: std::io::Error| DustMapError::OutputWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut header = Vec::new();
    header.push(format_card("SIMPLE", "T", Some("conforms to FITS standard")));
    header.push(format_card("BITPIX", "-64", Some("IEEE double precision")));
    header.push(format_card("NAXIS", &data.ndim().to_string(), None));
    for (i, n) in data.shape().iter().rev().enumerate() {
        header.push(format_card(&format!("NAXIS{}", i + 1), &n.to_string(), None));
    }
    header.extend(cards.iter().map(HeaderCard::render));
    header.push(fit_card("END".to_string()));

    let file = File::create(path).map_err(wrap)?;
    let mut writer = BufWriter::new(file);

    let mut header_bytes: Vec<u8> = header.concat().into_bytes();
    pad_to_block(&mut header_bytes, b' ');
    writer.write_all(&header_bytes).map_err(wrap)?;

    let mut body = Vec::with_capacity(data.len() * 8 + FITS_BLOCK_SIZE);
    for v in data.iter() {
        body.extend_from_slice(&v.to_be_bytes());
    }
    pad_to_block(&mut body, 0);
    writer.write_all(&body).map_err(wrap)?;
    writer.flush().map_err(wrap)?;
    Ok(())
}

fn pad_to_block(bytes: &mut Vec<u8>, fill: u8) {
    let rem = bytes.len() % FITS_BLOCK_SIZE;
    if rem != 0 {
        bytes.resize(bytes.len() + FITS_BLOCK_SIZE - rem, fill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_card_width() {
        let c = format_card("NAXIS1", "220", None);
        assert_eq!(c.len(), 80);
        assert!(c.starts_with("NAXIS1  =                  220"));
        let s = format_string_card("CTYPE1", "RA---TAN", Some("projection"));
        assert_eq!(s.len(), 80);
        assert_eq!(parse_string_keyword(&s, "CTYPE1  ").as_deref(), Some("RA---TAN"));
    }

    #[test]
    fn test_parse_float_with_exponent_and_comment() {
        let card = fit_card("CDELT1  = -1.6666666666667E-03 / deg".to_string());
        let v = parse_float_keyword(&card, "CDELT1  ").unwrap();
        assert!((v + 1.6666666666667e-3).abs() < 1e-15);
        let card = fit_card("CRVAL2  =   6.15D+01".to_string());
        assert_eq!(parse_float_keyword(&card, "CRVAL2  "), Some(61.5));
    }

    #[test]
    fn test_calibration_card_filter() {
        assert!(is_calibration_card(&fit_card("CRPIX1  =  110.5".into())));
        assert!(is_calibration_card(&fit_card("CD1_1   =  -0.001".into())));
        assert!(!is_calibration_card(&fit_card("BUNIT   = 'MJy/sr'".into())));
        assert!(!is_calibration_card(&fit_card("NAXIS1  = 10".into())));
        assert!(!is_calibration_card(&fit_card("HISTORY CRVAL1 changed".into())));
    }

    #[test]
    fn test_float_format_has_decimal_point() {
        assert_eq!(format_float(2.0), "2.0E0");
        assert!(format_float(-1.5e-3).contains('.'));
    }

    #[test]
    fn test_header_rejects_non_fits() {
        let block = vec![b' '; FITS_BLOCK_SIZE];
        let err = read_fits_header(&mut block.as_slice()).err().unwrap();
        assert!(matches!(err, DustMapError::InvalidFits(_)));
    }

    #[test]
    fn test_cube_roundtrip_plane_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.fits");
        let cube = Array3::from_shape_fn((3, 2, 4), |(c, r, l)| (c * 100 + r * 10 + l) as f64);
        write_fits_image(&path, &cube, &[]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() % FITS_BLOCK_SIZE, 0);
        let header = std::str::from_utf8(&bytes[..FITS_BLOCK_SIZE]).unwrap();
        assert!(header.contains("NAXIS1  =                    4"));
        assert!(header.contains("NAXIS2  =                    2"));
        assert!(header.contains("NAXIS3  =                    3"));

        // Second sample along NAXIS1 is column 1 of plane 0, row 0
        let second = f64::from_be_bytes(bytes[FITS_BLOCK_SIZE + 8..FITS_BLOCK_SIZE + 16].try_into().unwrap());
        assert_eq!(second, 1.0);
    }

    #[test]
    fn test_image_roundtrip_with_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("band.fits");
        let img = Array2::from_shape_fn((3, 5), |(r, c)| 1e-3 * (r as f64 + 1.0) + c as f64 * 1e-5);
        let cards = vec![
            HeaderCard::Text("CTYPE1", "RA---TAN".into(), None),
            HeaderCard::Float("CRVAL1", 348.4375, None),
            HeaderCard::Float("CDELT2", 1.6666666666667e-3, None),
            HeaderCard::Text("BUNIT", "erg/s/cm2/Hz/sr".into(), None),
        ];
        write_fits_image(&path, &img, &cards).unwrap();

        let read = read_fits_image(&path).unwrap();
        assert_eq!(read.data.dim(), (3, 5));
        assert_eq!(read.metadata.shape(), (3, 5));
        assert_eq!(read.data, img);
        assert_eq!(read.metadata.string_value("CTYPE1").as_deref(), Some("RA---TAN"));
        assert_eq!(read.metadata.float_value("CRVAL1"), Some(348.4375));
        assert!(read.metadata.float_value("CDELT2").is_some());
        // BUNIT is not a calibration card
        assert_eq!(read.metadata.cards.len(), 3);
    }

    fn header_blocks(cards: &[&str]) -> Vec<u8> {
        let mut bytes: Vec<u8> = cards.iter().map(|c| fit_card(c.to_string())).collect::<String>().into_bytes();
        pad_to_block(&mut bytes, b' ');
        bytes
    }

    #[test]
    fn test_overflowing_axes_rejected() {
        let bytes = header_blocks(&[
            "SIMPLE  =                    T",
            "BITPIX  =                  -64",
            "NAXIS   =                    4",
            "NAXIS1  =                    2",
            "NAXIS2  =                    2",
            "NAXIS3  =  9223372036854775807",
            "NAXIS4  =  9223372036854775807",
            "END",
        ]);
        let err = read_fits_header(&mut bytes.as_slice()).err().unwrap();
        assert!(matches!(err, DustMapError::InvalidFits(ref m) if m.contains("overflow")), "{err}");
    }

    #[test]
    fn test_oversized_image_rejected_before_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.fits");
        let bytes = header_blocks(&[
            "SIMPLE  =                    T",
            "BITPIX  =                  -64",
            "NAXIS   =                    2",
            "NAXIS1  =  4611686018427387904",
            "NAXIS2  =                    8",
            "END",
        ]);
        std::fs::write(&path, bytes).unwrap();
        let err = read_fits_image(&path).err().unwrap();
        assert!(matches!(err, DustMapError::InvalidFits(ref m) if m.contains("overflow")), "{err}");
    }

    #[test]
    fn test_non_ascii_card_skipped() {
        let mut bytes = header_blocks(&[
            "SIMPLE  =                    T",
            "BITPIX  =                  -64",
            "NAXIS   =                    2",
            "NAXIS1  =                    1",
            "NAXIS2  =                    1",
            "OBJECT  = 'x'",
            "END",
        ]);
        // Corrupt the OBJECT card with an invalid UTF-8 byte
        bytes[5 * FITS_CARD_SIZE + 11] = 0xFF;
        let hdr = read_fits_header(&mut bytes.as_slice()).unwrap();
        assert_eq!((hdr.naxis1, hdr.naxis2), (1, 1));
        assert!(hdr.calibration.is_empty());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = read_fits_image(Path::new("/nonexistent/band.fits")).err().unwrap();
        assert!(matches!(err, DustMapError::Io { .. }));
    }
}

//! GeoTIFF encoding and decoding.
//!
//! Output files are classic little-endian TIFF, single band, tiled
//! (256 x 256), deflate compressed, with GeoTIFF georeferencing tags and the
//! GDAL nodata tag set to `nan` for float rasters:
//!
//! ```text
//! header (8) | compressed tiles ... | IFD | out-of-line tag values
//! ```
//!
//! Decoding goes through the `tiff` crate and accepts any integer or float
//! single-band layout it supports.

use std::io::{Cursor, Write};
use std::path::Path;

use rayon::prelude::*;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::debug;

use ntl_common::CrsCode;

use crate::error::{MosaicError, Result};
use crate::raster::{GeoTransform, TileRaster};

/// Edge length of internal tiles; must be a multiple of 16.
pub const TILE_SIZE: usize = 256;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

const COMPRESSION_DEFLATE: u16 = 8;
const PHOTOMETRIC_MIN_IS_BLACK: u16 = 1;
const PLANAR_CONTIG: u16 = 1;

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;

/// A pixel type that can be written to a GeoTIFF band.
pub trait Sample: Copy + Send + Sync + 'static {
    /// TIFF SampleFormat: 1 = unsigned integer, 2 = signed integer, 3 = IEEE float.
    const SAMPLE_FORMAT: u16;
    /// Value used for the padding of partial edge tiles.
    const FILL: Self;
    /// GDAL nodata tag value, if any.
    const NODATA: Option<&'static str>;

    fn extend_le(self, out: &mut Vec<u8>);
}

impl Sample for f32 {
    const SAMPLE_FORMAT: u16 = 3;
    const FILL: Self = f32::NAN;
    const NODATA: Option<&'static str> = Some("nan");

    #[inline]
    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Sample for i32 {
    const SAMPLE_FORMAT: u16 = 2;
    const FILL: Self = 0;
    const NODATA: Option<&'static str> = None;

    #[inline]
    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Sample for u32 {
    const SAMPLE_FORMAT: u16 = 1;
    const FILL: Self = 0;
    const NODATA: Option<&'static str> = None;

    #[inline]
    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// Encode a raster as a tiled, deflate-compressed GeoTIFF.
///
/// Rasters that are not north-up are reoriented first, since the pixel
/// scale/tiepoint pair can only describe a top-left origin.
pub fn encode<T: Sample>(raster: &TileRaster<T>) -> Result<Vec<u8>> {
    if raster.width == 0 || raster.height == 0 {
        return Err(MosaicError::encode("cannot encode an empty raster"));
    }
    let (pw, ph) = raster.transform.pixel_size();
    if !(pw.is_finite() && ph.is_finite()) || pw == 0.0 || ph == 0.0 {
        return Err(MosaicError::encode(format!("degenerate pixel size {} x {}", pw, ph)));
    }
    let raster = raster.north_up();
    let raster = raster.as_ref();

    let tiles_across = raster.width.div_ceil(TILE_SIZE);
    let tiles_down = raster.height.div_ceil(TILE_SIZE);

    let tiles: Vec<Vec<u8>> = (0..tiles_across * tiles_down)
        .into_par_iter()
        .map(|index| deflate_tile(raster, index % tiles_across, index / tiles_across))
        .collect::<std::io::Result<_>>()
        .map_err(|e| MosaicError::encode(format!("tile compression failed: {}", e)))?;

    let mut tiff = Vec::new();

    // Header; the IFD offset is patched once the tiles are written
    tiff.extend_from_slice(b"II");
    tiff.extend_from_slice(&42u16.to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes());

    let mut offsets = Vec::with_capacity(tiles.len());
    let mut byte_counts = Vec::with_capacity(tiles.len());
    for tile in &tiles {
        offsets.push(to_u32(tiff.len())?);
        byte_counts.push(to_u32(tile.len())?);
        tiff.extend_from_slice(tile);
    }
    if tiff.len() % 2 == 1 {
        tiff.push(0);
    }

    let t = &raster.transform;
    let mut entries = vec![
        IfdEntry::long(256, &[to_u32(raster.width)?]),
        IfdEntry::long(257, &[to_u32(raster.height)?]),
        IfdEntry::short(258, &[32]),
        IfdEntry::short(259, &[COMPRESSION_DEFLATE]),
        IfdEntry::short(262, &[PHOTOMETRIC_MIN_IS_BLACK]),
        IfdEntry::short(277, &[1]),
        IfdEntry::short(284, &[PLANAR_CONTIG]),
        IfdEntry::long(322, &[TILE_SIZE as u32]),
        IfdEntry::long(323, &[TILE_SIZE as u32]),
        IfdEntry::long(324, &offsets),
        IfdEntry::long(325, &byte_counts),
        IfdEntry::short(339, &[T::SAMPLE_FORMAT]),
        IfdEntry::double(TAG_MODEL_PIXEL_SCALE, &[t.pixel_width, -t.pixel_height, 0.0]),
        IfdEntry::double(TAG_MODEL_TIEPOINT, &[0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0]),
        IfdEntry::short(TAG_GEO_KEY_DIRECTORY, &geo_keys(raster.crs)),
    ];
    if let Some(nodata) = T::NODATA {
        entries.push(IfdEntry::ascii(TAG_GDAL_NODATA, nodata));
    }
    entries.sort_by_key(|e| e.tag);

    let ifd_offset = tiff.len();
    tiff[4..8].copy_from_slice(&to_u32(ifd_offset)?.to_le_bytes());
    write_ifd(&mut tiff, &entries)?;

    debug!(
        width = raster.width,
        height = raster.height,
        tiles = tiles.len(),
        bytes = tiff.len(),
        "Encoded GeoTIFF"
    );

    Ok(tiff)
}

/// Compress one internal tile, padding past the raster edge with `T::FILL`.
fn deflate_tile<T: Sample>(raster: &TileRaster<T>, tile_x: usize, tile_y: usize) -> std::io::Result<Vec<u8>> {
    let mut uncompressed = Vec::with_capacity(TILE_SIZE * TILE_SIZE * 4);
    for dy in 0..TILE_SIZE {
        let row = tile_y * TILE_SIZE + dy;
        for dx in 0..TILE_SIZE {
            let col = tile_x * TILE_SIZE + dx;
            raster.get(col, row).unwrap_or(T::FILL).extend_le(&mut uncompressed);
        }
    }

    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&uncompressed)?;
    encoder.finish()
}

fn geo_keys(crs: CrsCode) -> Vec<u16> {
    // Header: version 1, revision 1.0, key count
    let mut keys = vec![1, 1, 0, 3];
    keys.extend_from_slice(&[KEY_RASTER_TYPE, 0, 1, 1]);
    match crs {
        CrsCode::Epsg4326 => {
            keys.extend_from_slice(&[KEY_MODEL_TYPE, 0, 1, 2]);
            keys.extend_from_slice(&[KEY_GEOGRAPHIC_TYPE, 0, 1, 4326]);
        }
        CrsCode::Epsg3857 => {
            keys.extend_from_slice(&[KEY_MODEL_TYPE, 0, 1, 1]);
            keys.extend_from_slice(&[KEY_PROJECTED_CS_TYPE, 0, 1, 3857]);
        }
    }
    // Keys must be sorted by id
    let mut entries: Vec<[u16; 4]> = keys[4..]
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect();
    entries.sort_by_key(|e| e[0]);
    keys.truncate(4);
    keys.extend(entries.into_iter().flatten());
    keys
}

struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    bytes: Vec<u8>,
}

impl IfdEntry {
    fn short(tag: u16, values: &[u16]) -> Self {
        Self {
            tag,
            field_type: TYPE_SHORT,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn long(tag: u16, values: &[u32]) -> Self {
        Self {
            tag,
            field_type: TYPE_LONG,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn double(tag: u16, values: &[f64]) -> Self {
        Self {
            tag,
            field_type: TYPE_DOUBLE,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn ascii(tag: u16, text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        Self {
            tag,
            field_type: TYPE_ASCII,
            count: bytes.len() as u32,
            bytes,
        }
    }
}

/// Append the IFD at the end of `tiff`, followed by values too large to
/// store inline.
fn write_ifd(tiff: &mut Vec<u8>, entries: &[IfdEntry]) -> Result<()> {
    let ifd_start = tiff.len();
    let ifd_len = 2 + entries.len() * 12 + 4;
    let mut overflow_offset = ifd_start + ifd_len;
    let mut overflow = Vec::new();

    tiff.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in entries {
        tiff.extend_from_slice(&entry.tag.to_le_bytes());
        tiff.extend_from_slice(&entry.field_type.to_le_bytes());
        tiff.extend_from_slice(&entry.count.to_le_bytes());

        if entry.bytes.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..entry.bytes.len()].copy_from_slice(&entry.bytes);
            tiff.extend_from_slice(&inline);
        } else {
            tiff.extend_from_slice(&to_u32(overflow_offset)?.to_le_bytes());
            overflow.extend_from_slice(&entry.bytes);
            if overflow.len() % 2 == 1 {
                overflow.push(0);
            }
            overflow_offset = ifd_start + ifd_len + overflow.len();
        }
    }
    // No further IFDs
    tiff.extend_from_slice(&0u32.to_le_bytes());
    tiff.extend_from_slice(&overflow);
    Ok(())
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| MosaicError::encode("GeoTIFF exceeds 4 GiB"))
}

/// Read a single-band tile as raw digital numbers.
///
/// Samples are widened to `f64` without clamping so negative or NaN values
/// survive to radiometric conversion, which turns them into nodata.
pub fn decode_raw(bytes: &[u8]) -> Result<TileRaster<f64>> {
    let (width, height, transform, crs, image) = read_image(bytes)?;
    let data: Vec<f64> = match image {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        _ => return Err(MosaicError::decode("unsupported sample type")),
    };
    TileRaster::new(width, height, data, transform, crs)
}

/// Read a single-band raster as floats.
pub fn decode_f32(bytes: &[u8]) -> Result<TileRaster<f32>> {
    let (width, height, transform, crs, image) = read_image(bytes)?;
    let data: Vec<f32> = match image {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => return Err(MosaicError::decode("unsupported sample type")),
    };
    TileRaster::new(width, height, data, transform, crs)
}

/// Read a raw tile from disk.
pub fn read_raw_tile(path: &Path) -> Result<TileRaster<f64>> {
    let bytes = std::fs::read(path)?;
    decode_raw(&bytes).map_err(|e| match e {
        MosaicError::Decode(msg) => MosaicError::decode(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

type DecodedImage = (usize, usize, GeoTransform, CrsCode, DecodingResult);

fn read_image(bytes: &[u8]) -> Result<DecodedImage> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?.with_limits(Limits::unlimited());
    let (width, height) = decoder.dimensions()?;

    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .map_err(|_| MosaicError::decode("missing ModelPixelScale tag"))?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .map_err(|_| MosaicError::decode("missing ModelTiepoint tag"))?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(MosaicError::decode("malformed georeferencing tags"));
    }
    // Tiepoint maps raster (i, j) to model (x, y)
    let transform = GeoTransform::new(
        tiepoint[3] - tiepoint[0] * scale[0],
        tiepoint[4] + tiepoint[1] * scale[1],
        scale[0],
        -scale[1],
    );

    let crs = match decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag) {
        Ok(keys) => crs_from_geo_keys(&keys),
        Err(_) => CrsCode::Epsg4326,
    };

    let image = decoder.read_image()?;
    Ok((width as usize, height as usize, transform, crs, image))
}

fn crs_from_geo_keys(keys: &[u16]) -> CrsCode {
    let projected_3857 = keys
        .get(4..)
        .unwrap_or(&[])
        .chunks_exact(4)
        .any(|k| k[0] == KEY_PROJECTED_CS_TYPE && k[3] == 3857);
    if projected_3857 {
        CrsCode::Epsg3857
    } else {
        CrsCode::Epsg4326
    }
}

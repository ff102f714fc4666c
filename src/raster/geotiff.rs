//! GeoTIFF band access over memory-mapped files.

use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;

use log::debug;
use memmap2::Mmap;
use ndarray::Array2;
use tiff::decoder::{ChunkType, Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use super::{try_zeros_2d, Bounds, Crs, GeoTransform, Raster, RasterInfo, Window};
use crate::error::{PipelineError, Result};

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;

const RASTER_PIXEL_IS_POINT: u16 = 2;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const USER_DEFINED: u16 = 32767;

fn open_decoder(mmap: &Mmap) -> Result<Decoder<Cursor<&[u8]>>> {
    let decoder = Decoder::new(Cursor::new(&mmap[..]))?.with_limits(Limits::unlimited());
    Ok(decoder)
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // The mapping lives only as long as one read call and the file is not
    // modified by this process meanwhile.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

/// Read georeferencing (size, transform, CRS, nodata) without decoding pixels.
pub fn read_info(path: &Path) -> Result<RasterInfo> {
    let mmap = map_file(path)?;
    let mut decoder = open_decoder(&mmap)?;
    read_info_from(&mut decoder, path)
}

fn read_info_from<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
) -> Result<RasterInfo> {
    let (width, height) = decoder.dimensions()?;
    let georef_err = |reason: &str| PipelineError::Georeference {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let keys = match decoder.find_tag(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY))? {
        Some(v) => v.into_u16_vec()?,
        None => return Err(georef_err("no GeoKeyDirectory tag")),
    };
    let geo_keys = GeoKeys::parse(&keys);
    let crs = geo_keys
        .crs()
        .ok_or_else(|| georef_err("no EPSG code in GeoKeyDirectory"))?;

    let mut transform =
        match decoder.find_tag(Tag::from_u16_exhaustive(TAG_MODEL_TRANSFORMATION))? {
            Some(v) => {
                let m = v.into_f64_vec()?;
                if m.len() < 8 {
                    return Err(georef_err("short ModelTransformation tag"));
                }
                GeoTransform {
                    a: m[0],
                    b: m[1],
                    c: m[3],
                    d: m[4],
                    e: m[5],
                    f: m[7],
                }
            }
            None => {
                let scale = decoder
                    .find_tag(Tag::from_u16_exhaustive(TAG_MODEL_PIXEL_SCALE))?
                    .ok_or_else(|| georef_err("no ModelPixelScale tag"))?
                    .into_f64_vec()?;
                let tie = decoder
                    .find_tag(Tag::from_u16_exhaustive(TAG_MODEL_TIEPOINT))?
                    .ok_or_else(|| georef_err("no ModelTiepoint tag"))?
                    .into_f64_vec()?;
                if scale.len() < 2 || tie.len() < 6 {
                    return Err(georef_err("short ModelPixelScale/ModelTiepoint tag"));
                }
                let (sx, sy) = (scale[0], scale[1]);
                GeoTransform {
                    a: sx,
                    b: 0.0,
                    c: tie[3] - tie[0] * sx,
                    d: 0.0,
                    e: -sy,
                    f: tie[4] + tie[1] * sy,
                }
            }
        };

    if geo_keys.raster_type == Some(RASTER_PIXEL_IS_POINT) {
        transform.c -= 0.5 * transform.a + 0.5 * transform.b;
        transform.f -= 0.5 * transform.d + 0.5 * transform.e;
    }

    let nodata = match decoder.find_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA))? {
        Some(v) => v
            .into_string()
            .ok()
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok()),
        None => None,
    };

    Ok(RasterInfo {
        width: width as usize,
        height: height as usize,
        transform,
        crs,
        nodata,
    })
}

#[derive(Debug, Default)]
struct GeoKeys {
    model_type: Option<u16>,
    raster_type: Option<u16>,
    geographic: Option<u16>,
    projected: Option<u16>,
}

impl GeoKeys {
    /// Header `[version, revision, minor, count]` followed by
    /// `[key, location, count, value]` entries. Only inline (location 0)
    /// values are needed for EPSG codes.
    fn parse(dir: &[u16]) -> Self {
        let mut keys = GeoKeys::default();
        if dir.len() < 4 {
            return keys;
        }
        let count = dir[3] as usize;
        for entry in dir[4..].chunks_exact(4).take(count) {
            if entry[1] != 0 {
                continue;
            }
            let value = Some(entry[3]);
            match entry[0] {
                KEY_MODEL_TYPE => keys.model_type = value,
                KEY_RASTER_TYPE => keys.raster_type = value,
                KEY_GEOGRAPHIC_TYPE => keys.geographic = value,
                KEY_PROJECTED_CS_TYPE => keys.projected = value,
                _ => {}
            }
        }
        keys
    }

    fn crs(&self) -> Option<Crs> {
        match (self.projected, self.geographic, self.model_type) {
            (Some(code), _, _) if code != USER_DEFINED => Some(Crs(code as u32)),
            (_, Some(code), _) if code != USER_DEFINED => Some(Crs(code as u32)),
            (None, None, Some(MODEL_TYPE_GEOGRAPHIC)) => Some(Crs::wgs84()),
            _ => None,
        }
    }
}

trait Sample: Copy {
    fn to_f32(self) -> f32;
}

macro_rules! impl_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            #[inline]
            fn to_f32(self) -> f32 {
                self as f32
            }
        })*
    };
}

impl_sample!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// First sample of every pixel as f32, nodata and non-finite values as 0.
fn band_one<T: Sample>(
    buf: &[T],
    height: usize,
    width: usize,
    nodata: Option<f64>,
    path: &Path,
) -> Result<Array2<f32>> {
    let pixels = height * width;
    if pixels == 0 || buf.len() % pixels != 0 {
        return Err(PipelineError::Georeference {
            path: path.to_path_buf(),
            reason: format!(
                "decoded {} samples for a {}x{} raster",
                buf.len(),
                height,
                width
            ),
        });
    }
    let samples = buf.len() / pixels;
    let nodata = nodata.map(|v| v as f32);
    let data: Vec<f32> = buf
        .iter()
        .step_by(samples)
        .map(|&s| {
            let v = s.to_f32();
            if !v.is_finite() || Some(v) == nodata {
                0.0
            } else {
                v
            }
        })
        .collect();
    Ok(Array2::from_shape_vec((height, width), data)?)
}

/// Decode band 1 of a GeoTIFF to f32 together with its georeferencing.
pub fn read_band(path: &Path) -> Result<Raster> {
    let mmap = map_file(path)?;
    let mut decoder = open_decoder(&mmap)?;
    let info = read_info_from(&mut decoder, path)?;
    let (h, w) = (info.height, info.width);
    let nodata = info.nodata;
    let data = match decoder.read_image()? {
        DecodingResult::U8(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::U16(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::U32(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::U64(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::I8(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::I16(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::I32(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::I64(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::F32(buf) => band_one(&buf, h, w, nodata, path)?,
        DecodingResult::F64(buf) => band_one(&buf, h, w, nodata, path)?,
        #[allow(unreachable_patterns)]
        _ => {
            return Err(PipelineError::Georeference {
                path: path.to_path_buf(),
                reason: "unsupported sample format".to_string(),
            })
        }
    };
    debug!(
        "read band {:?}: {}x{} px, {}",
        path.file_name().unwrap_or_default(),
        h,
        w,
        info.crs
    );
    Ok(Raster {
        data,
        transform: info.transform,
        crs: info.crs,
    })
}

/// Decode only the part of band 1 covering `bounds` (in the file's CRS),
/// grown by `pad` pixels. Only the strips or tiles crossing the window are
/// decompressed. `None` when the file does not overlap `bounds`.
pub fn read_window(path: &Path, bounds: &Bounds, pad: usize) -> Result<Option<Raster>> {
    let mmap = map_file(path)?;
    let mut decoder = open_decoder(&mmap)?;
    let info = read_info_from(&mut decoder, path)?;
    let Some(window) = Window::covering(&info.transform, info.height, info.width, bounds, pad)
    else {
        return Ok(None);
    };
    let mut data = try_zeros_2d::<f32>(window.shape(), "raster window")?;

    let (chunk_w, chunk_h) = decoder.chunk_dimensions();
    let (chunk_w, chunk_h) = (chunk_w as usize, chunk_h as usize);
    if chunk_w == 0 || chunk_h == 0 {
        return Err(PipelineError::Georeference {
            path: path.to_path_buf(),
            reason: "zero-sized strips or tiles".to_string(),
        });
    }
    let across = match decoder.get_chunk_type() {
        ChunkType::Strip => 1,
        ChunkType::Tile => info.width.div_ceil(chunk_w),
    };
    let mut decoded = 0;
    for chunk_row in window.rows.start / chunk_h..=(window.rows.end - 1) / chunk_h {
        for chunk_col in window.cols.start / chunk_w..=(window.cols.end - 1) / chunk_w {
            let index = chunk_row * across + chunk_col;
            let origin = (chunk_row * chunk_h, chunk_col * chunk_w);
            let extent = (
                chunk_h.min(info.height - origin.0),
                chunk_w.min(info.width - origin.1),
            );
            let chunk = Chunk { origin, extent };
            match decoder.read_chunk(index as u32)? {
                DecodingResult::U8(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::U16(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::U32(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::U64(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::I8(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::I16(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::I32(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::I64(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::F32(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                DecodingResult::F64(buf) => chunk.blit(&buf, &window, &mut data, info.nodata),
                #[allow(unreachable_patterns)]
                _ => {
                    return Err(PipelineError::Georeference {
                        path: path.to_path_buf(),
                        reason: "unsupported sample format".to_string(),
                    })
                }
            }
            decoded += 1;
        }
    }
    debug!(
        "read window rows {:?} cols {:?} of {:?} from {} chunks",
        window.rows,
        window.cols,
        path.file_name().unwrap_or_default(),
        decoded
    );
    Ok(Some(Raster {
        data,
        transform: window.transform(&info.transform),
        crs: info.crs,
    }))
}

/// Position and unpadded size of one decoded strip or tile, in pixels.
struct Chunk {
    origin: (usize, usize),
    extent: (usize, usize),
}

impl Chunk {
    /// Copy the first sample of the pixels shared with `window` into `out`.
    fn blit<T: Sample>(&self, buf: &[T], window: &Window, out: &mut Array2<f32>, nodata: Option<f64>) {
        let (h, w) = self.extent;
        if h * w == 0 {
            return;
        }
        let samples = (buf.len() / (h * w)).max(1);
        let nodata = nodata.map(|v| v as f32);
        let rows = window.rows.start.max(self.origin.0)..window.rows.end.min(self.origin.0 + h);
        let cols = window.cols.start.max(self.origin.1)..window.cols.end.min(self.origin.1 + w);
        for row in rows {
            for col in cols.clone() {
                let at = ((row - self.origin.0) * w + (col - self.origin.1)) * samples;
                let Some(&s) = buf.get(at) else {
                    continue;
                };
                let v = s.to_f32();
                out[[row - window.rows.start, col - window.cols.start]] =
                    if !v.is_finite() || Some(v) == nodata { 0.0 } else { v };
            }
        }
    }
}

/// Write a single-band f32 GeoTIFF carrying pixel scale, tiepoint and EPSG
/// geokeys. Only north-up transforms can be expressed this way.
pub fn write_band(
    path: &Path,
    data: &Array2<f32>,
    transform: &GeoTransform,
    crs: Crs,
    nodata: Option<f64>,
) -> Result<()> {
    if transform.b != 0.0 || transform.d != 0.0 {
        return Err(PipelineError::Georeference {
            path: path.to_path_buf(),
            reason: "rotated transforms cannot be written".to_string(),
        });
    }
    let (h, w) = data.dim();
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(w as u32, h as u32)?;

    let scale = [transform.a, -transform.e, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, transform.c, transform.f, 0.0];
    let (cs_key, model_type) = if crs.is_geographic() {
        (KEY_GEOGRAPHIC_TYPE, MODEL_TYPE_GEOGRAPHIC)
    } else {
        (KEY_PROJECTED_CS_TYPE, 1)
    };
    let geo_keys: [u16; 16] = [
        1, 1, 0, 3,
        KEY_MODEL_TYPE, 0, 1, model_type,
        KEY_RASTER_TYPE, 0, 1, 1,
        cs_key, 0, 1, crs.epsg() as u16,
    ];
    {
        let dir = image.encoder();
        dir.write_tag(Tag::from_u16_exhaustive(TAG_MODEL_PIXEL_SCALE), &scale[..])?;
        dir.write_tag(Tag::from_u16_exhaustive(TAG_MODEL_TIEPOINT), &tiepoint[..])?;
        dir.write_tag(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY), &geo_keys[..])?;
        if let Some(v) = nodata {
            dir.write_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA), v.to_string().as_str())?;
        }
    }
    let contiguous = data.as_standard_layout();
    let samples = contiguous.as_slice().ok_or_else(|| PipelineError::Georeference {
        path: path.to_path_buf(),
        reason: "band is not contiguous".to_string(),
    })?;
    image.write_data(samples)?;
    Ok(())
}

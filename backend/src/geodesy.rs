use serde::{Deserialize, Serialize};

/// Latitudinal step of the tile grid, in degrees. Constant at every
/// latitude; only the longitudinal width varies by band.
pub const LAT_STEP: f64 = 0.125;

/// Band floors (absolute latitude) and the longitudinal tile width of the
/// band that starts at each floor. `tile_width` returns the width of the
/// first band containing `|lat|`.
const BAND_FLOORS: [f64; 7] = [89.0, 86.0, 83.0, 76.0, 62.0, 22.0, -22.0];
const BAND_WIDTHS: [f64; 7] = [12.0, 4.0, 2.0, 1.0, 0.5, 0.25, 0.125];

/// Pixel width of a tile per resolution class 0..6.
pub const SIZE_WIDTHS: [u32; 7] = [512, 1024, 2048, 4096, 8192, 16384, 32768];

/// Chunks per side of a tile per resolution class 0..6.
pub const SIZE_COLS: [u32; 7] = [1, 1, 1, 2, 4, 8, 8];

pub const MAX_SIZE_ID: u8 = 6;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_B: f64 = 6_356_752.314_245;

pub const METERS_PER_NM: f64 = 1_852.0;

pub fn width_px_for_size(size_id: u8) -> u32 {
    SIZE_WIDTHS[size_id.min(MAX_SIZE_ID) as usize]
}

pub fn cols_for_size(size_id: u8) -> u32 {
    SIZE_COLS[size_id.min(MAX_SIZE_ID) as usize]
}

/// Inverse of `width_px_for_size`, for classifying files found on disk.
pub fn size_id_for_width(width: u32) -> Option<u8> {
    SIZE_WIDTHS.iter().position(|w| *w == width).map(|i| i as u8)
}

/// Longitudinal tile width (degrees) at a latitude.
pub fn tile_width(lat: f64) -> f64 {
    let a = lat.abs();
    for (floor, width) in BAND_FLOORS.iter().zip(BAND_WIDTHS.iter()) {
        if a >= *floor {
            return *width;
        }
    }
    // |lat| < 22
    0.125
}

/// Pack a position into a tile ID.
///
/// Layout: `(lon_shifted << 14) | (lat_shifted << 6) | (y << 3) | x` with
/// `lon_shifted = floor(lon)+180`, `lat_shifted = floor(lat)+90`,
/// `y = floor(frac(lat)/0.125)` and `x = floor(frac(lon)/tile_width(lat))`.
pub fn index(lat: f64, lon: f64) -> u64 {
    let lon_floor = lon.floor();
    let lat_floor = lat.floor();
    let x = ((lon - lon_floor) / tile_width(lat)).floor() as u64;
    let y = ((lat - lat_floor) / LAT_STEP).floor() as u64;
    let lon_shifted = (lon_floor as i64 + 180) as u64;
    let lat_shifted = (lat_floor as i64 + 90) as u64;
    (lon_shifted << 14) | (lat_shifted << 6) | (y << 3) | x
}

/// Everything derivable from a packed tile ID.
#[derive(Debug, Clone, PartialEq)]
pub struct TileCoords {
    pub lon_c: f64,
    pub lat_c: f64,
    pub lon_base: i32,
    pub lat_base: i32,
    pub x: u32,
    pub y: u32,
    /// Scenery directory label at 10-degree granularity, e.g. `e010n40`.
    pub dir10: String,
    /// Scenery directory label at 1-degree granularity, e.g. `e011n47`.
    pub dir1: String,
}

/// Unpack a tile ID.
pub fn coord_from_index(id: u64) -> TileCoords {
    let x = (id & 0x7) as u32;
    let y = ((id >> 3) & 0x7) as u32;
    let lat_base = ((id >> 6) & 0xFF) as i32 - 90;
    let lon_base = (id >> 14) as i32 - 180;

    let lat_ll = lat_base as f64 + y as f64 * LAT_STEP;
    let width = tile_width(lat_ll);
    let lon_c = lon_base as f64 + (x as f64 + 0.5) * width;
    let lat_c = lat_ll + 0.5 * LAT_STEP;

    TileCoords {
        lon_c,
        lat_c,
        lon_base,
        lat_base,
        x,
        y,
        dir10: dir_label(lon_c, lat_c, 10.0),
        dir1: dir_label(lon_c, lat_c, 1.0),
    }
}

/// `{e|w}DDD{n|s}DD` directory label, floored to `step` degrees.
fn dir_label(lon: f64, lat: f64, step: f64) -> String {
    let lon_b = (lon / step).floor() * step;
    let lat_b = (lat / step).floor() * step;
    let ew = if lon_b < 0.0 { 'w' } else { 'e' };
    let ns = if lat_b < 0.0 { 's' } else { 'n' };
    format!(
        "{ew}{:03}{ns}{:02}",
        lon_b.abs() as i32,
        lat_b.abs() as i32
    )
}

/// Geographic bounding box of a tile or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    #[serde(rename = "latLL")]
    pub lat_ll: f64,
    #[serde(rename = "lonLL")]
    pub lon_ll: f64,
    #[serde(rename = "latUR")]
    pub lat_ur: f64,
    #[serde(rename = "lonUR")]
    pub lon_ur: f64,
}

/// Immutable description of one scenery tile at a chosen resolution class.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMetadata {
    pub id: u64,
    pub size_id: u8,
    pub lon_ll: f64,
    pub lat_ll: f64,
    pub lon_ur: f64,
    pub lat_ur: f64,
    pub x: u32,
    pub y: u32,
    pub lon_c: f64,
    pub lat_c: f64,
    pub lon_step: f64,
    pub width_px: u32,
    pub cols: u32,
}

impl TileMetadata {
    /// Build metadata for the tile containing `(lat, lon)`.
    pub fn new(lat: f64, lon: f64, size_id: u8) -> Self {
        let id = index(lat, lon);
        Self::from_id(id, size_id)
    }

    /// Build metadata from a packed tile ID.
    pub fn from_id(id: u64, size_id: u8) -> Self {
        let c = coord_from_index(id);
        let lat_ll = c.lat_base as f64 + c.y as f64 * LAT_STEP;
        let width = tile_width(lat_ll);
        let lon_ll = c.lon_base as f64 + c.x as f64 * width;
        TileMetadata {
            id,
            size_id,
            lon_ll,
            lat_ll,
            lon_ur: lon_ll + width,
            lat_ur: lat_ll + LAT_STEP,
            x: c.x,
            y: c.y,
            lon_c: c.lon_c,
            lat_c: c.lat_c,
            lon_step: width,
            width_px: width_px_for_size(size_id),
            cols: cols_for_size(size_id),
        }
    }

    pub fn bbox(&self) -> Bbox {
        Bbox {
            lat_ll: self.lat_ll,
            lon_ll: self.lon_ll,
            lat_ur: self.lat_ur,
            lon_ur: self.lon_ur,
        }
    }

    pub fn dir10(&self) -> String {
        dir_label(self.lon_c, self.lat_c, 10.0)
    }

    pub fn dir1(&self) -> String {
        dir_label(self.lon_c, self.lat_c, 1.0)
    }
}

/// Earth radius (meters) at a latitude, from the WGS84 ellipsoid.
fn local_earth_radius(lat_deg: f64) -> f64 {
    let lat = lat_deg.to_radians();
    let (sin, cos) = lat.sin_cos();
    let an = WGS84_A * WGS84_A * cos;
    let bn = WGS84_B * WGS84_B * sin;
    let ad = WGS84_A * cos;
    let bd = WGS84_B * sin;
    ((an * an + bn * bn) / (ad * ad + bd * bd)).sqrt()
}

/// Great-circle distance in meters via the spherical law of cosines, using
/// the local Earth radius at the midpoint latitude.
pub fn surface_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let p1 = lat1.to_radians();
    let p2 = lat2.to_radians();
    let dl = (lon2 - lon1).to_radians();
    let cos_angle = (p1.sin() * p2.sin() + p1.cos() * p2.cos() * dl.cos()).clamp(-1.0, 1.0);
    local_earth_radius((lat1 + lat2) / 2.0) * cos_angle.acos()
}

pub fn surface_distance_nm(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    surface_distance(lon1, lat1, lon2, lat2) / METERS_PER_NM
}

/// Elliptical ordering metric for direction-aware acquisition, expressed in
/// nautical miles so it is comparable with radial distances. The ellipse has
/// semi-axis `1.5 * radius_nm` along `heading_deg` and `radius_nm` across it;
/// points on the ellipse boundary map to `radius_nm`.
pub fn ellipse_distance_nm(
    center_lat: f64,
    center_lon: f64,
    heading_deg: f64,
    radius_nm: f64,
    lat: f64,
    lon: f64,
) -> f64 {
    let dn = (lat - center_lat) * 60.0;
    let de = (lon - center_lon) * 60.0 * center_lat.to_radians().cos();
    let h = heading_deg.to_radians();
    let along = de * h.sin() + dn * h.cos();
    let across = de * h.cos() - dn * h.sin();
    let a = 1.5 * radius_nm;
    let b = radius_nm;
    ((along / a).powi(2) + (across / b).powi(2)).sqrt() * radius_nm
}

/// Pick a resolution class for a tile at `dist_nm` from the center.
///
/// Within half the job radius the full `base` class is kept. Beyond it the
/// class drops one step per 10 NM, with an extra step per 20,000 ft of
/// altitude above 10,000 ft. The result is clamped to `[min_size, base]`.
pub fn adaptive_size_id(base: u8, alt_ft: f64, dist_nm: f64, radius_nm: f64, min_size: u8) -> u8 {
    let min_size = min_size.min(base);
    let free = radius_nm / 2.0;
    if dist_nm <= free {
        return base;
    }
    let mut reduction = ((dist_nm - free) / 10.0).floor() as i32;
    if alt_ft > 10_000.0 {
        reduction += ((alt_ft - 10_000.0) / 20_000.0).floor() as i32;
    }
    let sized = (base as i32 - reduction).max(min_size as i32);
    sized.clamp(0, base as i32) as u8
}

//! Slippy-map tile math.
//!
//! Containers store `tile_row` bottom-up (TMS); geographic math uses top-down
//! rows (XYZ). The two are reflections of each other within a zoom level, so
//! the same function converts in both directions.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use geo::{Rect, coord};

use crate::error::ContainerError;
use crate::mbtiles::TileCoord;

/// Latitude limit of the Web Mercator square.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Converts a row between TMS and XYZ numbering at `zoom`. `None` when the
/// row lies outside the grid of that zoom level.
pub fn flip_row(zoom: u8, row: u32) -> Option<u32> {
    let last = 1u64.checked_shl(u32::from(zoom))?.checked_sub(1)?;
    u32::try_from(last.checked_sub(u64::from(row))?).ok()
}

impl TileCoord {
    /// Same tile with the row converted between TMS and XYZ numbering, or
    /// `None` when the row or column lies outside the grid.
    pub fn flipped(self) -> Option<Self> {
        // A column is in range exactly when it can be flipped too.
        flip_row(self.zoom, self.x)?;
        Some(TileCoord {
            zoom: self.zoom,
            x: self.x,
            y: flip_row(self.zoom, self.y)?,
        })
    }
}

/// Tile containing a lon/lat position, in XYZ numbering.
pub fn lon_lat_to_tile(lon: f64, lat: f64, zoom: u8) -> TileCoord {
    let n = 2f64.powi(i32::from(zoom));
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - lat.tan().asinh() / PI) / 2.0 * n).floor();
    let max = n - 1.0;
    TileCoord {
        zoom,
        x: x.clamp(0.0, max) as u32,
        y: y.clamp(0.0, max) as u32,
    }
}

/// North-west corner of an XYZ tile as (lon, lat).
pub fn tile_origin(zoom: u8, x: u32, y: u32) -> (f64, f64) {
    corner(zoom, f64::from(x), f64::from(y))
}

fn corner(zoom: u8, x: f64, y: f64) -> (f64, f64) {
    let n = 2f64.powi(i32::from(zoom));
    let lon = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    (lon, lat)
}

/// Geographic rectangle covered by an XYZ tile.
pub fn tile_bounds(coord: TileCoord) -> Rect<f64> {
    let (x, y) = (f64::from(coord.x), f64::from(coord.y));
    let (west, north) = corner(coord.zoom, x, y);
    let (east, south) = corner(coord.zoom, x + 1.0, y + 1.0);
    Rect::new(coord! { x: west, y: south }, coord! { x: east, y: north })
}

/// The `bounds` metadata value: `lon_min,lat_min,lon_max,lat_max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub fn to_rect(self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.west, y: self.south },
            coord! { x: self.east, y: self.north },
        )
    }
}

impl FromStr for Bounds {
    type Err = ContainerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ContainerError::InvalidBounds {
            value: value.to_string(),
        };
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        let [west, south, east, north] = parts[..] else {
            return Err(invalid());
        };
        if west > east || south > north {
            return Err(invalid());
        }
        Ok(Bounds {
            west,
            south,
            east,
            north,
        })
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

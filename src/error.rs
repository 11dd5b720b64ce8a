use std::path::PathBuf;

use thiserror::Error;

/// Errors scoped to a single tile. The optimize pass reports these per tile
/// and keeps going; everything else aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TileError {
    #[error("corrupt tile: {reason}")]
    Corrupt { reason: String },

    #[error("layer `{layer}` is not covered by the layer policy")]
    UnknownLayer { layer: String },
}

impl TileError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        TileError::Corrupt {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("not an mbtiles container (no tiles table): {}", .path.display())]
    NotAContainer { path: PathBuf },

    #[error("boundary file has no feature with {property} = {country:?}")]
    EmptyBoundary { property: String, country: String },

    #[error("invalid bounds `{value}`: expected lon_min,lat_min,lon_max,lat_max")]
    InvalidBounds { value: String },
}

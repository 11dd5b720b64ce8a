use std::collections::BTreeMap;

/// Tile address as stored in the container (`tile_row` is TMS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoord {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub coord: TileCoord,
    pub data: Vec<u8>,
}

/// Min/max column and row of the populated tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileExtent {
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeOptions {
    pub threads: usize,
    pub io_batch: u32,
    pub fail_fast: bool,
    pub drop_empty_tiles: bool,
    pub no_progress: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            io_batch: 1_000,
            fail_fast: false,
            drop_empty_tiles: false,
            no_progress: true,
        }
    }
}

/// Key of a blob in the `images` table of a deduplicated container.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageId(pub(crate) rusqlite::types::Value);

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            rusqlite::types::Value::Integer(id) => write!(f, "{id}"),
            rusqlite::types::Value::Text(id) => write!(f, "{id}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// One stored blob together with the coordinates that share it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub tile_id: ImageId,
    /// Number of `map` rows pointing at this blob, per zoom level.
    pub zooms: BTreeMap<u8, u64>,
    pub data: Vec<u8>,
}

impl ImageRecord {
    pub fn references(&self) -> u64 {
        self.zooms.values().sum()
    }
}

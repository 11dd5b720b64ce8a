mod container;
mod processing;
mod stats;
mod types;

pub use container::{Mbtiles, TileSchema, copy_container};
pub use processing::{
    OptimizedTile, TileAction, build_thread_pool, make_progress_bar, optimize_container,
    optimize_tile,
};
pub use stats::{OptimizeStats, PruneStats, PyramidLevelStats, PyramidStats, ShrinkStats};
pub use types::{ImageId, ImageRecord, OptimizeOptions, TileCoord, TileExtent, TileRecord};

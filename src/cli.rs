use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "flightmap-tiles",
    version,
    about = "Optimize, downsample, prune and verify MBTiles for flight-navigation maps"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Log level (error|warn|info|debug|trace)
    #[arg(long, default_value = "info", global = true)]
    pub log: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Filter vector tile layers, features and tags in place.
    Optimize(OptimizeArgs),
    /// Build coarser raster zoom levels from the finest one.
    Pyramid(PyramidArgs),
    /// Delete tiles outside a buffered country boundary.
    Prune(PruneArgs),
    /// Delete all zoom levels above a maximum.
    Shrink(ShrinkArgs),
    /// Decode every tile and report the broken ones.
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
pub struct OptimizeArgs {
    pub input: PathBuf,

    /// JSON layer policy; the built-in base map policy when omitted.
    #[arg(long)]
    pub policy: Option<PathBuf>,

    #[arg(long)]
    pub threads: Option<usize>,

    #[arg(long, default_value_t = 1_000)]
    pub io_batch: u32,

    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,

    #[arg(long, default_value_t = false)]
    pub drop_empty_tiles: bool,

    #[arg(long, default_value_t = false)]
    pub no_progress: bool,

    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub output: ReportFormat,
}

#[derive(Debug, Args)]
pub struct PyramidArgs {
    pub input: PathBuf,

    #[arg(long)]
    pub start_zoom: Option<u8>,

    #[arg(long, default_value_t = 7)]
    pub target_zoom: u8,

    /// Pixel size children are scaled to before compositing.
    #[arg(long, default_value_t = 256)]
    pub tile_size: u32,

    #[arg(long)]
    pub threads: Option<usize>,

    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

#[derive(Debug, Args)]
pub struct PruneArgs {
    pub input: PathBuf,

    /// GeoJSON FeatureCollection with country polygons.
    #[arg(long)]
    pub boundary: PathBuf,

    #[arg(long)]
    pub country: String,

    #[arg(long, default_value = "SOVEREIGNT")]
    pub country_property: String,

    /// lon_min,lat_min,lon_max,lat_max
    #[arg(long)]
    pub bbox: Option<String>,

    #[arg(long, default_value_t = 20_000.0)]
    pub buffer_meters: f64,

    /// Write the pruned container here instead of modifying the input.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ShrinkArgs {
    pub input: PathBuf,

    #[arg(long)]
    pub max_zoom: u8,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    pub input: PathBuf,

    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,

    #[arg(long, default_value_t = false)]
    pub no_progress: bool,

    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub output: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

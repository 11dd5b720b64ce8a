pub mod cli;
pub mod coord;
pub mod error;
pub mod filter;
pub mod mbtiles;
pub mod output;
pub mod policy;
pub mod prune;
pub mod pyramid;
pub mod verify;
pub mod vector_tile;
pub mod zoom;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::ContainerError;
use crate::mbtiles::types::{ImageId, ImageRecord, TileCoord, TileExtent, TileRecord};

/// How tiles are laid out inside the SQLite file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileSchema {
    /// A plain `tiles` table.
    Flat,
    /// `map` rows pointing at shared `images` blobs (`tiles` is then a view).
    Deduplicated,
}

/// Handle on an MBTiles file. Mutations are visible to later reads on the
/// same handle; the connection is released when the handle is dropped.
pub struct Mbtiles {
    conn: Connection,
    path: PathBuf,
    schema: TileSchema,
}

impl std::fmt::Debug for Mbtiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbtiles")
            .field("path", &self.path)
            .field("schema", &self.schema)
            .finish()
    }
}

impl Mbtiles {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open mbtiles: {}", path.display()))?;
        let schema = detect_schema(&conn, path)?;
        conn.execute_batch("CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT);")
            .context("failed to ensure metadata table")?;
        apply_pragmas(&conn)?;
        debug!(path = %path.display(), ?schema, "opened mbtiles");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            schema,
        })
    }

    pub fn open_readonly(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open mbtiles: {}", path.display()))?;
        let schema = detect_schema(&conn, path)?;
        conn.execute_batch("PRAGMA query_only = ON;")
            .context("failed to apply read pragmas")?;
        apply_pragmas(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            schema,
        })
    }

    /// Creates a new, empty container with the flat schema.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to create mbtiles: {}", path.display()))?;
        conn.execute_batch(
            "
            CREATE TABLE metadata (name TEXT, value TEXT);
            CREATE TABLE tiles (
                zoom_level INTEGER,
                tile_column INTEGER,
                tile_row INTEGER,
                tile_data BLOB
            );
            CREATE UNIQUE INDEX tile_index ON tiles (zoom_level, tile_column, tile_row);
            ",
        )
        .context("failed to create output schema")?;
        apply_pragmas(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            schema: TileSchema::Flat,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> TileSchema {
        self.schema
    }

    pub fn tile_count(&self) -> Result<u64> {
        let sql = match self.schema {
            TileSchema::Flat => "SELECT COUNT(*) FROM tiles",
            TileSchema::Deduplicated => "SELECT COUNT(*) FROM map",
        };
        let count: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .context("failed to read tile count")?;
        u64::try_from(count).context("negative tile count")
    }

    pub fn tile_coords(&self) -> Result<Vec<TileCoord>> {
        let sql = match self.schema {
            TileSchema::Flat => {
                "SELECT zoom_level, tile_column, tile_row FROM tiles ORDER BY zoom_level, tile_column, tile_row"
            }
            TileSchema::Deduplicated => {
                "SELECT zoom_level, tile_column, tile_row FROM map ORDER BY zoom_level, tile_column, tile_row"
            }
        };
        let mut stmt = self.conn.prepare(sql).context("prepare tile coords")?;
        let mut rows = stmt.query([]).context("query tile coords")?;
        let mut coords = Vec::new();
        while let Some(row) = rows.next().context("read tile coord row")? {
            coords.push(TileCoord {
                zoom: row.get(0)?,
                x: row.get(1)?,
                y: row.get(2)?,
            });
        }
        Ok(coords)
    }

    /// Reads up to `limit` tiles ordered by (zoom, column, row), starting
    /// strictly after `after`. No cursor stays open once this returns, so
    /// the caller may write the batch back before asking for the next one.
    pub fn read_batch(&self, after: Option<TileCoord>, limit: u32) -> Result<Vec<TileRecord>> {
        let sql = match self.schema {
            TileSchema::Flat => {
                "SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles
                 WHERE (zoom_level, tile_column, tile_row) > (?1, ?2, ?3)
                 ORDER BY zoom_level, tile_column, tile_row LIMIT ?4"
            }
            TileSchema::Deduplicated => {
                "SELECT map.zoom_level, map.tile_column, map.tile_row, images.tile_data
                 FROM map JOIN images ON images.tile_id = map.tile_id
                 WHERE (map.zoom_level, map.tile_column, map.tile_row) > (?1, ?2, ?3)
                 ORDER BY map.zoom_level, map.tile_column, map.tile_row LIMIT ?4"
            }
        };
        let (z, x, y) = match after {
            Some(coord) => (coord.zoom as i64, coord.x as i64, coord.y as i64),
            None => (-1, -1, -1),
        };
        let mut stmt = self.conn.prepare_cached(sql).context("prepare tile batch")?;
        let mut rows = stmt
            .query(params![z, x, y, limit])
            .context("query tile batch")?;
        let mut records = Vec::with_capacity(limit as usize);
        while let Some(row) = rows.next().context("read tile row")? {
            records.push(TileRecord {
                coord: TileCoord {
                    zoom: row.get(0)?,
                    x: row.get(1)?,
                    y: row.get(2)?,
                },
                data: row.get(3)?,
            });
        }
        Ok(records)
    }

    /// Visits every tile once. Writes belong in a later pass.
    pub fn for_each_tile<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(TileRecord) -> Result<()>,
    {
        let sql = match self.schema {
            TileSchema::Flat => {
                "SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles
                 ORDER BY zoom_level, tile_column, tile_row"
            }
            TileSchema::Deduplicated => {
                "SELECT map.zoom_level, map.tile_column, map.tile_row, images.tile_data
                 FROM map JOIN images ON images.tile_id = map.tile_id
                 ORDER BY map.zoom_level, map.tile_column, map.tile_row"
            }
        };
        let mut stmt = self.conn.prepare(sql).context("prepare tiles scan")?;
        let mut rows = stmt.query([]).context("query tiles scan")?;
        while let Some(row) = rows.next().context("read tile row")? {
            f(TileRecord {
                coord: TileCoord {
                    zoom: row.get(0)?,
                    x: row.get(1)?,
                    y: row.get(2)?,
                },
                data: row.get(3)?,
            })?;
        }
        Ok(())
    }

    pub fn get_tile(&self, coord: TileCoord) -> Result<Option<Vec<u8>>> {
        let sql = match self.schema {
            TileSchema::Flat => {
                "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3"
            }
            TileSchema::Deduplicated => {
                "SELECT images.tile_data FROM map JOIN images ON images.tile_id = map.tile_id
                 WHERE map.zoom_level = ?1 AND map.tile_column = ?2 AND map.tile_row = ?3"
            }
        };
        self.conn
            .prepare_cached(sql)
            .context("prepare tile read")?
            .query_row(params![coord.zoom, coord.x, coord.y], |row| row.get(0))
            .optional()
            .with_context(|| format!("failed to read tile {coord}"))
    }

    /// Insert-or-replace of a single tile.
    pub fn put_tile(&self, coord: TileCoord, data: &[u8]) -> Result<()> {
        write_tile(&self.conn, self.schema, coord, data)
    }

    /// Insert-or-replace of many tiles inside one transaction.
    pub fn put_tiles(&mut self, records: &[TileRecord]) -> Result<()> {
        let tx = self.conn.transaction().context("begin tile transaction")?;
        for record in records {
            write_tile(&tx, self.schema, record.coord, &record.data)?;
        }
        tx.commit().context("commit tile transaction")?;
        Ok(())
    }

    pub fn delete_tile(&self, coord: TileCoord) -> Result<bool> {
        Ok(remove_tile(&self.conn, self.schema, coord)? > 0)
    }

    pub fn delete_tiles(&mut self, coords: &[TileCoord]) -> Result<u64> {
        let tx = self.conn.transaction().context("begin delete transaction")?;
        let mut removed = 0u64;
        for coord in coords {
            removed += remove_tile(&tx, self.schema, *coord)? as u64;
        }
        tx.commit().context("commit delete transaction")?;
        Ok(removed)
    }

    /// Number of distinct blobs referenced by `map`. Flat containers count
    /// every tile.
    pub fn image_count(&self) -> Result<u64> {
        if self.schema == TileSchema::Flat {
            return self.tile_count();
        }
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(DISTINCT tile_id) FROM map", [], |row| row.get(0))
            .context("failed to read image count")?;
        u64::try_from(count).context("negative image count")
    }

    /// Reads up to `limit` referenced blobs of a deduplicated container,
    /// ordered by `tile_id` and starting strictly after `after`.
    pub fn read_image_batch(&self, after: Option<&ImageId>, limit: u32) -> Result<Vec<ImageRecord>> {
        if self.schema != TileSchema::Deduplicated {
            anyhow::bail!("{} has no images table", self.path.display());
        }
        let after = after.map(|id| id.0.clone()).unwrap_or(Value::Null);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT images.tile_id, images.tile_data, GROUP_CONCAT(map.zoom_level)
                 FROM images JOIN map ON map.tile_id = images.tile_id
                 WHERE ?1 IS NULL OR images.tile_id > ?1
                 GROUP BY images.tile_id
                 ORDER BY images.tile_id LIMIT ?2",
            )
            .context("prepare image batch")?;
        let mut rows = stmt
            .query(params![after, limit])
            .context("query image batch")?;
        let mut records = Vec::with_capacity(limit as usize);
        while let Some(row) = rows.next().context("read image row")? {
            let tile_id = ImageId(row.get(0)?);
            let joined: String = row.get(2)?;
            let mut zooms: BTreeMap<u8, u64> = BTreeMap::new();
            for zoom in joined.split(',') {
                let zoom: u8 = zoom
                    .parse()
                    .with_context(|| format!("invalid zoom level for image {tile_id}: {zoom}"))?;
                *zooms.entry(zoom).or_insert(0) += 1;
            }
            records.push(ImageRecord {
                tile_id,
                zooms,
                data: row.get(1)?,
            });
        }
        Ok(records)
    }

    /// Replaces blobs in place; every coordinate sharing a blob sees the new
    /// data.
    pub fn put_images(&mut self, images: &[(ImageId, Vec<u8>)]) -> Result<()> {
        let tx = self.conn.transaction().context("begin image transaction")?;
        for (tile_id, data) in images {
            tx.prepare_cached("UPDATE images SET tile_data = ?2 WHERE tile_id = ?1")
                .context("prepare image update")?
                .execute(params![tile_id.0, data])
                .with_context(|| format!("failed to update image {tile_id}"))?;
        }
        tx.commit().context("commit image transaction")?;
        Ok(())
    }

    /// Deletes blobs and every coordinate pointing at them; returns the
    /// number of coordinates removed.
    pub fn delete_images(&mut self, ids: &[ImageId]) -> Result<u64> {
        let tx = self.conn.transaction().context("begin image delete")?;
        let mut removed = 0u64;
        for tile_id in ids {
            removed += tx
                .prepare_cached("DELETE FROM map WHERE tile_id = ?1")
                .context("prepare map delete")?
                .execute([&tile_id.0])
                .with_context(|| format!("failed to delete map rows of image {tile_id}"))?
                as u64;
            tx.prepare_cached("DELETE FROM images WHERE tile_id = ?1")
                .context("prepare image delete")?
                .execute([&tile_id.0])
                .with_context(|| format!("failed to delete image {tile_id}"))?;
        }
        tx.commit().context("commit image delete")?;
        Ok(removed)
    }

    /// Removes every tile above `max_zoom`; returns the number of rows deleted.
    pub fn delete_zoom_levels_above(&self, max_zoom: u8) -> Result<u64> {
        let sql = match self.schema {
            TileSchema::Flat => "DELETE FROM tiles WHERE zoom_level > ?1",
            TileSchema::Deduplicated => "DELETE FROM map WHERE zoom_level > ?1",
        };
        let removed = self
            .conn
            .execute(sql, [max_zoom])
            .with_context(|| format!("failed to delete zoom levels above {max_zoom}"))?;
        Ok(removed as u64)
    }

    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM metadata")
            .context("prepare metadata")?;
        let mut rows = stmt.query([]).context("query metadata")?;
        let mut metadata = BTreeMap::new();
        while let Some(row) = rows.next().context("read metadata row")? {
            let name: String = row.get(0)?;
            let value: Option<String> = row.get(1)?;
            metadata.insert(name, value.unwrap_or_default());
        }
        Ok(metadata)
    }

    pub fn get_metadata(&self, name: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE name = ?1 LIMIT 1",
                [name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read metadata `{name}`"))?;
        Ok(value.flatten())
    }

    /// Insert-or-replace; the metadata table usually has no unique index.
    pub fn set_metadata(&self, name: &str, value: &str) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE metadata SET value = ?2 WHERE name = ?1",
                params![name, value],
            )
            .with_context(|| format!("failed to update metadata `{name}`"))?;
        if updated == 0 {
            self.conn
                .execute(
                    "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
                    params![name, value],
                )
                .with_context(|| format!("failed to insert metadata `{name}`"))?;
        }
        Ok(())
    }

    /// Parses a numeric metadata entry such as `minzoom`.
    pub fn metadata_zoom(&self, name: &str) -> Result<Option<u8>> {
        match self.get_metadata(name)? {
            Some(value) => {
                let zoom = value
                    .trim()
                    .parse::<u8>()
                    .with_context(|| format!("metadata `{name}` is not a zoom level: {value}"))?;
                Ok(Some(zoom))
            }
            None => Ok(None),
        }
    }

    pub fn zoom_range(&self) -> Result<Option<(u8, u8)>> {
        let sql = match self.schema {
            TileSchema::Flat => "SELECT MIN(zoom_level), MAX(zoom_level) FROM tiles",
            TileSchema::Deduplicated => "SELECT MIN(zoom_level), MAX(zoom_level) FROM map",
        };
        let (min, max): (Option<u8>, Option<u8>) = self
            .conn
            .query_row(sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("failed to read zoom range")?;
        Ok(min.zip(max))
    }

    pub fn tile_extent(&self, zoom: u8) -> Result<Option<TileExtent>> {
        let sql = match self.schema {
            TileSchema::Flat => {
                "SELECT MIN(tile_column), MAX(tile_column), MIN(tile_row), MAX(tile_row)
                 FROM tiles WHERE zoom_level = ?1"
            }
            TileSchema::Deduplicated => {
                "SELECT MIN(tile_column), MAX(tile_column), MIN(tile_row), MAX(tile_row)
                 FROM map WHERE zoom_level = ?1"
            }
        };
        let extent: (Option<u32>, Option<u32>, Option<u32>, Option<u32>) = self
            .conn
            .query_row(sql, [zoom], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .with_context(|| format!("failed to read tile extent at zoom {zoom}"))?;
        Ok(match extent {
            (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) => Some(TileExtent {
                min_x,
                max_x,
                min_y,
                max_y,
            }),
            _ => None,
        })
    }

    /// Reclaims space after bulk updates or deletes. Call once per pass.
    pub fn compact(&self) -> Result<()> {
        if self.schema == TileSchema::Deduplicated {
            let orphans = self
                .conn
                .execute(
                    "DELETE FROM images WHERE tile_id NOT IN (SELECT tile_id FROM map)",
                    [],
                )
                .context("failed to delete orphaned images")?;
            debug!(orphans, "deleted orphaned images");
        }
        info!(path = %self.path.display(), "compacting container");
        self.conn.execute_batch("VACUUM;").context("failed to vacuum")?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        let path = self.path;
        self.conn
            .close()
            .map_err(|(_, err)| err)
            .with_context(|| format!("failed to close mbtiles: {}", path.display()))
    }
}

/// Copies metadata and tiles of `input` into a newly created container.
pub fn copy_container(input: &Path, output: &Path) -> Result<Mbtiles> {
    let source = Mbtiles::open_readonly(input)?;
    let mut target = Mbtiles::create(output)?;
    let schema = target.schema;

    let tx = target
        .conn
        .transaction()
        .context("begin output transaction")?;
    for (name, value) in source.metadata()? {
        tx.execute(
            "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
            params![name, value],
        )
        .context("insert metadata")?;
    }
    source.for_each_tile(|record| write_tile(&tx, schema, record.coord, &record.data))?;
    tx.commit().context("commit output")?;
    Ok(target)
}

fn detect_schema(conn: &Connection, path: &Path) -> Result<TileSchema> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
        .with_context(|| format!("failed to read schema: {}", path.display()))?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .with_context(|| format!("failed to read schema: {}", path.display()))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let has = |name: &str| tables.iter().any(|table| table == name);
    if has("tiles") {
        Ok(TileSchema::Flat)
    } else if has("map") && has("images") {
        Ok(TileSchema::Deduplicated)
    } else {
        Err(ContainerError::NotAContainer {
            path: path.to_path_buf(),
        }
        .into())
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA temp_store = MEMORY;
        PRAGMA cache_size = -200000;
        ",
    )
    .context("failed to apply pragmas")?;
    Ok(())
}

fn write_tile(conn: &Connection, schema: TileSchema, coord: TileCoord, data: &[u8]) -> Result<()> {
    match schema {
        TileSchema::Flat => {
            let updated = conn
                .prepare_cached(
                    "UPDATE tiles SET tile_data = ?4 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                )
                .context("prepare tile update")?
                .execute(params![coord.zoom, coord.x, coord.y, data])
                .with_context(|| format!("failed to update tile {coord}"))?;
            if updated == 0 {
                conn.prepare_cached(
                    "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
                )
                .context("prepare tile insert")?
                .execute(params![coord.zoom, coord.x, coord.y, data])
                .with_context(|| format!("failed to insert tile {coord}"))?;
            }
        }
        TileSchema::Deduplicated => {
            // A per-coordinate id keeps shared images of other tiles untouched.
            let tile_id = format!("{}/{}/{}", coord.zoom, coord.x, coord.y);
            conn.prepare_cached("DELETE FROM images WHERE tile_id = ?1")
                .context("prepare image delete")?
                .execute([&tile_id])
                .with_context(|| format!("failed to replace image {tile_id}"))?;
            conn.prepare_cached("INSERT INTO images (tile_id, tile_data) VALUES (?1, ?2)")
                .context("prepare image insert")?
                .execute(params![tile_id, data])
                .with_context(|| format!("failed to insert image {tile_id}"))?;
            let updated = conn
                .prepare_cached(
                    "UPDATE map SET tile_id = ?4 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                )
                .context("prepare map update")?
                .execute(params![coord.zoom, coord.x, coord.y, tile_id])
                .with_context(|| format!("failed to update map entry {coord}"))?;
            if updated == 0 {
                conn.prepare_cached(
                    "INSERT INTO map (zoom_level, tile_column, tile_row, tile_id) VALUES (?1, ?2, ?3, ?4)",
                )
                .context("prepare map insert")?
                .execute(params![coord.zoom, coord.x, coord.y, tile_id])
                .with_context(|| format!("failed to insert map entry {coord}"))?;
            }
        }
    }
    Ok(())
}

fn remove_tile(conn: &Connection, schema: TileSchema, coord: TileCoord) -> Result<usize> {
    let sql = match schema {
        TileSchema::Flat => {
            "DELETE FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3"
        }
        TileSchema::Deduplicated => {
            "DELETE FROM map WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3"
        }
    };
    conn.prepare_cached(sql)
        .context("prepare tile delete")?
        .execute(params![coord.zoom, coord.x, coord.y])
        .with_context(|| format!("failed to delete tile {coord}"))
}

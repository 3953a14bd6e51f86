//! Metadata index for the TSC engine
//!
//! Four tables: `measure` and `device` resolve stream tags to ids,
//! `file_index` names every TSC file on disk (relative paths), and
//! `block_index` locates every block within those files. The optimizer
//! works exclusively through this index; the engine write path appends one
//! file row plus its block rows per ingest.

use wavestore_core::{Error, Result};

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use std::collections::HashMap;
use std::path::Path;

/// One row of `block_index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub id: i64,
    pub measure_id: i64,
    pub device_id: i64,
    pub file_id: i64,
    pub start_byte: u64,
    pub num_bytes: u64,
    pub start_time_n: i64,
    pub end_time_n: i64,
    pub num_values: u64,
}

/// A block about to be inserted, before it has an id or a file id
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub start_byte: u64,
    pub num_bytes: u64,
    pub start_time_n: i64,
    pub end_time_n: i64,
    pub num_values: u64,
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Index(e.to_string())
}

/// SQLite integers are i64; larger size thresholds clamp to the maximum
fn clamp_size(size: u64) -> i64 {
    size.min(i64::MAX as u64) as i64
}

/// SQLite-backed index
///
/// A single connection behind a mutex; the pipeline's write rate is one
/// small transaction per ingested batch, far below where connection pooling
/// would matter.
pub struct SqlIndex {
    conn: Mutex<Connection>,
}

impl SqlIndex {
    /// Opens (creating if needed) the index at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::from_connection(conn)
    }

    /// Opens a transient in-memory index
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS measure (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 tag TEXT NOT NULL,
                 freq_nhz INTEGER NOT NULL,
                 units TEXT NOT NULL,
                 UNIQUE (tag, freq_nhz, units)
             );
             CREATE TABLE IF NOT EXISTS device (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 tag TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS file_index (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 path TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS block_index (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 measure_id INTEGER NOT NULL,
                 device_id INTEGER NOT NULL,
                 file_id INTEGER NOT NULL,
                 start_byte INTEGER NOT NULL,
                 num_bytes INTEGER NOT NULL,
                 start_time_n INTEGER NOT NULL,
                 end_time_n INTEGER NOT NULL,
                 num_values INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_block_stream
                 ON block_index (measure_id, device_id, start_time_n);
             CREATE INDEX IF NOT EXISTS idx_block_file ON block_index (file_id);",
        )
        .map_err(sql_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Resolves a measure id, inserting the row if absent
    pub fn get_or_insert_measure(&self, tag: &str, freq_nhz: u64, units: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO measure (tag, freq_nhz, units) VALUES (?1, ?2, ?3)",
            params![tag, freq_nhz as i64, units],
        )
        .map_err(sql_err)?;
        conn.query_row(
            "SELECT id FROM measure WHERE tag = ?1 AND freq_nhz = ?2 AND units = ?3",
            params![tag, freq_nhz as i64, units],
            |row| row.get(0),
        )
        .map_err(sql_err)
    }

    /// Resolves a device id, inserting the row if absent
    pub fn get_or_insert_device(&self, tag: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO device (tag) VALUES (?1)",
            params![tag],
        )
        .map_err(sql_err)?;
        conn.query_row(
            "SELECT id FROM device WHERE tag = ?1",
            params![tag],
            |row| row.get(0),
        )
        .map_err(sql_err)
    }

    /// Tag, frequency and units of a measure
    pub fn measure_info(&self, measure_id: i64) -> Result<Option<(String, u64, String)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT tag, freq_nhz, units FROM measure WHERE id = ?1",
            params![measure_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .map(Some)
        .or_else(map_no_rows)
    }

    pub fn device_tag(&self, device_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT tag FROM device WHERE id = ?1",
            params![device_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(map_no_rows)
    }

    /// Inserts one TSC file row and its blocks in a single transaction
    pub fn insert_file_with_blocks(
        &self,
        path: &str,
        measure_id: i64,
        device_id: i64,
        blocks: &[NewBlock],
    ) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        let file_id = insert_file_row(&tx, path)?;
        insert_block_rows(&tx, measure_id, device_id, file_id, blocks)?;
        tx.commit().map_err(sql_err)?;
        Ok(file_id)
    }

    /// Whether a block already starts at exactly this stream time
    pub fn block_exists(&self, measure_id: i64, device_id: i64, start_time_n: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM block_index
                 WHERE measure_id = ?1 AND device_id = ?2 AND start_time_n = ?3",
                params![measure_id, device_id, start_time_n],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count > 0)
    }

    /// Blocks of one stream overlapping `[start_time_n, end_time_n]`
    pub fn select_blocks(
        &self,
        measure_id: i64,
        device_id: i64,
        start_time_n: i64,
        end_time_n: i64,
    ) -> Result<Vec<BlockRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, measure_id, device_id, file_id, start_byte, num_bytes,
                        start_time_n, end_time_n, num_values
                 FROM block_index
                 WHERE measure_id = ?1 AND device_id = ?2
                   AND end_time_n >= ?3 AND start_time_n <= ?4
                 ORDER BY start_time_n ASC, end_time_n ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![measure_id, device_id, start_time_n, end_time_n],
                row_to_block,
            )
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn select_block(&self, block_id: i64) -> Result<Option<BlockRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, measure_id, device_id, file_id, start_byte, num_bytes,
                    start_time_n, end_time_n, num_values
             FROM block_index WHERE id = ?1",
            params![block_id],
            row_to_block,
        )
        .map(Some)
        .or_else(map_no_rows)
    }

    pub fn select_blocks_by_ids(&self, ids: &[i64]) -> Result<Vec<BlockRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, measure_id, device_id, file_id, start_byte, num_bytes,
                    start_time_n, end_time_n, num_values
             FROM block_index WHERE id IN ({placeholders})
             ORDER BY start_time_n ASC, end_time_n ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), row_to_block)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Files with no referencing block rows: `(file_id, relative path)`
    pub fn find_unreferenced_files(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT f.id, f.path FROM file_index f
                 LEFT JOIN (SELECT DISTINCT file_id FROM block_index) b
                 ON f.id = b.file_id
                 WHERE b.file_id IS NULL",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Streams that reference at least two files smaller than `target_size`
    pub fn find_stream_pairs_with_small_files(&self, target_size: u64) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT bi.measure_id, bi.device_id FROM block_index bi
                 JOIN (SELECT file_id FROM block_index
                       GROUP BY file_id HAVING SUM(num_bytes) < ?1) small
                 ON bi.file_id = small.file_id
                 GROUP BY bi.measure_id, bi.device_id
                 HAVING COUNT(DISTINCT bi.file_id) >= 2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![clamp_size(target_size)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Blocks of one stream whose files are smaller than `target_size`,
    /// time-ordered so they are rewritten in order
    pub fn find_small_blocks(
        &self,
        measure_id: i64,
        device_id: i64,
        target_size: u64,
    ) -> Result<Vec<BlockRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, measure_id, device_id, file_id, start_byte, num_bytes,
                        start_time_n, end_time_n, num_values
                 FROM block_index
                 WHERE measure_id = ?1 AND device_id = ?2 AND file_id IN
                   (SELECT file_id FROM block_index
                    WHERE measure_id = ?1 AND device_id = ?2
                    GROUP BY file_id HAVING SUM(num_bytes) < ?3)
                 ORDER BY start_time_n ASC, end_time_n ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![measure_id, device_id, clamp_size(target_size)],
                row_to_block,
            )
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Relative paths of the given file ids
    pub fn file_paths(&self, file_ids: &[i64]) -> Result<HashMap<i64, String>> {
        if file_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; file_ids.len()].join(",");
        let sql = format!("SELECT id, path FROM file_index WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(file_ids.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(sql_err)?;
        let mut paths = HashMap::new();
        for row in rows {
            let (id, path) = row.map_err(sql_err)?;
            paths.insert(id, path);
        }
        Ok(paths)
    }

    /// Commits an optimizer rewrite in one transaction: insert the new file
    /// rows and their blocks, delete the rewritten block rows
    pub fn apply_optimization(
        &self,
        measure_id: i64,
        device_id: i64,
        new_files: &[(String, Vec<NewBlock>)],
        old_block_ids: &[i64],
    ) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;

        let mut file_ids = Vec::with_capacity(new_files.len());
        for (path, blocks) in new_files {
            let file_id = insert_file_row(&tx, path)?;
            insert_block_rows(&tx, measure_id, device_id, file_id, blocks)?;
            file_ids.push(file_id);
        }
        for id in old_block_ids {
            tx.execute("DELETE FROM block_index WHERE id = ?1", params![id])
                .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        Ok(file_ids)
    }

    /// Blocks referencing any of the given file paths, time-ordered
    pub fn select_blocks_by_file_paths(&self, paths: &[String]) -> Result<Vec<BlockRow>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; paths.len()].join(",");
        let sql = format!(
            "SELECT b.id, b.measure_id, b.device_id, b.file_id, b.start_byte, b.num_bytes,
                    b.start_time_n, b.end_time_n, b.num_values
             FROM block_index b JOIN file_index f ON b.file_id = f.id
             WHERE f.path IN ({placeholders})
             ORDER BY b.start_time_n ASC, b.end_time_n ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(paths.iter()), row_to_block)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Undo helper: restores block rows with their original ids; rows that
    /// were never deleted are left alone
    pub fn reinsert_blocks(&self, blocks: &[BlockRow]) -> Result<()> {
        let conn = self.conn.lock();
        for b in blocks {
            conn.execute(
                "INSERT OR IGNORE INTO block_index
                 (id, measure_id, device_id, file_id, start_byte, num_bytes,
                  start_time_n, end_time_n, num_values)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    b.id,
                    b.measure_id,
                    b.device_id,
                    b.file_id,
                    b.start_byte as i64,
                    b.num_bytes as i64,
                    b.start_time_n,
                    b.end_time_n,
                    b.num_values as i64
                ],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }

    /// Undo helper: deletes block rows referencing the given file paths
    pub fn delete_blocks_by_file_paths(&self, paths: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        for path in paths {
            conn.execute(
                "DELETE FROM block_index WHERE file_id =
                 (SELECT id FROM file_index WHERE path = ?1)",
                params![path],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }

    pub fn delete_files_by_paths(&self, paths: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        for path in paths {
            conn.execute("DELETE FROM file_index WHERE path = ?1", params![path])
                .map_err(sql_err)?;
        }
        Ok(())
    }

    pub fn delete_file_rows(&self, file_ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock();
        for id in file_ids {
            conn.execute("DELETE FROM file_index WHERE id = ?1", params![id])
                .map_err(sql_err)?;
        }
        Ok(())
    }

    /// Number of distinct files holding blocks of one stream
    pub fn count_stream_files(&self, measure_id: i64, device_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT file_id) FROM block_index
                 WHERE measure_id = ?1 AND device_id = ?2",
                params![measure_id, device_id],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count as usize)
    }
}

fn insert_file_row(conn: &Connection, path: &str) -> Result<i64> {
    conn.execute("INSERT INTO file_index (path) VALUES (?1)", params![path])
        .map_err(sql_err)?;
    Ok(conn.last_insert_rowid())
}

fn insert_block_rows(
    conn: &Connection,
    measure_id: i64,
    device_id: i64,
    file_id: i64,
    blocks: &[NewBlock],
) -> Result<()> {
    for b in blocks {
        conn.execute(
            "INSERT INTO block_index
             (measure_id, device_id, file_id, start_byte, num_bytes,
              start_time_n, end_time_n, num_values)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                measure_id,
                device_id,
                file_id,
                b.start_byte as i64,
                b.num_bytes as i64,
                b.start_time_n,
                b.end_time_n,
                b.num_values as i64
            ],
        )
        .map_err(sql_err)?;
    }
    Ok(())
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRow> {
    Ok(BlockRow {
        id: row.get(0)?,
        measure_id: row.get(1)?,
        device_id: row.get(2)?,
        file_id: row.get(3)?,
        start_byte: row.get::<_, i64>(4)? as u64,
        num_bytes: row.get::<_, i64>(5)? as u64,
        start_time_n: row.get(6)?,
        end_time_n: row.get(7)?,
        num_values: row.get::<_, i64>(8)? as u64,
    })
}

fn map_no_rows<T>(e: rusqlite::Error) -> Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(sql_err(other)),
    }
}

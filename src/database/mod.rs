pub mod models;

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use thiserror::Error;

use models::{FileInfo, HashEntry};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("already being imported elsewhere: {0}")]
    AlreadyLocked(String),

    #[error("store still busy after retry: {0}")]
    Busy(rusqlite::Error),

    #[error("store error: {0}")]
    Sql(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// SQLite-backed gateway owning all persisted state: files, per-file
/// brightness, extremum hashes, pairwise whitelists, and advisory import
/// locks.
pub struct Store {
    conn: Connection,
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
    )
}

/// Run one statement, retrying a single time when the database reports
/// busy/locked contention.
fn with_retry<T>(mut op: impl FnMut() -> Result<T, rusqlite::Error>) -> StoreResult<T> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) if is_busy(&e) => {
            std::thread::sleep(Duration::from_millis(100));
            op().map_err(|e2| {
                if is_busy(&e2) {
                    StoreError::Busy(e2)
                } else {
                    StoreError::Sql(e2)
                }
            })
        }
        Err(e) => Err(StoreError::Sql(e)),
    }
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 fid      INTEGER PRIMARY KEY,
                 name     TEXT NOT NULL UNIQUE,
                 fps      REAL NOT NULL,
                 duration REAL NOT NULL
             );
             CREATE TABLE IF NOT EXISTS brightness (
                 fid         INTEGER NOT NULL REFERENCES files(fid) ON DELETE CASCADE,
                 frame_index INTEGER NOT NULL,
                 value       REAL NOT NULL,
                 PRIMARY KEY (fid, frame_index)
             );
             CREATE TABLE IF NOT EXISTS hashes (
                 fid         INTEGER NOT NULL REFERENCES files(fid) ON DELETE CASCADE,
                 frame_index INTEGER NOT NULL,
                 gap         REAL NOT NULL,
                 PRIMARY KEY (fid, frame_index)
             );
             CREATE TABLE IF NOT EXISTS whitelist (
                 fid_lo INTEGER NOT NULL REFERENCES files(fid) ON DELETE CASCADE,
                 fid_hi INTEGER NOT NULL REFERENCES files(fid) ON DELETE CASCADE,
                 PRIMARY KEY (fid_lo, fid_hi),
                 CHECK (fid_lo < fid_hi)
             );
             CREATE TABLE IF NOT EXISTS import_locks (
                 name        TEXT PRIMARY KEY,
                 acquired_at INTEGER NOT NULL
             );",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub fn get_id(&self, name: &str) -> StoreResult<Option<i64>> {
        with_retry(|| {
            self.conn
                .query_row("SELECT fid FROM files WHERE name = ?1", params![name], |r| {
                    r.get(0)
                })
                .optional()
        })
    }

    pub fn is_name_in_db(&self, name: &str) -> StoreResult<bool> {
        Ok(self.get_id(name)?.is_some())
    }

    pub fn get_file_infos(&self) -> StoreResult<Vec<FileInfo>> {
        with_retry(|| {
            let mut stmt = self
                .conn
                .prepare("SELECT fid, name, fps, duration FROM files ORDER BY fid ASC")?;
            let rows = stmt.query_map([], |r| {
                Ok(FileInfo {
                    fid: r.get(0)?,
                    name: r.get(1)?,
                    fps: r.get(2)?,
                    duration: r.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Insert the file row, or refresh fps/duration when the name is
    /// already known. Keeping the fid stable across a refresh is what lets
    /// whitelist entries survive a re-import.
    pub fn insert_file(&mut self, name: &str, fps: f64, duration: f64) -> StoreResult<FileInfo> {
        let tx = self.conn.transaction()?;
        let info = insert_file_tx(&tx, name, fps, duration)?;
        tx.commit()?;
        Ok(info)
    }

    pub fn update_name(&mut self, fid: i64, new_name: &str) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE files SET name = ?1 WHERE fid = ?2",
            params![new_name, fid],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a file row; brightness, hashes, and whitelist rows cascade.
    pub fn del_file(&mut self, fid: i64) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM files WHERE fid = ?1", params![fid])?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Brightness and hashes
    // ------------------------------------------------------------------

    pub fn insert_brightness(&mut self, fid: i64, series: &[f32]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        insert_brightness_tx(&tx, fid, series)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_brightness(&self, fid: i64) -> StoreResult<Vec<f32>> {
        with_retry(|| {
            let mut stmt = self.conn.prepare(
                "SELECT value FROM brightness WHERE fid = ?1 ORDER BY frame_index ASC",
            )?;
            let rows = stmt.query_map(params![fid], |r| r.get(0))?;
            rows.collect()
        })
    }

    pub fn insert_hashes(&mut self, fid: i64, entries: &[HashEntry]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        insert_hashes_tx(&tx, fid, entries)?;
        tx.commit()?;
        Ok(())
    }

    pub fn has_hashes(&self, fid: i64) -> StoreResult<bool> {
        with_retry(|| {
            self.conn
                .query_row(
                    "SELECT 1 FROM hashes WHERE fid = ?1 LIMIT 1",
                    params![fid],
                    |_| Ok(()),
                )
                .optional()
                .map(|r| r.is_some())
        })
    }

    /// Hash rows with `min_frame <= frame_index < max_frame`, frame order.
    pub fn get_hashes(&self, fid: i64, min_frame: i64, max_frame: i64) -> StoreResult<Vec<HashEntry>> {
        with_retry(|| {
            let mut stmt = self.conn.prepare(
                "SELECT frame_index, gap FROM hashes
                 WHERE fid = ?1 AND frame_index >= ?2 AND frame_index < ?3
                 ORDER BY frame_index ASC",
            )?;
            let rows = stmt.query_map(params![fid, min_frame, max_frame], |r| {
                Ok(HashEntry {
                    frame: r.get::<_, i64>(0)? as u32,
                    gap: r.get(1)?,
                })
            })?;
            rows.collect()
        })
    }

    /// The whole import of one file as a single transaction: file row,
    /// brightness series, hash rows.
    pub fn import_file(
        &mut self,
        name: &str,
        fps: f64,
        duration: f64,
        series: &[f32],
        entries: &[HashEntry],
    ) -> StoreResult<FileInfo> {
        let tx = self.conn.transaction()?;
        let info = insert_file_tx(&tx, name, fps, duration)?;
        insert_brightness_tx(&tx, info.fid, series)?;
        insert_hashes_tx(&tx, info.fid, entries)?;
        tx.commit()?;
        Ok(info)
    }

    // ------------------------------------------------------------------
    // Whitelist
    // ------------------------------------------------------------------

    pub fn whitelist(&mut self, fid_a: i64, fid_b: i64) -> StoreResult<()> {
        let (lo, hi) = ordered(fid_a, fid_b);
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO whitelist (fid_lo, fid_hi) VALUES (?1, ?2)",
            params![lo, hi],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn is_whitelisted(&self, fid_a: i64, fid_b: i64) -> StoreResult<bool> {
        let (lo, hi) = ordered(fid_a, fid_b);
        with_retry(|| {
            self.conn
                .query_row(
                    "SELECT 1 FROM whitelist WHERE fid_lo = ?1 AND fid_hi = ?2",
                    params![lo, hi],
                    |_| Ok(()),
                )
                .optional()
                .map(|r| r.is_some())
        })
    }

    // ------------------------------------------------------------------
    // Import locks
    // ------------------------------------------------------------------

    /// Take the advisory import lock for `name`. Stale locks past their TTL
    /// are reaped first; a fresh one belonging to someone else means
    /// `AlreadyLocked`.
    pub fn try_lock(&mut self, name: &str, ttl: Duration) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM import_locks WHERE acquired_at <= ?1",
            params![now - ttl.as_secs() as i64],
        )?;
        let inserted = tx.execute(
            "INSERT INTO import_locks (name, acquired_at) VALUES (?1, ?2)",
            params![name, now],
        );
        match inserted {
            Ok(_) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) if is_constraint(&e) => Err(StoreError::AlreadyLocked(name.to_string())),
            Err(e) => Err(StoreError::Sql(e)),
        }
    }

    pub fn unlock(&mut self, name: &str) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM import_locks WHERE name = ?1", params![name])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Sweep rows referencing fids that no longer exist. Only reachable in
    /// databases predating the cascading foreign keys, but cheap to assert.
    pub fn tidy(&mut self) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM hashes WHERE fid NOT IN (SELECT fid FROM files);
             DELETE FROM brightness WHERE fid NOT IN (SELECT fid FROM files);
             DELETE FROM whitelist WHERE fid_lo NOT IN (SELECT fid FROM files)
                 OR fid_hi NOT IN (SELECT fid FROM files);",
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn ordered(a: i64, b: i64) -> (i64, i64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn insert_file_tx(tx: &Transaction, name: &str, fps: f64, duration: f64) -> StoreResult<FileInfo> {
    let existing: Option<i64> = tx
        .query_row("SELECT fid FROM files WHERE name = ?1", params![name], |r| {
            r.get(0)
        })
        .optional()?;

    let fid = match existing {
        Some(fid) => {
            tx.execute(
                "UPDATE files SET fps = ?1, duration = ?2 WHERE fid = ?3",
                params![fps, duration, fid],
            )?;
            fid
        }
        None => {
            tx.execute(
                "INSERT INTO files (name, fps, duration) VALUES (?1, ?2, ?3)",
                params![name, fps, duration],
            )?;
            tx.last_insert_rowid()
        }
    };

    Ok(FileInfo {
        fid,
        name: name.to_string(),
        fps,
        duration,
    })
}

fn insert_brightness_tx(tx: &Transaction, fid: i64, series: &[f32]) -> StoreResult<()> {
    tx.execute("DELETE FROM brightness WHERE fid = ?1", params![fid])?;
    let mut stmt =
        tx.prepare("INSERT INTO brightness (fid, frame_index, value) VALUES (?1, ?2, ?3)")?;
    for (i, value) in series.iter().enumerate() {
        stmt.execute(params![fid, i as i64, value])?;
    }
    Ok(())
}

fn insert_hashes_tx(tx: &Transaction, fid: i64, entries: &[HashEntry]) -> StoreResult<()> {
    tx.execute("DELETE FROM hashes WHERE fid = ?1", params![fid])?;
    let mut stmt = tx.prepare("INSERT INTO hashes (fid, frame_index, gap) VALUES (?1, ?2, ?3)")?;
    for entry in entries {
        stmt.execute(params![fid, entry.frame as i64, entry.gap])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(u32, f32)]) -> Vec<HashEntry> {
        pairs
            .iter()
            .map(|&(frame, gap)| HashEntry { frame, gap })
            .collect()
    }

    #[test]
    fn test_insert_and_lookup_file() {
        let mut store = Store::open_in_memory().unwrap();
        let info = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        assert_eq!(store.get_id("/v/a.mkv").unwrap(), Some(info.fid));
        assert!(store.is_name_in_db("/v/a.mkv").unwrap());
        assert!(!store.is_name_in_db("/v/b.mkv").unwrap());
    }

    #[test]
    fn test_insert_file_refresh_keeps_fid() {
        let mut store = Store::open_in_memory().unwrap();
        let first = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        let second = store.insert_file("/v/a.mkv", 30.0, 42.0).unwrap();
        assert_eq!(first.fid, second.fid);
        let infos = store.get_file_infos().unwrap();
        assert_eq!(infos.len(), 1);
        assert!((infos[0].fps - 30.0).abs() < 1e-9);
        assert!((infos[0].duration - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_brightness_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let info = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        store
            .insert_brightness(info.fid, &[1.0, 2.5, 3.25])
            .unwrap();
        assert_eq!(store.get_brightness(info.fid).unwrap(), vec![1.0, 2.5, 3.25]);
    }

    #[test]
    fn test_get_hashes_window_is_half_open() {
        let mut store = Store::open_in_memory().unwrap();
        let info = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        store
            .insert_hashes(info.fid, &entries(&[(10, 0.4), (20, 0.4), (30, 0.4)]))
            .unwrap();
        let rows = store.get_hashes(info.fid, 10, 30).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].frame, 10);
        assert_eq!(rows[1].frame, 20);
    }

    #[test]
    fn test_del_file_cascades() {
        let mut store = Store::open_in_memory().unwrap();
        let a = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        let b = store.insert_file("/v/b.mkv", 25.0, 30.0).unwrap();
        store.insert_brightness(a.fid, &[1.0, 2.0]).unwrap();
        store
            .insert_hashes(a.fid, &entries(&[(10, 0.4)]))
            .unwrap();
        store.whitelist(a.fid, b.fid).unwrap();

        store.del_file(a.fid).unwrap();

        assert!(store.get_brightness(a.fid).unwrap().is_empty());
        assert!(store.get_hashes(a.fid, 0, i64::MAX).unwrap().is_empty());
        assert!(!store.is_whitelisted(a.fid, b.fid).unwrap());
        assert!(store.is_name_in_db("/v/b.mkv").unwrap());
    }

    #[test]
    fn test_whitelist_symmetric_and_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        let a = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        let b = store.insert_file("/v/b.mkv", 25.0, 30.0).unwrap();
        store.whitelist(b.fid, a.fid).unwrap();
        store.whitelist(a.fid, b.fid).unwrap();
        assert!(store.is_whitelisted(a.fid, b.fid).unwrap());
        assert!(store.is_whitelisted(b.fid, a.fid).unwrap());
    }

    #[test]
    fn test_whitelist_survives_refresh() {
        let mut store = Store::open_in_memory().unwrap();
        let a = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        let b = store.insert_file("/v/b.mkv", 25.0, 30.0).unwrap();
        store.whitelist(a.fid, b.fid).unwrap();

        store
            .import_file("/v/a.mkv", 25.0, 30.0, &[1.0, 2.0], &entries(&[(10, 0.4)]))
            .unwrap();

        assert!(store.is_whitelisted(a.fid, b.fid).unwrap());
    }

    #[test]
    fn test_import_replaces_previous_rows() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .import_file("/v/a.mkv", 25.0, 30.0, &[1.0, 2.0, 3.0], &entries(&[(10, 0.4), (20, 0.4)]))
            .unwrap();
        let info = store
            .import_file("/v/a.mkv", 25.0, 30.0, &[5.0], &entries(&[(15, 0.6)]))
            .unwrap();

        assert_eq!(store.get_brightness(info.fid).unwrap(), vec![5.0]);
        let rows = store.get_hashes(info.fid, 0, i64::MAX).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].frame, 15);
    }

    #[test]
    fn test_lock_blocks_and_expires() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .try_lock("/v/a.mkv", Duration::from_secs(3600))
            .unwrap();
        assert!(matches!(
            store.try_lock("/v/a.mkv", Duration::from_secs(3600)),
            Err(StoreError::AlreadyLocked(_))
        ));
        // A zero TTL makes the existing lock stale immediately.
        store.try_lock("/v/a.mkv", Duration::from_secs(0)).unwrap();
    }

    #[test]
    fn test_unlock_releases() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .try_lock("/v/a.mkv", Duration::from_secs(3600))
            .unwrap();
        store.unlock("/v/a.mkv").unwrap();
        store
            .try_lock("/v/a.mkv", Duration::from_secs(3600))
            .unwrap();
    }

    #[test]
    fn test_tidy_removes_orphans() {
        let mut store = Store::open_in_memory().unwrap();
        let a = store.insert_file("/v/a.mkv", 25.0, 30.0).unwrap();
        // Forge an orphan the way a pre-cascade database could contain one.
        store.conn.pragma_update(None, "foreign_keys", false).unwrap();
        store
            .conn
            .execute(
                "INSERT INTO hashes (fid, frame_index, gap) VALUES (999, 1, 0.5)",
                [],
            )
            .unwrap();
        store.conn.pragma_update(None, "foreign_keys", true).unwrap();

        store.tidy().unwrap();

        assert!(store.get_hashes(999, 0, i64::MAX).unwrap().is_empty());
        assert!(store.get_hashes(a.fid, 0, i64::MAX).is_ok());
    }
}

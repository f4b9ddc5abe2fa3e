//! Local Sync Index: which photos are already synchronized.

use crate::model::{RemotePhoto, RemotePhotoStatus};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct LocalSyncIndex {
    conn: Mutex<Connection>,
}

impl LocalSyncIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening sync index {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS synced_photos (
                photo_id        TEXT NOT NULL UNIQUE,
                photo_name      TEXT NOT NULL,
                photo_hash      TEXT NOT NULL,
                photo_taken_at  INTEGER NOT NULL,
                photo           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_synced_photos_name_taken_at
                ON synced_photos(photo_name, photo_taken_at);
            CREATE INDEX IF NOT EXISTS idx_synced_photos_hash
                ON synced_photos(photo_hash);",
        )
        .context("initializing sync index schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or refresh a row. Returns `false` when another photo id
    /// already owns this hash; the first row wins.
    pub fn save_photo(&self, photo: &RemotePhoto) -> Result<bool> {
        let payload = serde_json::to_string(photo)?;
        let conn = self.conn.lock();
        let owner: Option<String> = conn
            .query_row(
                "SELECT photo_id FROM synced_photos WHERE photo_hash = ?1 LIMIT 1",
                params![photo.hash],
                |row| row.get(0),
            )
            .optional()?;
        if matches!(owner, Some(ref id) if id != &photo.id) {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO synced_photos (photo_id, photo_name, photo_hash, photo_taken_at, photo)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(photo_id) DO UPDATE SET
                photo_name = excluded.photo_name,
                photo_hash = excluded.photo_hash,
                photo_taken_at = excluded.photo_taken_at,
                photo = excluded.photo",
            params![photo.id, photo.name, photo.hash, photo.taken_at_ms(), payload],
        )?;
        Ok(true)
    }

    pub fn get_by_name_and_taken_at(&self, name: &str, taken_at: i64) -> Result<Option<RemotePhoto>> {
        self.query_one(
            "SELECT photo FROM synced_photos WHERE photo_name = ?1 AND photo_taken_at = ?2 LIMIT 1",
            params![name, taken_at],
        )
    }

    pub fn get_by_hash(&self, hash: &str) -> Result<Option<RemotePhoto>> {
        self.query_one(
            "SELECT photo FROM synced_photos WHERE photo_hash = ?1 LIMIT 1",
            params![hash],
        )
    }

    pub fn get_by_id(&self, photo_id: &str) -> Result<Option<RemotePhoto>> {
        self.query_one(
            "SELECT photo FROM synced_photos WHERE photo_id = ?1",
            params![photo_id],
        )
    }

    /// Update the stored status in place. Returns whether a row matched.
    pub fn set_status(&self, photo_id: &str, status: RemotePhotoStatus) -> Result<bool> {
        let Some(mut photo) = self.get_by_id(photo_id)? else {
            return Ok(false);
        };
        photo.status = status;
        let payload = serde_json::to_string(&photo)?;
        let n = self.conn.lock().execute(
            "UPDATE synced_photos SET photo = ?1 WHERE photo_id = ?2",
            params![payload, photo_id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_deleted(&self, photo_id: &str) -> Result<bool> {
        self.set_status(photo_id, RemotePhotoStatus::Deleted)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM synced_photos", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn all(&self) -> Result<Vec<RemotePhoto>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT photo FROM synced_photos ORDER BY photo_taken_at DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    /// Full local-data wipe.
    pub fn clear(&self) -> Result<()> {
        self.conn.lock().execute("DELETE FROM synced_photos", [])?;
        Ok(())
    }

    fn query_one<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<RemotePhoto>> {
        let payload: Option<String> = self
            .conn
            .lock()
            .query_row(sql, params, |row| row.get(0))
            .optional()?;
        match payload {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("decoding stored photo")?,
            )),
            None => Ok(None),
        }
    }
}

//! Segment State Store (§4.B): durable per-segment progress and lifecycle,
//! backed by SQLite (one file under the host's XDG state directory).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};

use super::error::DownloadError;
use super::model::{DownloadId, DownloadRecord, DownloadState, SegmentRecord, SegmentState};

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn open_default() -> Result<Self, DownloadError> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("segfetch")
            .map_err(|e| DownloadError::Store(e.to_string()))?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| DownloadError::io("create state dir", state_dir.clone(), e))?;
        Self::open_path(&state_dir.join("downloads.db")).await
    }

    pub async fn open_path(db_path: &Path) -> Result<Self, DownloadError> {
        let uri = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn open_memory() -> Result<Self, DownloadError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), DownloadError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_url TEXT NOT NULL,
                final_path TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                segment_count INTEGER NOT NULL,
                state TEXT NOT NULL,
                percent REAL NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segments (
                download_id INTEGER NOT NULL,
                segment_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                bytes_written INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                temp_path TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (download_id, segment_index)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_download(
        &self,
        source_url: &str,
        final_path: &Path,
        total_size: u64,
    ) -> Result<DownloadId, DownloadError> {
        let now = unix_timestamp();
        let id = sqlx::query(
            r#"
            INSERT INTO downloads (source_url, final_path, total_size, segment_count, state, percent, downloaded_bytes, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4, 0, 0, ?5, ?5)
            "#,
        )
        .bind(source_url)
        .bind(final_path.to_string_lossy().to_string())
        .bind(total_size as i64)
        .bind(DownloadState::Idle.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_download(&self, id: DownloadId) -> Result<Option<DownloadRecord>, DownloadError> {
        let row = sqlx::query(
            "SELECT id, source_url, final_path, total_size, segment_count, state FROM downloads WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(row_to_download(row)))
    }

    pub async fn list_downloads(&self) -> Result<Vec<DownloadRecord>, DownloadError> {
        let rows = sqlx::query(
            "SELECT id, source_url, final_path, total_size, segment_count, state FROM downloads ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_download).collect())
    }

    pub async fn set_download_state(&self, id: DownloadId, state: DownloadState) -> Result<(), DownloadError> {
        sqlx::query("UPDATE downloads SET state = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(state.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Per-download progress row: `(download_id, percent, downloaded_bytes)`.
    pub async fn update_download_progress(
        &self,
        id: DownloadId,
        percent: f64,
        downloaded_bytes: u64,
    ) -> Result<(), DownloadError> {
        sqlx::query("UPDATE downloads SET percent = ?1, downloaded_bytes = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(percent)
            .bind(downloaded_bytes as i64)
            .bind(unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Commits a batch drained from the Update Batcher (§4.F) as a single
    /// transaction: every segment's field updates plus the optional
    /// per-download percent/bytes row, or none of them.
    pub async fn commit_batch(
        &self,
        download_id: DownloadId,
        segment_updates: &[(usize, super::batcher::PendingSegmentUpdate)],
        download_progress: Option<(f64, u64)>,
    ) -> Result<(), DownloadError> {
        let mut tx = self.pool.begin().await?;
        for (segment_index, update) in segment_updates {
            if let Some(v) = update.bytes_written {
                sqlx::query("UPDATE segments SET bytes_written = ?1 WHERE download_id = ?2 AND segment_index = ?3")
                    .bind(v as i64)
                    .bind(download_id)
                    .bind(*segment_index as i64)
                    .execute(&mut *tx)
                    .await?;
            }
            if let Some(v) = update.state {
                sqlx::query("UPDATE segments SET state = ?1 WHERE download_id = ?2 AND segment_index = ?3")
                    .bind(v.as_str())
                    .bind(download_id)
                    .bind(*segment_index as i64)
                    .execute(&mut *tx)
                    .await?;
            }
            if let Some(v) = update.retry_count {
                sqlx::query("UPDATE segments SET retry_count = ?1 WHERE download_id = ?2 AND segment_index = ?3")
                    .bind(v as i64)
                    .bind(download_id)
                    .bind(*segment_index as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        if let Some((percent, downloaded_bytes)) = download_progress {
            sqlx::query("UPDATE downloads SET percent = ?1, downloaded_bytes = ?2, updated_at = ?3 WHERE id = ?4")
                .bind(percent)
                .bind(downloaded_bytes as i64)
                .bind(unix_timestamp())
                .bind(download_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Atomic over the full segment set.
    pub async fn create_segments(
        &self,
        download_id: DownloadId,
        records: &[SegmentRecord],
    ) -> Result<(), DownloadError> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO segments (download_id, segment_index, start_byte, end_byte, bytes_written, state, temp_path, retry_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(download_id)
            .bind(r.segment_index as i64)
            .bind(r.start_byte as i64)
            .bind(r.end_byte as i64)
            .bind(r.bytes_written as i64)
            .bind(r.state.as_str())
            .bind(r.temp_path.to_string_lossy().to_string())
            .bind(r.retry_count as i64)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE downloads SET segment_count = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(records.len() as i64)
            .bind(unix_timestamp())
            .bind(download_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_segments(&self, download_id: DownloadId) -> Result<Vec<SegmentRecord>, DownloadError> {
        let rows = sqlx::query(
            r#"
            SELECT segment_index, start_byte, end_byte, bytes_written, state, temp_path, retry_count
            FROM segments WHERE download_id = ?1 ORDER BY segment_index ASC
            "#,
        )
        .bind(download_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let segment_index: i64 = row.get("segment_index");
                let start_byte: i64 = row.get("start_byte");
                let end_byte: i64 = row.get("end_byte");
                let bytes_written: i64 = row.get("bytes_written");
                let state: String = row.get("state");
                let temp_path: String = row.get("temp_path");
                let retry_count: i64 = row.get("retry_count");
                SegmentRecord {
                    segment_index: segment_index as usize,
                    start_byte: start_byte as u64,
                    end_byte: end_byte as u64,
                    bytes_written: bytes_written as u64,
                    state: SegmentState::from_str(&state),
                    temp_path: PathBuf::from(temp_path),
                    retry_count: retry_count as u32,
                    last_speed: 0.0,
                }
            })
            .collect())
    }

    /// Partial update of one segment. `None` fields are left unchanged.
    pub async fn update_segment(
        &self,
        download_id: DownloadId,
        segment_index: usize,
        bytes_written: Option<u64>,
        state: Option<SegmentState>,
        temp_path: Option<&Path>,
        retry_count: Option<u32>,
    ) -> Result<(), DownloadError> {
        if let Some(v) = bytes_written {
            sqlx::query("UPDATE segments SET bytes_written = ?1 WHERE download_id = ?2 AND segment_index = ?3")
                .bind(v as i64)
                .bind(download_id)
                .bind(segment_index as i64)
                .execute(&self.pool)
                .await?;
        }
        if let Some(v) = state {
            sqlx::query("UPDATE segments SET state = ?1 WHERE download_id = ?2 AND segment_index = ?3")
                .bind(v.as_str())
                .bind(download_id)
                .bind(segment_index as i64)
                .execute(&self.pool)
                .await?;
        }
        if let Some(v) = temp_path {
            sqlx::query("UPDATE segments SET temp_path = ?1 WHERE download_id = ?2 AND segment_index = ?3")
                .bind(v.to_string_lossy().to_string())
                .bind(download_id)
                .bind(segment_index as i64)
                .execute(&self.pool)
                .await?;
        }
        if let Some(v) = retry_count {
            sqlx::query("UPDATE segments SET retry_count = ?1 WHERE download_id = ?2 AND segment_index = ?3")
                .bind(v as i64)
                .bind(download_id)
                .bind(segment_index as i64)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn delete_download(&self, id: DownloadId) -> Result<(), DownloadError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM segments WHERE download_id = ?1").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM downloads WHERE id = ?1").bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn row_to_download(row: sqlx::sqlite::SqliteRow) -> DownloadRecord {
    let id: i64 = row.get("id");
    let source_url: String = row.get("source_url");
    let final_path: String = row.get("final_path");
    let total_size: i64 = row.get("total_size");
    let segment_count: i64 = row.get("segment_count");
    let state: String = row.get("state");
    DownloadRecord {
        id,
        source_url,
        final_path: PathBuf::from(final_path),
        total_size: total_size as u64,
        segment_count: segment_count as usize,
        state: DownloadState::from_str(&state),
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_segment(i: usize) -> SegmentRecord {
        SegmentRecord {
            segment_index: i,
            start_byte: (i as u64) * 100,
            end_byte: (i as u64) * 100 + 99,
            bytes_written: 0,
            state: SegmentState::Pending,
            temp_path: PathBuf::from(format!(".out.chunk{}", i)),
            retry_count: 0,
            last_speed: 0.0,
        }
    }

    #[tokio::test]
    async fn create_and_list_segments_roundtrip() {
        let store = Store::open_memory().await.unwrap();
        let id = store
            .create_download("https://example.com/f", Path::new("/tmp/f.bin"), 400)
            .await
            .unwrap();
        let segs: Vec<_> = (0..4).map(sample_segment).collect();
        store.create_segments(id, &segs).await.unwrap();

        let loaded = store.list_segments(id).await.unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[2].start_byte, 200);

        let dl = store.get_download(id).await.unwrap().unwrap();
        assert_eq!(dl.segment_count, 4);
    }

    #[tokio::test]
    async fn update_segment_partial_fields() {
        let store = Store::open_memory().await.unwrap();
        let id = store
            .create_download("https://example.com/f", Path::new("/tmp/f.bin"), 400)
            .await
            .unwrap();
        store.create_segments(id, &[sample_segment(0)]).await.unwrap();

        store
            .update_segment(id, 0, Some(42), Some(SegmentState::Fetching), None, None)
            .await
            .unwrap();
        let segs = store.list_segments(id).await.unwrap();
        assert_eq!(segs[0].bytes_written, 42);
        assert_eq!(segs[0].state, SegmentState::Fetching);

        store
            .update_segment(id, 0, None, Some(SegmentState::Completed), None, None)
            .await
            .unwrap();
        let segs = store.list_segments(id).await.unwrap();
        assert_eq!(segs[0].bytes_written, 42, "unspecified field left unchanged");
        assert_eq!(segs[0].state, SegmentState::Completed);
    }

    #[tokio::test]
    async fn download_progress_and_state_roundtrip() {
        let store = Store::open_memory().await.unwrap();
        let id = store
            .create_download("https://example.com/f", Path::new("/tmp/f.bin"), 400)
            .await
            .unwrap();
        store.set_download_state(id, DownloadState::Downloading).await.unwrap();
        store.update_download_progress(id, 0.5, 200).await.unwrap();
        let dl = store.get_download(id).await.unwrap().unwrap();
        assert_eq!(dl.state, DownloadState::Downloading);
    }
}

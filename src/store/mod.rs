//! 播放历史（书签）存储。
//!
//! 只在 open 时读取、在 pause/stop/close 时写入；存储失败只记日志，不影响播放。

use crate::core::{log_ctx, StoreError};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 一条历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub media_id: String,
    /// 上次播放位置（秒）
    pub position: f64,
    /// 更新时间（unix 秒）
    pub updated_at: i64,
}

/// 播放位置存储接口
pub trait PositionStore: Send + Sync {
    fn load_position(&self, media_id: &str) -> Result<Option<f64>, StoreError>;

    fn save_position(&self, media_id: &str, seconds: f64) -> Result<(), StoreError>;

    /// 最近播放的条目（按更新时间倒序）
    fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError>;
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS history (
            media_id   TEXT PRIMARY KEY,
            position   REAL NOT NULL,
            updated_at INTEGER NOT NULL,
            seq        INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS history_seq ON history(seq DESC);",
    )?;
    Ok(())
}

/// SQLite 历史记录
pub struct SqlitePositionStore {
    conn: Mutex<Connection>,
}

impl SqlitePositionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Other(format!("无法创建目录 {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        info!("{} 💾 打开播放历史: {}", log_ctx(), path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.conn.lock().execute("DELETE FROM history", [])?;
        Ok(())
    }
}

impl PositionStore for SqlitePositionStore {
    fn load_position(&self, media_id: &str) -> Result<Option<f64>, StoreError> {
        let position = self
            .conn
            .lock()
            .query_row(
                "SELECT position FROM history WHERE media_id = ?1",
                params![media_id],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        debug!("{} 读取播放位置 {} -> {:?}", log_ctx(), media_id, position);
        Ok(position)
    }

    fn save_position(&self, media_id: &str, seconds: f64) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO history (media_id, position, updated_at, seq)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(seq), 0) + 1 FROM history))
             ON CONFLICT(media_id) DO UPDATE SET
                position = excluded.position,
                updated_at = excluded.updated_at,
                seq = excluded.seq",
            params![media_id, seconds.max(0.0), unix_now()],
        )?;
        debug!("{} 💾 保存播放位置 {} = {:.3}s", log_ctx(), media_id, seconds);
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT media_id, position, updated_at FROM history
             ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(HistoryEntry {
                media_id: row.get(0)?,
                position: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

/// 内存历史记录（测试/无持久化场景）
#[derive(Default)]
pub struct MemoryPositionStore {
    entries: Mutex<HashMap<String, (u64, HistoryEntry)>>,
    sequence: AtomicU64,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn load_position(&self, media_id: &str) -> Result<Option<f64>, StoreError> {
        Ok(self.entries.lock().get(media_id).map(|(_, e)| e.position))
    }

    fn save_position(&self, media_id: &str, seconds: f64) -> Result<(), StoreError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            media_id.to_string(),
            (
                seq,
                HistoryEntry {
                    media_id: media_id.to_string(),
                    position: seconds.max(0.0),
                    updated_at: unix_now(),
                },
            ),
        );
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries: Vec<(u64, HistoryEntry)> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().take(limit).map(|(_, e)| e).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn PositionStore) {
        assert_eq!(store.load_position("a").unwrap(), None);
        store.save_position("a", 12.5).unwrap();
        store.save_position("b", 3.0).unwrap();
        store.save_position("a", 20.0).unwrap();
        assert_eq!(store.load_position("a").unwrap(), Some(20.0));

        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].media_id, "a");
        assert_eq!(store.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn sqlite_store_upserts_and_lists() {
        exercise(&SqlitePositionStore::open_in_memory().unwrap());
    }

    #[test]
    fn memory_store_upserts_and_lists() {
        exercise(&MemoryPositionStore::new());
    }

    #[test]
    fn sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("history.sqlite");
        SqlitePositionStore::open(&path)
            .unwrap()
            .save_position("movie.mkv", 42.0)
            .unwrap();
        let reopened = SqlitePositionStore::open(&path).unwrap();
        assert_eq!(reopened.load_position("movie.mkv").unwrap(), Some(42.0));
        reopened.clear().unwrap();
        assert!(reopened.recent(5).unwrap().is_empty());
    }

    #[test]
    fn negative_positions_are_clamped() {
        let store = MemoryPositionStore::new();
        store.save_position("x", -3.0).unwrap();
        assert_eq!(store.load_position("x").unwrap(), Some(0.0));
    }
}

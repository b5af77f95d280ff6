//! stagehand persistence: a small SQLite history of finished rollouts so
//! `stagehandctl status` can report the last outcome per namespace.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use stagehand_core::RolloutState;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub id: Uuid,
    pub namespace: String,
    /// Seconds since the epoch.
    pub ts: i64,
    /// Every required resource reached Ready.
    pub settled: bool,
    pub summary: String,
    pub state: RolloutState,
}

impl RolloutRecord {
    pub fn new(namespace: impl Into<String>, settled: bool, summary: impl Into<String>, state: RolloutState) -> Self {
        Self { id: Uuid::new_v4(), namespace: namespace.into(), ts: now_ts(), settled, summary: summary.into(), state }
    }
}

pub trait Store {
    fn put_rollout(&self, rec: &RolloutRecord) -> Result<()>;
    /// Most recent record for `namespace`, or across all namespaces when `None`.
    fn latest_rollout(&self, namespace: Option<&str>) -> Result<Option<RolloutRecord>>;
    fn history(&self, namespace: &str, limit: usize) -> Result<Vec<RolloutRecord>>;
}

fn keep_per_namespace() -> i64 {
    std::env::var("STAGEHAND_HISTORY_KEEP")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(20)
}

/// SQLite-backed store. Synchronous; history writes happen once per rollout.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("STAGEHAND_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS rollouts (
                id        BLOB NOT NULL,
                namespace TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                settled   INTEGER NOT NULL,
                summary   TEXT NOT NULL,
                state     BLOB NOT NULL
            )",
            [],
        )
        .context("creating rollouts table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_rollouts_ns_ts ON rollouts(namespace, ts DESC)", [])
            .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "history store opened");
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

type Row = (Vec<u8>, String, i64, bool, String, Vec<u8>);

fn decode(row: Row) -> Result<RolloutRecord> {
    let (id, namespace, ts, settled, summary, blob) = row;
    let id = Uuid::from_slice(&id).context("decoding rollout id")?;
    let state: RolloutState =
        serde_json::from_slice(&maybe_decompress(&blob)).context("decoding stored rollout state")?;
    Ok(RolloutRecord { id, namespace, ts, settled, summary, state })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

const COLUMNS: &str = "id, namespace, ts, settled, summary, state";

impl Store for SqliteStore {
    fn put_rollout(&self, rec: &RolloutRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let state = serde_json::to_vec(&rec.state).context("encoding rollout state")?;
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO rollouts(id, namespace, ts, settled, summary, state) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (rec.id.as_bytes().as_slice(), &rec.namespace, rec.ts, rec.settled, &rec.summary, maybe_compress(&state)),
        )?;
        // Keep the latest N per namespace (delete older rows by rowid)
        tx.execute(
            "DELETE FROM rollouts
             WHERE namespace = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM rollouts WHERE namespace = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&rec.namespace, keep_per_namespace()),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn latest_rollout(&self, namespace: Option<&str>) -> Result<Option<RolloutRecord>> {
        let db = self.conn();
        let row = match namespace {
            Some(ns) => {
                let sql = format!("SELECT {} FROM rollouts WHERE namespace = ?1 ORDER BY ts DESC, rowid DESC LIMIT 1", COLUMNS);
                let mut stmt = db.prepare(&sql)?;
                let mut rows = stmt.query_map([ns], read_row)?;
                let row = rows.next().transpose()?;
                row
            }
            None => {
                let sql = format!("SELECT {} FROM rollouts ORDER BY ts DESC, rowid DESC LIMIT 1", COLUMNS);
                let mut stmt = db.prepare(&sql)?;
                let mut rows = stmt.query_map([], read_row)?;
                let row = rows.next().transpose()?;
                row
            }
        };
        row.map(decode).transpose()
    }

    fn history(&self, namespace: &str, limit: usize) -> Result<Vec<RolloutRecord>> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let sql = format!("SELECT {} FROM rollouts WHERE namespace = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2", COLUMNS);
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map((namespace, limit as i64), read_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(row?)?);
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".stagehand");
        let _ = std::fs::create_dir_all(&p);
        p.push("stagehand.db");
        return p.to_string_lossy().to_string();
    }
    "stagehand.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

fn maybe_compress(raw: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("STAGEHAND_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(raw, lvl).unwrap_or_else(|_| raw.to_vec());
    }
    raw.to_vec()
}

fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{ResourceSpec, RolloutStatus};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("stagehand-test-{}.db", Uuid::new_v4());
        dir.join(f).to_string_lossy().to_string()
    }

    fn state() -> RolloutState {
        let spec = ResourceSpec::new("ConfigMap", "cfg", 0);
        let mut s = RolloutState::new([&spec]);
        s.advance(&spec.id, RolloutStatus::Ready);
        s
    }

    #[test]
    fn put_latest_rotate() {
        let path = temp_db();
        let s = SqliteStore::open(&path).unwrap();
        let ready = state();
        for i in 0..25 {
            let mut rec = RolloutRecord::new("shop", true, format!("run {}", i), ready.clone());
            rec.ts = i;
            s.put_rollout(&rec).unwrap();
        }
        let mut other = RolloutRecord::new("billing", false, "aborted", RolloutState::default());
        other.ts = 3;
        s.put_rollout(&other).unwrap();

        let rows = s.history("shop", 100).unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0].summary, "run 24");
        assert_eq!(rows[19].summary, "run 5");

        let latest = s.latest_rollout(Some("shop")).unwrap().unwrap();
        assert_eq!(latest.summary, "run 24");
        assert_eq!(latest.state, ready);
        assert!(latest.settled);

        let billing = s.latest_rollout(Some("billing")).unwrap().unwrap();
        assert!(!billing.settled);
        assert_eq!(billing.id, other.id);
        assert!(s.latest_rollout(Some("nowhere")).unwrap().is_none());
        assert_eq!(s.latest_rollout(None).unwrap().unwrap().summary, "run 24");
    }
}

use std::fmt::Display;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};

use crate::errors::{BspResult, Reraise};
use crate::registry::{PeerCount, PeerIndex};

use super::{OutputBuilder, OutputWriter};

/// Use [SQLite](https://sqlite.org/index.html) to store results.
///
/// Creates a SQLite DB per-peer in a given directory. Multiple DBs
/// are used to allow peers to write without contention.
///
/// DB files and tables will automatically be created if missing.
/// Values are stored as JSON text so any serializable value type
/// works. Every write is its own transaction, so results survive a
/// later failure of the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteOutput {
    /// Existing directory to store per-peer DBs in. DB files will
    /// have names like `"peer0.sqlite3"`.
    pub db_dir: PathBuf,
}

impl SqliteOutput {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
        }
    }

    pub fn db_file(&self, index: PeerIndex) -> PathBuf {
        self.db_dir.join(format!("peer{index}.sqlite3"))
    }

    /// Read back all results in one peer's DB, in write order, as
    /// `(key, value_json)`.
    pub fn read_results(db_file: &Path) -> BspResult<Vec<(String, String)>> {
        let conn = Connection::open(db_file)?;
        let mut stmt = conn.prepare("SELECT key, value_json FROM results ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(rows)
    }
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            peer INTEGER NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL
        );",
    )])
}

struct SqliteWriter<K, V> {
    conn: Connection,
    peer: PeerIndex,
    _types: PhantomData<fn(K, V)>,
}

impl<K, V> SqliteWriter<K, V> {
    fn open(db_file: &Path, peer: PeerIndex) -> BspResult<Self> {
        let mut conn = Connection::open(db_file)
            .reraise(&format!("error opening output DB {}", db_file.display()))?;
        migrations().to_latest(&mut conn)?;
        Ok(Self {
            conn,
            peer,
            _types: PhantomData,
        })
    }
}

impl<K: Display, V: Serialize> OutputWriter<K, V> for SqliteWriter<K, V> {
    fn write(&mut self, key: K, value: V) -> BspResult<()> {
        let value_json = serde_json::to_string(&value)?;
        self.conn.execute(
            "INSERT INTO results (peer, key, value_json) VALUES (?1, ?2, ?3)",
            params![self.peer.0 as i64, key.to_string(), value_json],
        )?;
        Ok(())
    }
}

impl<K, V> OutputBuilder<K, V> for SqliteOutput
where
    K: Display + 'static,
    V: Serialize + 'static,
{
    fn build(&self, index: PeerIndex, _count: PeerCount) -> BspResult<Box<dyn OutputWriter<K, V>>> {
        let db_file = self.db_file(index);
        tracing::debug!(peer = %index, db_file = %db_file.display(), "Opening SQLite output");
        Ok(Box::new(SqliteWriter::open(&db_file, index)?))
    }
}

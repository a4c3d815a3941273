//! SQLite implementation of the SnapshotSink trait.
//!
//! Uses rusqlite with bundled SQLite, wrapped in async via
//! tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use cutline_core::{Endpoint, SnapshotId, SnapshotRecord};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::SnapshotSink;

/// SQLite-based sink.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteSink {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await?
    }
}

fn id_to_sql(id: SnapshotId) -> i64 {
    id.as_u64() as i64
}

fn id_from_sql(value: i64) -> SnapshotId {
    SnapshotId::from_u64(value as u64)
}

fn parse_endpoint(text: &str) -> Result<Endpoint> {
    text.parse()
        .map_err(|e| StoreError::InvalidData(format!("stored endpoint {text:?}: {e}")))
}

fn insert_record(conn: &mut Connection, record: &SnapshotRecord) -> Result<()> {
    let tx = conn.transaction()?;
    let id = id_to_sql(record.id);

    let exists: Option<i64> = tx
        .query_row(
            "SELECT seq FROM snapshots WHERE snapshot_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(StoreError::AlreadyExists(record.id));
    }

    tx.execute(
        "INSERT INTO snapshots (snapshot_id, initiator, state, persisted_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            id,
            record.initiator.to_string(),
            record.state.as_ref().map(|s| s.to_vec()),
            migration::now_millis()
        ],
    )?;

    {
        let mut link_stmt =
            tx.prepare("INSERT INTO snapshot_links (snapshot_id, endpoint) VALUES (?1, ?2)")?;
        for link in &record.links {
            link_stmt.execute(params![id, link.to_string()])?;
        }

        let mut msg_stmt = tx.prepare(
            "INSERT INTO snapshot_messages (snapshot_id, sender, position, payload)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (sender, payloads) in &record.messages {
            let sender = sender.to_string();
            for (position, payload) in payloads.iter().enumerate() {
                msg_stmt.execute(params![id, sender, position as i64, payload.as_ref()])?;
            }
        }
    }

    tx.commit()?;
    Ok(())
}

fn select_record(conn: &Connection, id: SnapshotId) -> Result<Option<SnapshotRecord>> {
    let sql_id = id_to_sql(id);

    let row: Option<(String, Option<Vec<u8>>)> = conn
        .query_row(
            "SELECT initiator, state FROM snapshots WHERE snapshot_id = ?1",
            params![sql_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((initiator, state)) = row else {
        return Ok(None);
    };

    let links = conn
        .prepare("SELECT endpoint FROM snapshot_links WHERE snapshot_id = ?1 ORDER BY rowid")?
        .query_map(params![sql_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .iter()
        .map(|text| parse_endpoint(text))
        .collect::<Result<Vec<_>>>()?;

    let mut record = SnapshotRecord::new(
        id,
        parse_endpoint(&initiator)?,
        state.map(Bytes::from),
        links,
    );

    let messages = conn
        .prepare(
            "SELECT sender, payload FROM snapshot_messages
             WHERE snapshot_id = ?1 ORDER BY sender, position",
        )?
        .query_map(params![sql_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (sender, payload) in messages {
        record.log_message(&parse_endpoint(&sender)?, Bytes::from(payload));
    }

    Ok(Some(record))
}

#[async_trait]
impl SnapshotSink for SqliteSink {
    async fn persist(&self, record: &SnapshotRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| insert_record(conn, &record)).await
    }

    async fn load(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>> {
        self.with_conn(move |conn| select_record(conn, id)).await
    }

    async fn list(&self) -> Result<Vec<SnapshotId>> {
        self.with_conn(|conn| {
            let ids = conn
                .prepare("SELECT snapshot_id FROM snapshots ORDER BY seq")?
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids.into_iter().map(id_from_sql).collect())
        })
        .await
    }
}

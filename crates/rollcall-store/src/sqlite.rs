use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rollcall_core::codec::{self, CodecError};
use rollcall_core::store::{EmbeddingStore, StoreError};
use rollcall_core::{EmbeddingId, EnrolledEmbedding, OwnerId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database holds {stored}-dim embeddings, runtime produces {expected}")]
    DimensionMismatch { stored: usize, expected: usize },
    #[error("corrupt vector for {id}: {source}")]
    CorruptVector {
        id: String,
        #[source]
        source: CodecError,
    },
    #[error("invalid timestamp for {id}: {value}")]
    InvalidTimestamp { id: String, value: String },
}

impl From<SqliteStoreError> for StoreError {
    fn from(e: SqliteStoreError) -> Self {
        match e {
            SqliteStoreError::CorruptVector { id, source } => StoreError::Corrupt { id, source },
            other => StoreError::Backend(Box::new(other)),
        }
    }
}

/// Per-owner summary row for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerSummary {
    pub owner_id: OwnerId,
    pub embeddings: usize,
    pub last_enrolled: DateTime<Utc>,
}

/// SQLite-backed embedding store. One connection, serialized by a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    dimension: usize,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    ///
    /// Fails if the database already holds embeddings of another dimension.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, SqliteStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened embedding database");
        Self::init(conn, dimension)
    }

    pub fn open_in_memory(dimension: usize) -> Result<Self, SqliteStoreError> {
        Self::init(Connection::open_in_memory()?, dimension)
    }

    fn init(conn: Connection, dimension: usize) -> Result<Self, SqliteStoreError> {
        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'embedding_dim'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored.and_then(|v| v.parse::<usize>().ok()) {
            Some(stored) if stored != dimension => {
                return Err(SqliteStoreError::DimensionMismatch {
                    stored,
                    expected: dimension,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('embedding_dim', ?1)",
                    params![dimension.to_string()],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn insert(&self, record: &EnrolledEmbedding) -> Result<(), SqliteStoreError> {
        let blob = codec::encode(&record.vector);
        self.conn.lock().execute(
            "INSERT INTO embeddings (embedding_id, owner_id, vector, source_image, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.embedding_id.as_str(),
                record.owner_id.as_str(),
                blob,
                record.source_image_ref,
                record.enrolled_at.to_rfc3339(),
            ],
        )?;
        tracing::debug!(id = %record.embedding_id, owner = %record.owner_id, "embedding stored");
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<EnrolledEmbedding>, SqliteStoreError> {
        self.select(
            "SELECT embedding_id, owner_id, vector, source_image, enrolled_at
             FROM embeddings ORDER BY rowid",
            None,
        )
    }

    pub fn for_owner(&self, owner: &OwnerId) -> Result<Vec<EnrolledEmbedding>, SqliteStoreError> {
        self.select(
            "SELECT embedding_id, owner_id, vector, source_image, enrolled_at
             FROM embeddings WHERE owner_id = ?1 ORDER BY rowid",
            Some(owner.as_str()),
        )
    }

    pub fn owners(&self) -> Result<Vec<OwnerSummary>, SqliteStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT owner_id, COUNT(*), MAX(enrolled_at)
             FROM embeddings GROUP BY owner_id ORDER BY owner_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (owner, count, last) = row?;
            out.push(OwnerSummary {
                last_enrolled: parse_timestamp(&owner, &last)?,
                owner_id: OwnerId::new(owner),
                embeddings: count as usize,
            });
        }
        Ok(out)
    }

    pub fn remove(&self, id: &EmbeddingId) -> Result<bool, SqliteStoreError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM embeddings WHERE embedding_id = ?1", params![id.as_str()])?;
        Ok(n > 0)
    }

    /// Delete every embedding of `owner`, returning how many were removed.
    pub fn remove_owner(&self, owner: &OwnerId) -> Result<usize, SqliteStoreError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM embeddings WHERE owner_id = ?1", params![owner.as_str()])?;
        tracing::debug!(%owner, removed = n, "owner embeddings deleted");
        Ok(n)
    }

    pub fn count(&self) -> Result<usize, SqliteStoreError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn select(&self, sql: &str, owner: Option<&str>) -> Result<Vec<EnrolledEmbedding>, SqliteStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RawRow> {
            Ok(RawRow {
                id: row.get(0)?,
                owner: row.get(1)?,
                blob: row.get(2)?,
                source: row.get(3)?,
                enrolled_at: row.get(4)?,
            })
        };
        let rows = match owner {
            Some(owner) => stmt.query_map(params![owner], map)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
        };
        rows.into_iter().map(|r| r.into_record(self.dimension)).collect()
    }
}

struct RawRow {
    id: String,
    owner: String,
    blob: Vec<u8>,
    source: String,
    enrolled_at: String,
}

impl RawRow {
    fn into_record(self, dimension: usize) -> Result<EnrolledEmbedding, SqliteStoreError> {
        let vector = codec::decode(&self.blob).map_err(|source| SqliteStoreError::CorruptVector {
            id: self.id.clone(),
            source,
        })?;
        if vector.dim() != dimension {
            return Err(SqliteStoreError::DimensionMismatch {
                stored: vector.dim(),
                expected: dimension,
            });
        }
        Ok(EnrolledEmbedding {
            enrolled_at: parse_timestamp(&self.id, &self.enrolled_at)?,
            embedding_id: EmbeddingId::new(self.id),
            owner_id: OwnerId::new(self.owner),
            vector,
            source_image_ref: self.source,
        })
    }
}

fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, SqliteStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| SqliteStoreError::InvalidTimestamp {
            id: id.to_string(),
            value: value.to_string(),
        })
}

impl EmbeddingStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<EnrolledEmbedding>, StoreError> {
        Ok(self.all()?)
    }

    fn commit(&self, record: &EnrolledEmbedding) -> Result<(), StoreError> {
        Ok(self.insert(record)?)
    }

    fn delete(&self, id: &EmbeddingId) -> Result<bool, StoreError> {
        Ok(self.remove(id)?)
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    embedding_id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    vector BLOB NOT NULL,
    source_image TEXT NOT NULL,
    enrolled_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_owner ON embeddings(owner_id);
";

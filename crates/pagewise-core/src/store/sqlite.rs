//! SQLite-backed record store.
//!
//! One connection behind a mutex; WAL mode so readers in other processes
//! (a second CLI invocation, say) are not blocked by a running extraction.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params, params_from_iter};

use super::{DocumentStore, StoreError};
use crate::model::{Confidence, Document, DocumentId, DocumentMetadata, DocumentUpdate, ProcessingStatus};

const COLUMNS: &str = "id, filename, locator, byte_size, page_count, status, text, confidence, \
                       metadata_json, error, processing_time_secs, created_at, updated_at";

/// Open a SQLite connection with WAL mode and standard pragmas.
fn open_sqlite(path: &Path) -> Result<Connection, rusqlite::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn invalid_value(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    conversion_error(
        idx,
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {what}: {value}"),
        ),
    )
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let status: String = row.get(5)?;
    let confidence: Option<String> = row.get(7)?;
    let metadata_json: Option<String> = row.get(8)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    let status =
        ProcessingStatus::parse(&status).ok_or_else(|| invalid_value(5, "status", &status))?;
    let confidence = match confidence {
        Some(c) => Some(Confidence::parse(&c).ok_or_else(|| invalid_value(7, "confidence", &c))?),
        None => None,
    };
    let metadata = match metadata_json {
        Some(json) => Some(
            serde_json::from_str::<DocumentMetadata>(&json).map_err(|e| conversion_error(8, e))?,
        ),
        None => None,
    };

    Ok(Document {
        id: DocumentId::from(row.get::<_, String>(0)?),
        filename: row.get(1)?,
        locator: row.get(2)?,
        byte_size: row.get::<_, i64>(3)? as u64,
        page_count: row.get::<_, Option<i64>>(4)?.map(|n| n as usize),
        status,
        text: row.get(6)?,
        confidence,
        metadata,
        error: row.get(9)?,
        processing_time_secs: row.get(10)?,
        created_at: parse_time(11, &created_at)?,
        updated_at: parse_time(12, &updated_at)?,
    })
}

fn text_or_null(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_sqlite(path)?;
        Self::init(conn)
    }

    /// Private in-memory database; used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                 id                   TEXT PRIMARY KEY,
                 filename             TEXT NOT NULL,
                 locator              TEXT NOT NULL,
                 byte_size            INTEGER NOT NULL,
                 page_count           INTEGER,
                 status               TEXT NOT NULL,
                 text                 TEXT,
                 confidence           TEXT,
                 metadata_json        TEXT,
                 error                TEXT,
                 processing_time_secs REAL,
                 created_at           TEXT NOT NULL,
                 updated_at           TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_documents_created ON documents (created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fetch(conn: &Connection, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        let doc = conn
            .prepare_cached(&format!("SELECT {COLUMNS} FROM documents WHERE id = ?1"))?
            .query_row(params![id.as_str()], row_to_document)
            .optional()?;
        Ok(doc)
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn create(&self, document: &Document) -> Result<(), StoreError> {
        let metadata = document
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn();
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO documents ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                document.id.as_str(),
                document.filename,
                document.locator,
                document.byte_size as i64,
                document.page_count.map(|n| n as i64),
                document.status.as_str(),
                document.text,
                document.confidence.map(Confidence::as_str),
                metadata,
                document.error,
                document.processing_time_secs,
                timestamp(&document.created_at),
                timestamp(&document.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(document.id.to_string()));
        }
        Ok(())
    }

    fn get(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        Self::fetch(&self.conn(), id)
    }

    /// Only the columns named by `update` are written.
    fn update(&self, id: &DocumentId, update: DocumentUpdate) -> Result<Document, StoreError> {
        let conn = self.conn();
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(page_count) = update.page_count {
            sets.push("page_count = ?");
            values.push(Value::Integer(page_count as i64));
        }
        if let Some(text) = update.text {
            sets.push("text = ?");
            values.push(text_or_null(text));
        }
        if let Some(confidence) = update.confidence {
            sets.push("confidence = ?");
            values.push(text_or_null(confidence.map(|c| c.as_str().to_string())));
        }
        if let Some(error) = update.error {
            sets.push("error = ?");
            values.push(text_or_null(error));
        }
        if let Some(secs) = update.processing_time_secs {
            sets.push("processing_time_secs = ?");
            values.push(secs.map_or(Value::Null, Value::Real));
        }

        // Metadata is one JSON column; a bare progress update patches it in place.
        let metadata = match (update.metadata, update.chunk_progress) {
            (Some(mut metadata), progress) => {
                if let (Some(m), Some(p)) = (metadata.as_mut(), progress) {
                    m.chunk_progress = Some(p);
                }
                Some(metadata)
            }
            (None, Some(progress)) => {
                let current: Option<Option<String>> = conn
                    .query_row(
                        "SELECT metadata_json FROM documents WHERE id = ?1",
                        params![id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    return Err(StoreError::NotFound(id.to_string()));
                };
                let mut metadata = match current {
                    Some(json) => serde_json::from_str::<DocumentMetadata>(&json)?,
                    None => DocumentMetadata::default(),
                };
                metadata.chunk_progress = Some(progress);
                Some(Some(metadata))
            }
            (None, None) => None,
        };
        if let Some(metadata) = metadata {
            sets.push("metadata_json = ?");
            values.push(text_or_null(
                metadata.as_ref().map(serde_json::to_string).transpose()?,
            ));
        }

        sets.push("updated_at = ?");
        values.push(Value::Text(timestamp(&Utc::now())));
        values.push(Value::Text(id.as_str().to_string()));

        let sql = format!("UPDATE documents SET {} WHERE id = ?", sets.join(", "));
        let changed = conn.execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Self::fetch(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn delete(&self, id: &DocumentId) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM documents WHERE id = ?1", params![id.as_str()])?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<Document>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM documents ORDER BY created_at DESC, rowid DESC"
        ))?;
        let docs = stmt
            .query_map([], row_to_document)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs)
    }
}

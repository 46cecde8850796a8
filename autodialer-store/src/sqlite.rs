use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use autodialer_types::{
    CallAttempt, CallStatus, NewCallAttempt, PhoneNumber, PhoneRecord, RecordId, Statistics,
};

use crate::{PhoneStore, StoreError};

const RECORD_COLUMNS: &str =
    "id, number, status, call_sid, called_at, created_at, updated_at";
const ATTEMPT_COLUMNS: &str =
    "id, phone_number_id, status, message, started_at, ended_at, created_at";

/// SQLite-backed phone store.
///
/// Two tables: `phone_numbers` and `call_logs`, the latter referencing the
/// former by foreign key. Timestamps are stored as RFC 3339 text.
///
/// Queries run on the blocking thread pool, one at a time.
pub struct SqlitePhoneStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePhoneStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(backend)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(backend)?;
        tracing::debug!(journal_mode = %mode, "opened phone store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(backend)?;
        initialize_schema(&conn).map_err(backend)?;
        tracing::debug!("phone store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS phone_numbers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            number TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            call_sid TEXT,
            duration INTEGER,
            called_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_phone_numbers_status ON phone_numbers(status);
        CREATE TABLE IF NOT EXISTS call_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            phone_number_id INTEGER NOT NULL REFERENCES phone_numbers(id),
            status TEXT,
            message TEXT,
            started_at TEXT,
            ended_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_call_logs_phone_number_id ON call_logs(phone_number_id);",
    )
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_stamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn parse_opt_stamp(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_stamp(idx, r)).transpose()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PhoneRecord> {
    let raw_number: String = row.get(1)?;
    let number = PhoneNumber::normalize(&raw_number).ok_or_else(|| {
        conversion(
            1,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("stored number is not canonical: {raw_number}"),
            ),
        )
    })?;
    let raw_status: String = row.get(2)?;
    let status = raw_status
        .parse::<CallStatus>()
        .map_err(|e| conversion(2, e))?;
    Ok(PhoneRecord {
        id: row.get(0)?,
        number,
        status,
        call_reference_id: row.get(3)?,
        called_at: parse_opt_stamp(4, row.get(4)?)?,
        created_at: parse_stamp(5, row.get(5)?)?,
        updated_at: parse_stamp(6, row.get(6)?)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<CallAttempt> {
    Ok(CallAttempt {
        id: row.get(0)?,
        phone_record_id: row.get(1)?,
        status: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        message: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        started_at: parse_stamp(4, row.get(4)?)?,
        ended_at: parse_opt_stamp(5, row.get(5)?)?,
        created_at: parse_stamp(6, row.get(6)?)?,
    })
}

fn fetch_record(conn: &Connection, id: RecordId) -> Result<Option<PhoneRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM phone_numbers WHERE id = ?1"),
        params![id],
        record_from_row,
    )
    .optional()
    .map_err(backend)
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<PhoneRecord>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(backend)?;
    let rows = stmt.query_map(args, record_from_row).map_err(backend)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
}

fn require_updated(changed: usize, id: RecordId) -> Result<(), StoreError> {
    if changed == 0 {
        Err(StoreError::NotFound(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl PhoneStore for SqlitePhoneStore {
    async fn create(&self, number: &PhoneNumber) -> Result<PhoneRecord, StoreError> {
        let number = number.clone();
        self.call(move |conn| {
            let now = stamp(Utc::now());
            let inserted = conn.execute(
                "INSERT INTO phone_numbers (number, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![number.as_str(), CallStatus::Pending.as_str(), now],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::Duplicate(number));
                }
                Err(e) => return Err(backend(e)),
            }
            let id = conn.last_insert_rowid();
            fetch_record(conn, id)?.ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn get(&self, id: RecordId) -> Result<Option<PhoneRecord>, StoreError> {
        self.call(move |conn| fetch_record(conn, id)).await
    }

    async fn find_by_number(
        &self,
        number: &PhoneNumber,
    ) -> Result<Option<PhoneRecord>, StoreError> {
        let number = number.clone();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM phone_numbers WHERE number = ?1"),
                params![number.as_str()],
                record_from_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn list_newest_first(&self) -> Result<Vec<PhoneRecord>, StoreError> {
        self.call(|conn| {
            query_records(
                conn,
                &format!("SELECT {RECORD_COLUMNS} FROM phone_numbers ORDER BY id DESC"),
                [],
            )
        })
        .await
    }

    async fn most_recent(&self) -> Result<Option<PhoneRecord>, StoreError> {
        self.call(|conn| {
            conn.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM phone_numbers ORDER BY id DESC LIMIT 1"),
                [],
                record_from_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<PhoneRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM phone_numbers WHERE status = ?1 ORDER BY id ASC LIMIT ?2"
                ),
                params![CallStatus::Pending.as_str(), limit],
            )
        })
        .await
    }

    async fn set_status(
        &self,
        id: RecordId,
        status: CallStatus,
    ) -> Result<PhoneRecord, StoreError> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE phone_numbers SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), stamp(Utc::now()), id],
                )
                .map_err(backend)?;
            require_updated(changed, id)?;
            fetch_record(conn, id)?.ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn mark_dispatched(
        &self,
        id: RecordId,
        reference_id: &str,
        called_at: DateTime<Utc>,
    ) -> Result<PhoneRecord, StoreError> {
        let reference_id = reference_id.to_string();
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE phone_numbers
                     SET status = ?1, call_sid = ?2, called_at = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![
                        CallStatus::Completed.as_str(),
                        reference_id,
                        stamp(called_at),
                        stamp(Utc::now()),
                        id
                    ],
                )
                .map_err(backend)?;
            require_updated(changed, id)?;
            fetch_record(conn, id)?.ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn append_attempt(&self, attempt: NewCallAttempt) -> Result<CallAttempt, StoreError> {
        self.call(move |conn| {
            if fetch_record(conn, attempt.phone_record_id)?.is_none() {
                return Err(StoreError::NotFound(attempt.phone_record_id));
            }
            let now = stamp(Utc::now());
            conn.execute(
                "INSERT INTO call_logs (phone_number_id, status, message, started_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    attempt.phone_record_id,
                    attempt.status,
                    attempt.message,
                    stamp(attempt.started_at),
                    now
                ],
            )
            .map_err(backend)?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM call_logs WHERE id = ?1"),
                params![id],
                attempt_from_row,
            )
            .map_err(backend)
        })
        .await
    }

    async fn attempts_for(&self, id: RecordId) -> Result<Vec<CallAttempt>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM call_logs WHERE phone_number_id = ?1 ORDER BY id ASC"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![id], attempt_from_row)
                .map_err(backend)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
        })
        .await
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM phone_numbers GROUP BY status")
                .map_err(backend)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(backend)?;

            let mut stats = Statistics::default();
            for row in rows {
                let (status, count) = row.map_err(backend)?;
                let count = usize::try_from(count).unwrap_or(0);
                stats.total += count;
                match status.parse::<CallStatus>() {
                    Ok(CallStatus::Pending) => stats.pending += count,
                    Ok(CallStatus::Calling) => stats.calling += count,
                    Ok(CallStatus::Completed) => stats.completed += count,
                    Ok(CallStatus::Failed) => stats.failed += count,
                    Err(e) => tracing::warn!("ignoring rows with {e}"),
                }
            }
            Ok(stats)
        })
        .await
    }
}

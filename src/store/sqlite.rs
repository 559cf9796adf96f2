//! SQLite backend.
//!
//! The connection sits behind an async mutex: holding the guard is holding
//! the only connection, which is the single-writer discipline the importer
//! relies on. Blocking SQLite calls run on tokio's blocking pool with the
//! guard moved in and handed back.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{ffi, params, params_from_iter, Connection, ErrorCode};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use super::{EventStore, StoreError, StoreErrorKind, StoreTransaction};
use crate::record::{CompositeKey, ValidatedRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pageviews (
    id                  TEXT PRIMARY KEY,
    timestamp           TEXT NOT NULL,
    path                TEXT NOT NULL,
    hostname            TEXT,
    session_id          TEXT,
    device_type         TEXT NOT NULL,
    referrer_category   TEXT NOT NULL,
    duration_seconds    INTEGER NOT NULL DEFAULT 0,
    visibility_changed  INTEGER NOT NULL DEFAULT 0,
    is_unique           INTEGER NOT NULL DEFAULT 0,
    is_robot            INTEGER NOT NULL DEFAULT 0,
    query               TEXT,
    referrer            TEXT,
    referrer_domain     TEXT,
    utm_source          TEXT,
    utm_medium          TEXT,
    utm_campaign        TEXT,
    utm_term            TEXT,
    utm_content         TEXT,
    country_code        TEXT,
    region              TEXT,
    city                TEXT,
    browser_name        TEXT,
    browser_version     TEXT,
    os_name             TEXT,
    os_version          TEXT,
    device_vendor       TEXT,
    device_model        TEXT,
    language            TEXT,
    language_region     TEXT,
    timezone            TEXT,
    page_title          TEXT,
    screen_width        INTEGER,
    screen_height       INTEGER,
    viewport_width      INTEGER,
    viewport_height     INTEGER,
    scrolled_percentage INTEGER CHECK (scrolled_percentage BETWEEN 0 AND 100)
);
CREATE UNIQUE INDEX IF NOT EXISTS pageviews_natural_key
    ON pageviews (timestamp, path, session_id, hostname);
";

const INSERT: &str = "
INSERT INTO pageviews (
    id, timestamp, path, hostname, session_id, device_type, referrer_category,
    duration_seconds, visibility_changed, is_unique, is_robot,
    query, referrer, referrer_domain, utm_source, utm_medium, utm_campaign, utm_term, utm_content,
    country_code, region, city, browser_name, browser_version, os_name, os_version,
    device_vendor, device_model, language, language_region, timezone, page_title,
    screen_width, screen_height, viewport_width, viewport_height, scrolled_percentage
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
    ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37
) ON CONFLICT DO NOTHING";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the pageview table
    /// and its natural-key index exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = run_blocking(move || {
            let conn = Connection::open(&path).map_err(map_err)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")
                .map_err(map_err)?;
            Ok(conn)
        })
        .await?;
        Self::bootstrap(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = run_blocking(|| Connection::open_in_memory().map_err(map_err)).await?;
        Self::bootstrap(conn).await
    }

    async fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        let conn = run_blocking(move || {
            conn.busy_timeout(BUSY_TIMEOUT).map_err(map_err)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
                .map_err(map_err)?;
            conn.execute_batch(SCHEMA).map_err(map_err)?;
            Ok(conn)
        })
        .await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.clone().lock_owned().await;
        run_blocking(move || {
            conn.query_row("SELECT COUNT(*) FROM pageviews", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(map_err)
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.conn.clone().lock_owned().await;
        let mut conn = TxConn {
            conn: guard,
            open: false,
        };
        let conn = run_blocking(move || {
            conn.conn.execute_batch("BEGIN IMMEDIATE").map_err(map_err)?;
            conn.open = true;
            Ok(conn)
        })
        .await?;
        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }
}

/// Connection guard that rolls back an unfinished transaction when dropped,
/// including when the owning future is cancelled mid-call.
struct TxConn {
    conn: OwnedMutexGuard<Connection>,
    open: bool,
}

impl Drop for TxConn {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "sqlite rollback failed");
            }
        }
    }
}

struct SqliteTransaction {
    conn: Option<TxConn>,
}

impl SqliteTransaction {
    async fn with_conn<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let mut tx = self.conn.take().ok_or_else(finished)?;
        let (tx, result) = run_blocking(move || {
            let result = f(&mut tx.conn);
            Ok((tx, result))
        })
        .await?;
        self.conn = Some(tx);
        result
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn find_existing(
        &mut self,
        keys: &[CompositeKey],
    ) -> Result<HashSet<CompositeKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        // A VALUES list joined with IS keeps the lookup to one statement and
        // stays clear of SQLite's expression-depth limit.
        let mut sql = String::from("WITH wanted (timestamp, path, session_id, hostname) AS (VALUES ");
        let mut values = Vec::with_capacity(keys.len() * 4);
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str("(?, ?, ?, ?)");
            values.push(Value::Text(format_timestamp(key.timestamp)));
            values.push(Value::Text(key.path.clone()));
            values.push(key.session_id.clone().map_or(Value::Null, Value::Text));
            values.push(key.hostname.clone().map_or(Value::Null, Value::Text));
        }
        sql.push_str(
            ") SELECT p.timestamp, p.path, p.session_id, p.hostname \
             FROM pageviews p JOIN wanted w \
             ON p.timestamp = w.timestamp AND p.path = w.path \
             AND p.session_id IS w.session_id AND p.hostname IS w.hostname",
        );

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_err)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })
                .map_err(map_err)?;

            let mut found = HashSet::new();
            for row in rows {
                let (ts, path, session_id, hostname) = row.map_err(map_err)?;
                found.insert(CompositeKey {
                    timestamp: parse_stored_timestamp(&ts)?,
                    path,
                    session_id,
                    hostname,
                });
            }
            Ok(found)
        })
        .await
    }

    async fn insert_skip_duplicates(
        &mut self,
        records: &[ValidatedRecord],
    ) -> Result<usize, StoreError> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(INSERT).map_err(map_err)?;
            let mut inserted = 0;
            for r in &records {
                let a = &r.attributes;
                inserted += stmt
                    .execute(params![
                        r.id,
                        format_timestamp(r.timestamp),
                        r.path,
                        r.hostname,
                        r.session_id,
                        r.device_type.as_str(),
                        r.referrer_category.as_str(),
                        r.duration_seconds,
                        r.visibility_changed,
                        r.is_unique,
                        r.is_robot,
                        a.query,
                        a.referrer,
                        a.referrer_domain,
                        a.utm_source,
                        a.utm_medium,
                        a.utm_campaign,
                        a.utm_term,
                        a.utm_content,
                        a.country_code,
                        a.region,
                        a.city,
                        a.browser_name,
                        a.browser_version,
                        a.os_name,
                        a.os_version,
                        a.device_vendor,
                        a.device_model,
                        a.language,
                        a.language_region,
                        a.timezone,
                        a.page_title,
                        a.screen_width,
                        a.screen_height,
                        a.viewport_width,
                        a.viewport_height,
                        a.scrolled_percentage,
                    ])
                    .map_err(map_err)?;
            }
            Ok(inserted)
        })
        .await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        let mut tx = this.conn.take().ok_or_else(finished)?;
        run_blocking(move || {
            tx.conn.execute_batch("COMMIT").map_err(map_err)?;
            tx.open = false;
            Ok(())
        })
        .await
    }
}

/// Fixed-width UTC text so equal instants always compare equal in SQL.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stored_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::new(
                StoreErrorKind::Other,
                format!("stored timestamp '{raw}' is unreadable: {e}"),
            )
        })
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        StoreError::new(StoreErrorKind::Other, format!("blocking sqlite task failed: {e}"))
    })?
}

fn finished() -> StoreError {
    StoreError::new(StoreErrorKind::Other, "transaction already finished")
}

fn map_err(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            let kind = match e.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    StoreErrorKind::UniqueViolation
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => StoreErrorKind::ForeignKeyViolation,
                _ if e.code == ErrorCode::ConstraintViolation => {
                    StoreErrorKind::ConstraintViolation
                }
                _ => match e.code {
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreErrorKind::Timeout,
                    ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => {
                        StoreErrorKind::Connection
                    }
                    ErrorCode::NotFound => StoreErrorKind::NotFound,
                    _ => StoreErrorKind::Other,
                },
            };
            StoreError::new(kind, msg.unwrap_or_else(|| e.to_string()))
                .with_code(e.extended_code.to_string())
        }
        rusqlite::Error::QueryReturnedNoRows => {
            StoreError::new(StoreErrorKind::NotFound, "query returned no rows")
        }
        other => StoreError::new(StoreErrorKind::Other, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_codes_are_classified() {
        let unique = rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some("UNIQUE constraint failed: pageviews.id".into()),
        );
        let err = map_err(unique);
        assert_eq!(err.kind, StoreErrorKind::UniqueViolation);
        assert!(err.is_permanent());

        for code in [ffi::SQLITE_CONSTRAINT_CHECK, ffi::SQLITE_CONSTRAINT_NOTNULL] {
            let err = map_err(rusqlite::Error::SqliteFailure(ffi::Error::new(code), None));
            assert_eq!(err.kind, StoreErrorKind::ConstraintViolation);
            assert!(err.is_permanent());
        }

        let busy = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None);
        let err = map_err(busy);
        assert_eq!(err.kind, StoreErrorKind::Timeout);
        assert!(!err.is_permanent());
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.25Z")
            .unwrap()
            .with_timezone(&Utc);
        let text = format_timestamp(ts);
        assert_eq!(text, "2024-03-01T12:00:00.250000Z");
        assert_eq!(parse_stored_timestamp(&text).unwrap(), ts);
    }
}

//! SQLite-backed journal

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{Journal, JournalRecord};
use crate::error::{JournalError, Result};
use crate::request::Request;

#[derive(Clone)]
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    /// Open (creating if needed) the journal database at `db_path`
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(JournalError::IoError)?;
        }

        // Forward slashes work on both Windows and Unix; mode=rwc creates the file
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(JournalError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Journal that lives as long as the process
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(JournalError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(JournalError::MigrationError)?;

        Ok(Self { pool })
    }

    async fn fetch_record(&self, id: &str) -> Result<Option<JournalRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, method_name, route, headers, parameters, form, timestamp
            FROM requests WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(JournalError::SqlxError)?;

        Ok(row.map(|r| record_from_row(&r)))
    }
}

fn record_from_row(r: &sqlx::sqlite::SqliteRow) -> JournalRecord {
    JournalRecord {
        id: r.get("id"),
        method_name: r.get("method_name"),
        route: r.get("route"),
        headers: r.get("headers"),
        parameters: r.get("parameters"),
        form: r.get("form"),
        timestamp: r.get("timestamp"),
    }
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn put(&self, request: &Request) -> Result<Request> {
        let result = sqlx::query(
            r#"
            INSERT INTO requests (id, method_name, route, headers, parameters, form, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(request.id())
        .bind(request.method().as_str())
        .bind(request.route())
        .bind(request.headers())
        .bind(request.parameters())
        .bind(request.form())
        .bind(request.timestamp())
        .execute(&self.pool)
        .await
        .map_err(JournalError::SqlxError)?;

        if result.rows_affected() > 0 {
            tracing::debug!("Journaled request {}", request.id());
            return Ok(request.clone());
        }

        match self.fetch_record(request.id()).await? {
            Some(existing) => {
                tracing::debug!("Request {} is already journaled", request.id());
                Ok(request.clone().with_timestamp(existing.timestamp))
            }
            // Removed between the insert and the lookup
            None => Ok(request.clone()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Request>> {
        self.fetch_record(id)
            .await?
            .map(JournalRecord::into_request)
            .transpose()
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(JournalError::SqlxError)?;

        let removed = result.rows_affected() > 0;
        if removed {
            tracing::debug!("Removed request {} from journal", id);
        }
        Ok(removed)
    }

    async fn records(&self) -> Result<Vec<JournalRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, method_name, route, headers, parameters, form, timestamp
            FROM requests
            ORDER BY timestamp ASC, seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(JournalError::SqlxError)?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn clear(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM requests")
            .execute(&self.pool)
            .await
            .map_err(JournalError::SqlxError)?;

        Ok(result.rows_affected() as usize)
    }
}

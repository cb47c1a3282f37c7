// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed element store.
//!
//! Elements are stored as JSON documents next to the indexed columns used
//! for filtering. `sequence` and `revision` live in their own columns and
//! override whatever the document holds.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::element::{Element, ElementStatus};
use crate::error::{QueueError, Result};
use crate::migrations;

use super::{Change, ElementFilter, QueueBackend, QueueDb};

/// SQLite-backed element store.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Wrap an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, then run migrations.
    ///
    /// In-memory databases are limited to a single connection that is never
    /// recycled, so every query sees the same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options
            .connect(url)
            .await
            .map_err(|e| QueueError::store("connect", format!("failed to connect to {}: {}", url, e)))?;
        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file, then run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::store("create_dir", format!("failed to create {:?}: {}", parent, e))
            })?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_db(value: &str) -> Result<QueueDb> {
    match value {
        "inbox" => Ok(QueueDb::Inbox),
        "queue" => Ok(QueueDb::Queue),
        other => Err(QueueError::DataIntegrity(format!("unknown collection '{}'", other))),
    }
}

fn decode(sequence: i64, revision: i64, doc: &str) -> Result<Element> {
    let mut element: Element = serde_json::from_str(doc)?;
    element.sequence = sequence as u64;
    element.revision = revision as u64;
    Ok(element)
}

#[async_trait]
impl QueueBackend for SqliteBackend {
    async fn insert_elements(&self, db: QueueDb, elements: Vec<Element>) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for element in elements {
            let doc = serde_json::to_string(&element)?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO elements
                    (db, id, request_name, status, parent_queue_id, child_queue_url,
                     sequence, revision, active, updated_at, doc)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                        (SELECT COALESCE(MAX(sequence), 0) + 1 FROM elements),
                        1, ?7, ?8, ?9)
                "#,
            )
            .bind(db.as_str())
            .bind(&element.id)
            .bind(&element.request_name)
            .bind(element.status.as_str())
            .bind(&element.parent_queue_id)
            .bind(&element.child_queue_url)
            .bind(element.is_active())
            .bind(element.updated_at.timestamp_millis())
            .bind(&doc)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }

            sqlx::query("INSERT INTO element_changes (db, element_id, status) VALUES (?, ?, ?)")
                .bind(db.as_str())
                .bind(&element.id)
                .bind(element.status.as_str())
                .execute(&mut *tx)
                .await?;
            inserted.push(element.id);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_element(&self, db: QueueDb, id: &str) -> Result<Option<Element>> {
        let row = sqlx::query_as::<_, (i64, i64, String)>(
            "SELECT sequence, revision, doc FROM elements WHERE db = ? AND id = ?",
        )
        .bind(db.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(sequence, revision, doc)| decode(sequence, revision, &doc))
            .transpose()
    }

    async fn list_elements(&self, db: QueueDb, filter: &ElementFilter) -> Result<Vec<Element>> {
        let rows = sqlx::query_as::<_, (i64, i64, String)>(
            r#"
            SELECT sequence, revision, doc
            FROM elements
            WHERE db = ?1
              AND (?2 IS NULL OR request_name = ?2)
              AND (?3 IS NULL OR parent_queue_id = ?3)
              AND (?4 IS NULL OR child_queue_url = ?4)
              AND (?5 IS NULL OR updated_at < ?5)
              AND (?6 OR active = 1)
            ORDER BY sequence ASC
            "#,
        )
        .bind(db.as_str())
        .bind(&filter.request_name)
        .bind(&filter.parent_queue_id)
        .bind(&filter.child_queue_url)
        .bind(filter.updated_before.map(|t| t.timestamp_millis()))
        .bind(filter.include_inactive)
        .fetch_all(&self.pool)
        .await?;

        let mut elements = Vec::with_capacity(rows.len());
        for (sequence, revision, doc) in rows {
            let element = decode(sequence, revision, &doc)?;
            // Status sets are applied here rather than in SQL.
            if filter.matches(&element) {
                elements.push(element);
            }
        }
        Ok(elements)
    }

    async fn update_element(&self, db: QueueDb, element: &Element) -> Result<bool> {
        let doc = serde_json::to_string(element)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE elements
            SET request_name = ?1, status = ?2, parent_queue_id = ?3, child_queue_url = ?4,
                revision = revision + 1, active = ?5, updated_at = ?6, doc = ?7
            WHERE db = ?8 AND id = ?9 AND revision = ?10
            "#,
        )
        .bind(&element.request_name)
        .bind(element.status.as_str())
        .bind(&element.parent_queue_id)
        .bind(&element.child_queue_url)
        .bind(element.is_active())
        .bind(element.updated_at.timestamp_millis())
        .bind(&doc)
        .bind(db.as_str())
        .bind(&element.id)
        .bind(element.revision as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT revision FROM elements WHERE db = ? AND id = ?")
                    .bind(db.as_str())
                    .bind(&element.id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(QueueError::ElementNotFound {
                    element_id: element.id.clone(),
                }),
            };
        }

        sqlx::query("INSERT INTO element_changes (db, element_id, status) VALUES (?, ?, ?)")
            .bind(db.as_str())
            .bind(&element.id)
            .bind(element.status.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_elements(&self, db: QueueDb, ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for id in ids {
            let result = sqlx::query("DELETE FROM elements WHERE db = ? AND id = ?")
                .bind(db.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                continue;
            }
            deleted += result.rows_affected();
            sqlx::query("INSERT INTO element_changes (db, element_id, status) VALUES (?, ?, NULL)")
                .bind(db.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn poll_changes(&self, since: u64, limit: u32) -> Result<(Vec<Change>, u64)> {
        let rows = sqlx::query_as::<_, (i64, String, String, Option<String>)>(
            r#"
            SELECT seq, db, element_id, status
            FROM element_changes
            WHERE seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(since as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut changes = Vec::with_capacity(rows.len());
        for (seq, db, element_id, status) in rows {
            changes.push(Change {
                seq: seq as u64,
                db: parse_db(&db)?,
                element_id,
                status: status.map(|s| s.parse::<ElementStatus>()).transpose()?,
            });
        }
        let next = changes.last().map(|c| c.seq).unwrap_or(since);
        Ok((changes, next))
    }

    async fn prune_changes(&self, before: DateTime<Utc>) -> Result<u64> {
        // changed_at holds SQLite's CURRENT_TIMESTAMP text (UTC, seconds).
        let result = sqlx::query("DELETE FROM element_changes WHERE changed_at < ?")
            .bind(before.format("%Y-%m-%d %H:%M:%S").to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

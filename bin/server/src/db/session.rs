//! Postgres-backed session storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mir_core::{Result, SessionId};
use mir_persistence::{ChatLogRecord, SessionSnapshot, SessionStorage, StorageError, UserRecord};
use rootcause::Report;
use sqlx::{FromRow, PgPool};

/// Row type for the snapshot query.
#[derive(FromRow)]
struct SnapshotRow {
    summary: String,
    total_input_tokens: i64,
    total_output_tokens: i64,
}

impl SnapshotRow {
    fn try_into_snapshot(self) -> std::result::Result<SessionSnapshot, StorageError> {
        Ok(SessionSnapshot {
            summary: self.summary,
            total_input_tokens: from_column("total_input_tokens", self.total_input_tokens)?,
            total_output_tokens: from_column("total_output_tokens", self.total_output_tokens)?,
        })
    }
}

/// Session storage on the `users` and `chat_logs` tables.
#[derive(Clone)]
pub struct PgSessionStorage {
    pool: PgPool,
}

impl PgSessionStorage {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStorage for PgSessionStorage {
    #[tracing::instrument(skip_all, fields(session_id = %id))]
    async fn load_session_snapshot(
        &self,
        id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT summary, total_input_tokens, total_output_tokens
            FROM users
            WHERE external_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_snapshot()?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip_all, fields(session_id = %record.external_id))]
    async fn upsert_user(&self, record: &UserRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO users
                (external_id, name, created_at, last_seen_at,
                 total_input_tokens, total_output_tokens, summary)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, users.name),
                last_seen_at = GREATEST(users.last_seen_at, EXCLUDED.last_seen_at),
                total_input_tokens = GREATEST(users.total_input_tokens, EXCLUDED.total_input_tokens),
                total_output_tokens = GREATEST(users.total_output_tokens, EXCLUDED.total_output_tokens),
                summary = EXCLUDED.summary
            "#,
        )
        .bind(record.external_id.as_str())
        .bind(&record.name)
        .bind(record.created_at)
        .bind(record.last_seen_at)
        .bind(to_column("total_input_tokens", record.total_input_tokens)?)
        .bind(to_column("total_output_tokens", record.total_output_tokens)?)
        .bind(&record.summary)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(session_id = %record.user_id))]
    async fn append_chat_log(&self, record: &ChatLogRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO chat_logs
                (id, user_id, user_text, assistant_text, created_at,
                 input_tokens, output_tokens, used_tools)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.user_id.as_str())
        .bind(&record.user_text)
        .bind(&record.assistant_text)
        .bind(record.timestamp)
        .bind(to_column("input_tokens", record.input_tokens)?)
        .bind(to_column("output_tokens", record.output_tokens)?)
        .bind(&record.used_tools)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(session_id = %id))]
    async fn save_session_summary(
        &self,
        id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StorageError> {
        let now: DateTime<Utc> = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO users
                (external_id, created_at, last_seen_at,
                 total_input_tokens, total_output_tokens, summary)
            VALUES ($1, $2, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO UPDATE SET
                last_seen_at = GREATEST(users.last_seen_at, EXCLUDED.last_seen_at),
                total_input_tokens = EXCLUDED.total_input_tokens,
                total_output_tokens = EXCLUDED.total_output_tokens,
                summary = EXCLUDED.summary
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .bind(to_column("total_input_tokens", snapshot.total_input_tokens)?)
        .bind(to_column("total_output_tokens", snapshot.total_output_tokens)?)
        .bind(&snapshot.summary)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}

/// Maps a driver error onto the storage taxonomy.
fn storage_error(e: sqlx::Error) -> Report<StorageError> {
    let error = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Unavailable {
                reason: e.to_string(),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StorageError::Decode {
            details: e.to_string(),
        },
        _ => StorageError::Query {
            details: e.to_string(),
        },
    };
    error.into()
}

/// Token counters are `BIGINT` columns.
fn to_column(column: &'static str, value: u64) -> std::result::Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Query {
        details: format!("{column} value {value} exceeds BIGINT"),
    })
}

fn from_column(column: &'static str, value: i64) -> std::result::Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Decode {
        details: format!("negative {column}: {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_columns_round_trip_within_range() {
        assert_eq!(to_column("total_input_tokens", 42).unwrap(), 42);
        assert_eq!(from_column("total_input_tokens", 42).unwrap(), 42);
    }

    #[test]
    fn oversized_tokens_are_rejected() {
        assert!(matches!(
            to_column("input_tokens", u64::MAX),
            Err(StorageError::Query { .. })
        ));
    }

    #[test]
    fn negative_tokens_fail_to_decode() {
        let row = SnapshotRow {
            summary: String::new(),
            total_input_tokens: -1,
            total_output_tokens: 0,
        };
        assert!(matches!(
            row.try_into_snapshot(),
            Err(StorageError::Decode { .. })
        ));
    }

    #[test]
    fn pool_timeout_is_unavailable() {
        let report = storage_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(
            report.current_context(),
            StorageError::Unavailable { .. }
        ));
    }

    #[test]
    fn missing_row_is_a_query_error() {
        let report = storage_error(sqlx::Error::RowNotFound);
        assert!(matches!(
            report.current_context(),
            StorageError::Query { .. }
        ));
    }
}

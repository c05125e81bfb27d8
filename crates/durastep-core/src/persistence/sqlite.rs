// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Descriptors, slot values and results are stored as JSON text. Applying a
//! transition's actions runs in a single transaction.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use crate::descriptors::{IntentId, MethodId, RoutineDescriptor, ServiceId, TransitionKind};
use crate::error::{EngineError, Result};
use crate::intents::{ExecuteRoutineIntent, ScheduledActions};
use crate::migrations;
use crate::values::NamedValues;

use super::{Persistence, QueuedTransition, RoutineRecord, RoutineStatus, STALE_CLAIM};

/// How long a connection waits for another writer before failing with
/// `database is locked`.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    ///
    /// In-memory databases get a single connection so every query sees the
    /// same database. File databases run in WAL mode, and writers wait up to
    /// [`BUSY_TIMEOUT`] for the write lock.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options: SqliteConnectOptions = url
            .parse()
            .map_err(|e| EngineError::storage("connect", format!("{}: {}", url, e)))?;
        options = options.create_if_missing(true).busy_timeout(BUSY_TIMEOUT);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .map_err(|e| EngineError::storage("connect", format!("{}: {}", url, e)))?;

        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a database file at `path`, creating parent
    /// directories as needed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::storage(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction that takes the write lock up front, so a read
    /// followed by a write never fails on lock upgrade.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

fn parse_intent_id(text: &str) -> Result<IntentId> {
    text.parse()
        .map_err(|e| EngineError::storage("decode", format!("intent id '{}': {}", text, e)))
}

#[derive(sqlx::FromRow)]
struct RoutineRow {
    intent_id: String,
    service_id: String,
    method_id: String,
    parameters: String,
    status: String,
    state: Option<String>,
    result: Option<String>,
    continuations: String,
    caller: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RoutineRow> for RoutineRecord {
    type Error = EngineError;

    fn try_from(row: RoutineRow) -> Result<Self> {
        Ok(Self {
            service_id: from_json(&row.service_id)?,
            routine: RoutineDescriptor {
                method_id: MethodId::new(row.method_id),
                intent_id: parse_intent_id(&row.intent_id)?,
            },
            parameters: from_json(&row.parameters)?,
            status: RoutineStatus::parse(&row.status).ok_or_else(|| {
                EngineError::storage("decode", format!("routine status '{}'", row.status))
            })?,
            state: row.state.as_deref().map(from_json).transpose()?,
            result: row.result.as_deref().map(from_json).transpose()?,
            continuations: from_json(&row.continuations)?,
            caller: row.caller.as_deref().map(from_json).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    id: String,
    kind: String,
    service_id: String,
    routine_intent_id: String,
    method_id: String,
    awaited_result: Option<String>,
    attempt: i64,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for QueuedTransition {
    type Error = EngineError;

    fn try_from(row: TransitionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            kind: TransitionKind::parse(&row.kind),
            service_id: from_json(&row.service_id)?,
            routine: RoutineDescriptor {
                method_id: MethodId::new(row.method_id),
                intent_id: parse_intent_id(&row.routine_intent_id)?,
            },
            awaited_result: row.awaited_result.as_deref().map(from_json).transpose()?,
            attempt: u32::try_from(row.attempt)
                .map_err(|e| EngineError::storage("decode", e))?,
            last_error: row.last_error,
            enqueued_at: row.enqueued_at,
        })
    }
}

const TRANSITION_COLUMNS: &str = "id, kind, service_id, routine_intent_id, method_id, awaited_result, attempt, last_error, enqueued_at";

async fn insert_routine(conn: &mut SqliteConnection, record: &RoutineRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO routines (
            intent_id, service_id, method_id, parameters, status, state, result,
            continuations, caller, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.routine.intent_id.to_string())
    .bind(to_json(&record.service_id)?)
    .bind(record.routine.method_id.as_str())
    .bind(to_json(&record.parameters)?)
    .bind(record.status.as_str())
    .bind(record.state.as_ref().map(to_json).transpose()?)
    .bind(record.result.as_ref().map(to_json).transpose()?)
    .bind(to_json(&record.continuations)?)
    .bind(record.caller.as_ref().map(to_json).transpose()?)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn enqueue(conn: &mut SqliteConnection, transition: &QueuedTransition) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transition_queue (
            id, kind, service_id, routine_intent_id, method_id, awaited_result,
            attempt, status, enqueued_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
        "#,
    )
    .bind(&transition.id)
    .bind(transition.kind.as_str())
    .bind(to_json(&transition.service_id)?)
    .bind(transition.routine.intent_id.to_string())
    .bind(transition.routine.method_id.as_str())
    .bind(transition.awaited_result.as_ref().map(to_json).transpose()?)
    .bind(i64::from(transition.attempt))
    .bind(transition.enqueued_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn schedule(&self, intent: &ExecuteRoutineIntent) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;
        insert_routine(&mut tx, &RoutineRecord::scheduled(intent, now)).await?;
        enqueue(&mut tx, &QueuedTransition::invoke(intent, now)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply(&self, delivery_id: &str, actions: &ScheduledActions) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT routine_intent_id FROM transition_queue
            WHERE id = ? AND status = 'claimed'
            "#,
        )
        .bind(delivery_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((routine_id,)) = claimed else {
            return Err(EngineError::Commit(format!(
                "transition '{}' is not claimed",
                delivery_id
            )));
        };

        if let Some(save) = &actions.save_state {
            if let Some(state) = &save.service_state {
                sqlx::query(
                    r#"
                    INSERT INTO service_states (service_key, state, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(service_key) DO UPDATE
                    SET state = excluded.state, updated_at = excluded.updated_at
                    "#,
                )
                .bind(to_json(&save.service_id)?)
                .bind(to_json(state)?)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            if let Some(result) = &save.routine_result {
                sqlx::query(
                    r#"
                    UPDATE routines
                    SET status = 'completed', result = ?, state = NULL, updated_at = ?
                    WHERE intent_id = ?
                    "#,
                )
                .bind(to_json(result)?)
                .bind(now)
                .bind(&routine_id)
                .execute(&mut *tx)
                .await?;
            } else if let Some(state) = &save.routine_state {
                sqlx::query(
                    r#"
                    UPDATE routines
                    SET status = 'suspended', state = ?, updated_at = ?
                    WHERE intent_id = ?
                    "#,
                )
                .bind(to_json(state)?)
                .bind(now)
                .bind(&routine_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        for intent in &actions.execute_routine_intents {
            insert_routine(&mut tx, &RoutineRecord::scheduled(intent, now)).await?;
            enqueue(&mut tx, &QueuedTransition::invoke(intent, now)).await?;
        }
        for intent in &actions.continuation_intents {
            enqueue(&mut tx, &QueuedTransition::continuation(intent, now)).await?;
        }

        sqlx::query("DELETE FROM transition_queue WHERE id = ?")
            .bind(delivery_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            delivery_id,
            requested = actions.execute_routine_intents.len(),
            continuations = actions.continuation_intents.len(),
            "Applied transition actions"
        );
        Ok(())
    }

    async fn get_routine(&self, intent_id: IntentId) -> Result<Option<RoutineRecord>> {
        let row = sqlx::query_as::<_, RoutineRow>(
            r#"
            SELECT intent_id, service_id, method_id, parameters, status, state, result,
                   continuations, caller, created_at, updated_at
            FROM routines
            WHERE intent_id = ?
            "#,
        )
        .bind(intent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(RoutineRecord::try_from).transpose()
    }

    async fn get_service_state(&self, service_id: &ServiceId) -> Result<Option<NamedValues>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM service_states WHERE service_key = ?")
                .bind(to_json(service_id)?)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(state,)| from_json(&state)).transpose()
    }

    async fn claim_transitions(&self, limit: usize) -> Result<Vec<QueuedTransition>> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let rows = sqlx::query_as::<_, TransitionRow>(&format!(
            "SELECT {} FROM transition_queue WHERE status = 'pending' ORDER BY rowid LIMIT ?",
            TRANSITION_COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            sqlx::query("UPDATE transition_queue SET status = 'claimed', claimed_at = ? WHERE id = ?")
                .bind(now)
                .bind(&row.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        rows.into_iter().map(QueuedTransition::try_from).collect()
    }

    async fn abandon_transition(&self, delivery_id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE transition_queue
            SET status = 'pending', attempt = attempt + 1, last_error = ?, claimed_at = NULL
            WHERE id = ? AND status = 'claimed'
            "#,
        )
        .bind(error)
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Commit(format!(
                "transition '{}' is not claimed",
                delivery_id
            )));
        }
        Ok(())
    }

    async fn fail_transition(&self, delivery_id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE transition_queue
            SET status = 'failed', last_error = ?
            WHERE id = ? AND status = 'claimed'
            "#,
        )
        .bind(error)
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Commit(format!(
                "transition '{}' is not claimed",
                delivery_id
            )));
        }
        Ok(())
    }

    async fn reclaim_stale_transitions(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE transition_queue
            SET status = 'pending', attempt = attempt + 1, last_error = ?, claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < ?
            "#,
        )
        .bind(STALE_CLAIM)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or_default())
    }

    async fn pending_transitions(&self) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transition_queue WHERE status != 'failed'")
                .fetch_one(&self.pool)
                .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn failed_transitions(&self) -> Result<Vec<QueuedTransition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(&format!(
            "SELECT {} FROM transition_queue WHERE status = 'failed' ORDER BY rowid",
            TRANSITION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedTransition::try_from).collect()
    }
}

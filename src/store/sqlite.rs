//! SQLite-backed handoff storage
//!
//! [`SqliteHandoffStore`] persists the audit trail, ownership, rate
//! counters, and threshold profiles, and doubles as a [`LockStore`]: a
//! database file shared by several orchestrator processes gives them a
//! common lock table, so it can serve as the preferred lock backend
//! where no dedicated distributed store is deployed.
//!
//! Timestamps are stored as fixed-width UTC text (microsecond RFC 3339)
//! so that lexicographic comparison inside SQL matches chronological
//! order. Lock operations are single statements and rely on SQLite's
//! writer serialization for atomicity.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::candidate::{AgentRole, AttemptDecision, BlockReason, Direction, HandoffAttempt};
use crate::error::{HandoffError, Result};
use crate::lock::LockStore;
use crate::rate_limit::RateCounters;
use crate::store::HandoffStore;
use crate::threshold::ThresholdProfile;

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| HandoffError::Backend(format!("unparseable timestamp {raw:?}: {e}")))?
        .with_timezone(&Utc))
}

/// Persistent store for handoff state
pub struct SqliteHandoffStore {
    pool: Pool<Sqlite>,
}

impl SqliteHandoffStore {
    /// Open (or create) a database file and run migrations.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePool::connect(&db_url).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store, useful for tests.
    ///
    /// Capped at one connection: each SQLite memory connection gets its
    /// own database, so a wider pool would scatter the tables.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS handoff_attempts (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                source_role TEXT NOT NULL,
                target_role TEXT NOT NULL,
                confidence REAL NOT NULL,
                threshold_used REAL NOT NULL,
                decision TEXT NOT NULL,
                block_reason TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_attempts_conversation
            ON handoff_attempts(conversation_id, created_at)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                current_owner TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_counters (
                conversation_id TEXT PRIMARY KEY,
                hourly_count INTEGER NOT NULL,
                hourly_window_start TEXT NOT NULL,
                daily_count INTEGER NOT NULL,
                daily_window_start TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threshold_profiles (
                direction TEXT PRIMARY KEY,
                current_threshold REAL NOT NULL,
                sample_count INTEGER NOT NULL,
                success_count INTEGER NOT NULL,
                failure_count INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_locks (
                conversation_id TEXT PRIMARY KEY,
                holder_token TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn attempt_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<HandoffAttempt> {
        let id: String = row.get("id");
        let decision: String = row.get("decision");
        let block_reason: Option<String> = row.get("block_reason");
        let created_at: String = row.get("created_at");
        let source: String = row.get("source_role");
        let target: String = row.get("target_role");

        Ok(HandoffAttempt {
            id: uuid::Uuid::parse_str(&id)
                .map_err(|e| HandoffError::Backend(format!("bad attempt id {id:?}: {e}")))?,
            conversation_id: row.get("conversation_id"),
            source_role: AgentRole::from_str(&source)?,
            target_role: AgentRole::from_str(&target)?,
            confidence: row.get("confidence"),
            threshold_used: row.get("threshold_used"),
            decision: match decision.as_str() {
                "executed" => AttemptDecision::Executed,
                "blocked" => AttemptDecision::Blocked,
                other => {
                    return Err(HandoffError::Backend(format!(
                        "unknown decision value: {other}"
                    )))
                }
            },
            block_reason: block_reason
                .as_deref()
                .map(BlockReason::from_str)
                .transpose()?,
            created_at: parse_ts(&created_at)?,
        })
    }
}

#[async_trait]
impl HandoffStore for SqliteHandoffStore {
    async fn append_attempt(&self, attempt: &HandoffAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO handoff_attempts
                (id, conversation_id, source_role, target_role, confidence,
                 threshold_used, decision, block_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.id.to_string())
        .bind(&attempt.conversation_id)
        .bind(attempt.source_role.as_str())
        .bind(attempt.target_role.as_str())
        .bind(attempt.confidence)
        .bind(attempt.threshold_used)
        .bind(attempt.decision.as_str())
        .bind(attempt.block_reason.map(|r| r.as_str()))
        .bind(format_ts(attempt.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attempts(&self, conversation_id: &str) -> Result<Vec<HandoffAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM handoff_attempts
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::attempt_from_row).collect()
    }

    async fn executed_since(
        &self,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HandoffAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM handoff_attempts
            WHERE conversation_id = ? AND decision = 'executed' AND created_at > ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .bind(format_ts(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::attempt_from_row).collect()
    }

    async fn current_owner(&self, conversation_id: &str) -> Result<Option<AgentRole>> {
        let owner: Option<String> = sqlx::query_scalar(
            r#"
            SELECT current_owner FROM conversations WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        owner.as_deref().map(AgentRole::from_str).transpose()
    }

    async fn set_owner(&self, conversation_id: &str, owner: AgentRole) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, current_owner, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE
                SET current_owner = excluded.current_owner,
                    updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(owner.as_str())
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn counters(&self, conversation_id: &str) -> Result<Option<RateCounters>> {
        let row = sqlx::query(
            r#"
            SELECT hourly_count, hourly_window_start, daily_count, daily_window_start
            FROM rate_counters
            WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let hourly_start: String = row.get("hourly_window_start");
                let daily_start: String = row.get("daily_window_start");
                Ok(Some(RateCounters {
                    hourly_count: row.get::<i64, _>("hourly_count") as u32,
                    hourly_window_start: parse_ts(&hourly_start)?,
                    daily_count: row.get::<i64, _>("daily_count") as u32,
                    daily_window_start: parse_ts(&daily_start)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_counters(&self, conversation_id: &str, counters: &RateCounters) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_counters
                (conversation_id, hourly_count, hourly_window_start,
                 daily_count, daily_window_start)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE
                SET hourly_count = excluded.hourly_count,
                    hourly_window_start = excluded.hourly_window_start,
                    daily_count = excluded.daily_count,
                    daily_window_start = excluded.daily_window_start
            "#,
        )
        .bind(conversation_id)
        .bind(counters.hourly_count as i64)
        .bind(format_ts(counters.hourly_window_start))
        .bind(counters.daily_count as i64)
        .bind(format_ts(counters.daily_window_start))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn profiles(&self) -> Result<Vec<ThresholdProfile>> {
        let rows = sqlx::query(
            r#"
            SELECT direction, current_threshold, sample_count, success_count, failure_count
            FROM threshold_profiles
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let direction: String = row.get("direction");
                Ok(ThresholdProfile {
                    direction: Direction::from_str(&direction)?,
                    current_threshold: row.get("current_threshold"),
                    sample_count: row.get::<i64, _>("sample_count") as u64,
                    success_count: row.get::<i64, _>("success_count") as u64,
                    failure_count: row.get::<i64, _>("failure_count") as u64,
                })
            })
            .collect()
    }

    async fn save_profile(&self, profile: &ThresholdProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threshold_profiles
                (direction, current_threshold, sample_count, success_count, failure_count)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(direction) DO UPDATE
                SET current_threshold = excluded.current_threshold,
                    sample_count = excluded.sample_count,
                    success_count = excluded.success_count,
                    failure_count = excluded.failure_count
            "#,
        )
        .bind(profile.direction.to_string())
        .bind(profile.current_threshold)
        .bind(profile.sample_count as i64)
        .bind(profile.success_count as i64)
        .bind(profile.failure_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockStore for SqliteHandoffStore {
    /// Set-if-absent with expiry takeover, in one statement: the insert
    /// wins outright, or the update steals the row only when the
    /// existing lease has expired.
    async fn try_acquire(
        &self,
        conversation_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO conversation_locks (conversation_id, holder_token, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE
                SET holder_token = excluded.holder_token,
                    expires_at = excluded.expires_at
                WHERE conversation_locks.expires_at <= ?
            "#,
        )
        .bind(conversation_id)
        .bind(token)
        .bind(format_ts(expires_at))
        .bind(format_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew(
        &self,
        conversation_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversation_locks
            SET expires_at = ?
            WHERE conversation_id = ? AND holder_token = ?
            "#,
        )
        .bind(format_ts(expires_at))
        .bind(conversation_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, conversation_id: &str, token: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM conversation_locks
            WHERE conversation_id = ? AND holder_token = ?
            "#,
        )
        .bind(conversation_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn is_shared(&self) -> bool {
        true
    }
}

//! # SQLite
//!
//! Relational variant of the upvote store. One `upvotes` table whose compound primary key
//! `(github_id, proposal_slug)` carries the one-fact-per-pair invariant.
use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use tracing::info;

use crate::ledger::{StoreError, UpvoteFact, UpvoteStore};

const CREATE_UPVOTES: &str = "
    CREATE TABLE IF NOT EXISTS upvotes (
        github_id TEXT NOT NULL,
        github_login TEXT NOT NULL,
        proposal_slug TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (github_id, proposal_slug)
    )";

const CREATE_SLUG_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_upvotes_proposal_slug ON upvotes (proposal_slug)";

type UpvoteRow = (String, String, String, i64);

fn fact_from_row(
    (voter_id, voter_handle, proposal_slug, created_at): UpvoteRow,
) -> Result<UpvoteFact, StoreError> {
    Ok(UpvoteFact {
        voter_id,
        voter_handle,
        proposal_slug,
        created_at: DateTime::from_timestamp(created_at, 0)
            .ok_or(StoreError::InvalidTimestamp(created_at))?,
    })
}

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!("Opened SQLite upvote store at {path}");

        Self::with_pool(pool).await
    }

    /// Private database living as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // every connection would get its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        sqlx::query(CREATE_UPVOTES).execute(&pool).await?;
        sqlx::query(CREATE_SLUG_INDEX).execute(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl UpvoteStore for SqliteStore {
    async fn insert_if_absent(&self, fact: &UpvoteFact) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO upvotes (github_id, github_login, proposal_slug, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (github_id, proposal_slug) DO NOTHING",
        )
        .bind(&fact.voter_id)
        .bind(&fact.voter_handle)
        .bind(&fact.proposal_slug)
        .bind(fact.created_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_present(
        &self,
        voter_id: &str,
        proposal_slug: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM upvotes WHERE github_id = ? AND proposal_slug = ?")
            .bind(voter_id)
            .bind(proposal_slug)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn count(&self, proposal_slug: &str) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM upvotes WHERE proposal_slug = ?")
                .bind(proposal_slug)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    async fn scan_slug(&self, proposal_slug: &str) -> Result<Vec<UpvoteFact>, StoreError> {
        sqlx::query_as::<_, UpvoteRow>(
            "SELECT github_id, github_login, proposal_slug, created_at
             FROM upvotes WHERE proposal_slug = ?",
        )
        .bind(proposal_slug)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(fact_from_row)
        .collect()
    }

    async fn scan_all(&self) -> Result<Vec<UpvoteFact>, StoreError> {
        sqlx::query_as::<_, UpvoteRow>(
            "SELECT github_id, github_login, proposal_slug, created_at FROM upvotes",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(fact_from_row)
        .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(())
    }
}

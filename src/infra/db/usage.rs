use async_trait::async_trait;

use crate::{
    application::repos::{RepoError, UsageRepo},
    domain::quota::{UsageRecord, UsageSummary},
};

use super::util::{from_db_count, to_db_count};
use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct TotalsRow {
    total: i64,
    allowed: i64,
    tokens: i64,
}

#[derive(sqlx::FromRow)]
struct CountRow {
    name: String,
    requests: i64,
}

fn counts(rows: Vec<CountRow>) -> Result<Vec<(String, u64)>, RepoError> {
    rows.into_iter()
        .map(|row| Ok((row.name, from_db_count(row.requests)?)))
        .collect()
}

impl PostgresRepositories {
    async fn ranked_usage(
        &self,
        column: &'static str,
        since_ms: i64,
        limit: Option<i64>,
    ) -> Result<Vec<CountRow>, RepoError> {
        // `column` is always one of the fixed names passed by `summarize_usage`
        let sql = format!(
            r#"
            SELECT {column} AS name, COUNT(*)::BIGINT AS requests
            FROM usage_stats
            WHERE timestamp >= $1
            GROUP BY {column}
            ORDER BY requests DESC, name ASC
            LIMIT $2
            "#
        );

        sqlx::query_as::<_, CountRow>(&sql)
            .bind(since_ms)
            .bind(limit)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl UsageRepo for PostgresRepositories {
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO usage_stats (user_id, action, timestamp, tokens_consumed, tier, allowed, limited_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.subject_id)
        .bind(&record.action)
        .bind(record.timestamp_ms)
        .bind(to_db_count(record.tokens_consumed))
        .bind(&record.tier)
        .bind(record.allowed)
        .bind(record.limited_by.as_deref())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn summarize_usage(
        &self,
        since_ms: i64,
        top_n: usize,
    ) -> Result<UsageSummary, RepoError> {
        let totals = sqlx::query_as::<_, TotalsRow>(
            r#"
            SELECT
                COUNT(*)::BIGINT AS total,
                COALESCE(SUM(CASE WHEN allowed THEN 1 ELSE 0 END), 0)::BIGINT AS allowed,
                COALESCE(SUM(tokens_consumed), 0)::BIGINT AS tokens
            FROM usage_stats
            WHERE timestamp >= $1
            "#,
        )
        .bind(since_ms)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let top = Some(i64::try_from(top_n).unwrap_or(i64::MAX));
        let (subjects, actions, tiers) = tokio::try_join!(
            self.ranked_usage("user_id", since_ms, top),
            self.ranked_usage("action", since_ms, top),
            self.ranked_usage("tier", since_ms, None),
        )?;

        Ok(UsageSummary {
            total_requests: from_db_count(totals.total)?,
            allowed_requests: from_db_count(totals.allowed)?,
            tokens_consumed: from_db_count(totals.tokens)?,
            top_subjects: counts(subjects)?,
            top_actions: counts(actions)?,
            tier_distribution: counts(tiers)?.into_iter().collect(),
        })
    }

    async fn purge_usage_before(&self, cutoff_ms: i64) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM usage_stats WHERE timestamp < $1")
            .bind(cutoff_ms)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

use async_trait::async_trait;

use crate::{
    application::repos::{BucketsRepo, RepoError},
    domain::quota::BucketState,
};

use super::util::{from_db_count, to_db_count};
use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct BucketRow {
    identifier: String,
    action: String,
    tokens: i64,
    last_refill: i64,
    tier: String,
}

impl TryFrom<BucketRow> for BucketState {
    type Error = RepoError;

    fn try_from(row: BucketRow) -> Result<Self, Self::Error> {
        Ok(Self {
            identifier: row.identifier,
            action: row.action,
            tokens: from_db_count(row.tokens)?,
            last_refill_ms: row.last_refill,
            tier: row.tier,
        })
    }
}

#[async_trait]
impl BucketsRepo for PostgresRepositories {
    async fn load_bucket(
        &self,
        identifier: &str,
        action: &str,
    ) -> Result<Option<BucketState>, RepoError> {
        let row = sqlx::query_as::<_, BucketRow>(
            r#"
            SELECT identifier, action, tokens, last_refill, tier
            FROM rate_limits
            WHERE identifier = $1 AND action = $2
            "#,
        )
        .bind(identifier)
        .bind(action)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(BucketState::try_from).transpose()
    }

    async fn save_bucket(&self, bucket: &BucketState) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (identifier, action, tokens, last_refill, tier)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (identifier, action) DO UPDATE
            SET tokens = EXCLUDED.tokens,
                last_refill = EXCLUDED.last_refill,
                tier = EXCLUDED.tier
            "#,
        )
        .bind(&bucket.identifier)
        .bind(&bucket.action)
        .bind(to_db_count(bucket.tokens))
        .bind(bucket.last_refill_ms)
        .bind(&bucket.tier)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn delete_buckets(&self, identifier: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE identifier = $1")
            .bind(identifier)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_all_buckets(&self) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM rate_limits")
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

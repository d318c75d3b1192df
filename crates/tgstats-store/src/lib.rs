//! Postgres persistence for the Telegram Ads stats collector.
//!
//! The pipeline only sees the [`StoreGateway`] trait; [`PgStore`] is the
//! production implementation. Every write is a single `INSERT ... ON
//! CONFLICT` statement so the conflict-policy comparison cannot race with a
//! concurrent writer on the same key.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use tgstats_core::{CampaignRecord, ConflictPolicy, StatKind, StatRow, StatValues};

pub const CRATE_NAME: &str = "tgstats-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// The relational store as seen by the reconciler. Campaigns and stat rows
/// are only ever created or merged, never deleted.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn get_active_campaign_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn get_all_campaign_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn upsert_campaign(&self, record: &CampaignRecord) -> Result<(), StoreError>;
    async fn upsert_stat_rows(
        &self,
        kind: StatKind,
        rows: &[StatRow],
        policy: ConflictPolicy,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn upsert_views_row(&self, row: &StatRow, policy: ConflictPolicy) -> Result<(), StoreError> {
        let StatValues::Views(counters) = &row.values else {
            debug!(campaign_id = %row.campaign_id, "skipping non-views row in views upsert");
            return Ok(());
        };
        let sql = format!(
            "INSERT INTO views_stats (campaign_id, date, views, clicks, started_bot, collected_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (campaign_id, date) DO UPDATE SET \
               views = {views}, clicks = {clicks}, started_bot = {started_bot}, \
               collected_at = EXCLUDED.collected_at",
            views = counter_update(policy, "views_stats", "views"),
            clicks = counter_update(policy, "views_stats", "clicks"),
            started_bot = counter_update(policy, "views_stats", "started_bot"),
        );
        sqlx::query(&sql)
            .bind(&row.campaign_id)
            .bind(row.date)
            .bind(counters.views)
            .bind(counters.clicks)
            .bind(counters.started_bot)
            .bind(row.collected_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_budget_row(&self, row: &StatRow, policy: ConflictPolicy) -> Result<(), StoreError> {
        let StatValues::Budget { spent_budget } = &row.values else {
            debug!(campaign_id = %row.campaign_id, "skipping non-budget row in budget upsert");
            return Ok(());
        };
        // GREATEST ignores NULL operands, which is exactly the KeepMax rule:
        // larger value wins, non-null beats null, both null stays null.
        let spent = match policy {
            ConflictPolicy::Overwrite => "EXCLUDED.spent_budget".to_string(),
            ConflictPolicy::KeepMax => {
                "GREATEST(budget_stats.spent_budget, EXCLUDED.spent_budget)".to_string()
            }
        };
        let sql = format!(
            "INSERT INTO budget_stats (campaign_id, date, spent_budget, collected_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (campaign_id, date) DO UPDATE SET \
               spent_budget = {spent}, collected_at = EXCLUDED.collected_at",
        );
        sqlx::query(&sql)
            .bind(&row.campaign_id)
            .bind(row.date)
            .bind(*spent_budget)
            .bind(row.collected_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn counter_update(policy: ConflictPolicy, table: &str, column: &str) -> String {
    match policy {
        ConflictPolicy::Overwrite => format!("EXCLUDED.{column}"),
        ConflictPolicy::KeepMax => format!("GREATEST({table}.{column}, EXCLUDED.{column})"),
    }
}

#[async_trait]
impl StoreGateway for PgStore {
    async fn get_active_campaign_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT campaign_id FROM campaigns WHERE is_active = TRUE ORDER BY campaign_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_all_campaign_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT campaign_id FROM campaigns ORDER BY campaign_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn upsert_campaign(&self, record: &CampaignRecord) -> Result<(), StoreError> {
        // first_seen is intentionally absent from the update list: it is set
        // once on creation and preserved on every later scrape.
        sqlx::query(
            r#"
            INSERT INTO campaigns
              (campaign_id, title, description, bot_link, target_channel,
               cpm, views, is_active, last_status, first_seen, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (campaign_id) DO UPDATE SET
              title = EXCLUDED.title,
              description = EXCLUDED.description,
              bot_link = EXCLUDED.bot_link,
              target_channel = EXCLUDED.target_channel,
              cpm = EXCLUDED.cpm,
              views = EXCLUDED.views,
              is_active = EXCLUDED.is_active,
              last_status = EXCLUDED.last_status,
              last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(&record.campaign_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.bot_link)
        .bind(&record.target_channel)
        .bind(record.cpm)
        .bind(record.views)
        .bind(record.is_active)
        .bind(&record.last_status)
        .bind(record.first_seen)
        .bind(record.last_seen)
        .execute(&self.pool)
        .await?;
        debug!(campaign_id = %record.campaign_id, "campaign upserted");
        Ok(())
    }

    async fn upsert_stat_rows(
        &self,
        kind: StatKind,
        rows: &[StatRow],
        policy: ConflictPolicy,
    ) -> Result<(), StoreError> {
        for row in rows {
            match kind {
                StatKind::Views => self.upsert_views_row(row, policy).await?,
                StatKind::Budget => self.upsert_budget_row(row, policy).await?,
            }
        }
        debug!(kind = %kind, rows = rows.len(), "stat rows upserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_update_sql_matches_policy() {
        assert_eq!(
            counter_update(ConflictPolicy::Overwrite, "views_stats", "views"),
            "EXCLUDED.views"
        );
        assert_eq!(
            counter_update(ConflictPolicy::KeepMax, "views_stats", "clicks"),
            "GREATEST(views_stats.clicks, EXCLUDED.clicks)"
        );
    }
}

//! Core domain model and merge rules for the Telegram Ads stats collector.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tgstats-core";

/// Canonical base URL of the source platform. Export links embedded in page
/// scripts are relative to this.
pub const ADS_BASE_URL: &str = "https://ads.telegram.org";

/// A category of time-series data with its own export file and merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Views,
    Budget,
}

impl StatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatKind::Views => "views",
            StatKind::Budget => "budget",
        }
    }

    /// The merge rule applied when a new scrape collides with a stored row
    /// for the same `(campaign_id, date)` key. Daily view/click counters are
    /// stable once the source reports them, so the newest pull wins. Spent
    /// budget is reported with latency and corrected upward on later pulls,
    /// so the maximum observed value is kept.
    pub fn conflict_policy(self) -> ConflictPolicy {
        match self {
            StatKind::Views => ConflictPolicy::Overwrite,
            StatKind::Budget => ConflictPolicy::KeepMax,
        }
    }
}

impl std::fmt::Display for StatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The incoming value replaces the stored one unconditionally.
    Overwrite,
    /// The stored value is replaced only if the incoming one is larger;
    /// a non-null side always beats a null side.
    KeepMax,
}

impl ConflictPolicy {
    pub fn merge_counter(self, existing: i64, incoming: i64) -> i64 {
        match self {
            ConflictPolicy::Overwrite => incoming,
            ConflictPolicy::KeepMax => existing.max(incoming),
        }
    }

    pub fn merge_amount(self, existing: Option<f64>, incoming: Option<f64>) -> Option<f64> {
        match self {
            ConflictPolicy::Overwrite => incoming,
            ConflictPolicy::KeepMax => match (existing, incoming) {
                (Some(old), Some(new)) => Some(if new > old { new } else { old }),
                (None, new @ Some(_)) => new,
                (old, None) => old,
            },
        }
    }
}

/// Metadata scraped from one stats-share page. Title is the mandatory
/// anchor; everything else degrades to empty/None when the page omits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignMetadata {
    pub campaign_id: String,
    pub title: String,
    pub description: Option<String>,
    pub bot_link: Option<String>,
    /// Target channel names in page order, with the "Will be shown in"
    /// lead-in already stripped.
    pub target_channel: Vec<String>,
    pub last_status: Option<String>,
    pub is_active: bool,
    pub cpm: Option<f64>,
    pub views: Option<i64>,
}

/// Persisted campaign row. `first_seen` is set once on creation and never
/// touched again; `last_seen` advances on every successful scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub campaign_id: String,
    pub title: String,
    pub description: Option<String>,
    pub bot_link: Option<String>,
    pub target_channel: Vec<String>,
    pub cpm: Option<f64>,
    pub views: Option<i64>,
    pub is_active: bool,
    pub last_status: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl CampaignRecord {
    /// Build the record for one scrape. The store preserves an existing
    /// `first_seen` on conflict, so both timestamps carry the scrape time.
    pub fn from_metadata(metadata: CampaignMetadata, scraped_at: DateTime<Utc>) -> Self {
        Self {
            campaign_id: metadata.campaign_id,
            title: metadata.title,
            description: metadata.description,
            bot_link: metadata.bot_link,
            target_channel: metadata.target_channel,
            cpm: metadata.cpm,
            views: metadata.views,
            is_active: metadata.is_active,
            last_status: metadata.last_status,
            first_seen: scraped_at,
            last_seen: scraped_at,
        }
    }
}

/// Daily view/click/bot-start counters. An absent column in the export means
/// "no activity that day", hence plain zeros rather than options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewsCounters {
    pub views: i64,
    pub clicks: i64,
    pub started_bot: i64,
}

/// Kind-specific payload of one statistic row. A missing budget amount means
/// "value unknown", which the KeepMax policy treats differently from zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StatValues {
    Views(ViewsCounters),
    Budget { spent_budget: Option<f64> },
}

impl StatValues {
    pub fn kind(&self) -> StatKind {
        match self {
            StatValues::Views(_) => StatKind::Views,
            StatValues::Budget { .. } => StatKind::Budget,
        }
    }
}

/// One dated statistic row. `(campaign_id, date)` is the logical key within
/// a kind; `collected_at` is ingestion wall-clock time, distinct from the
/// statistic's business date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRow {
    pub campaign_id: String,
    pub date: NaiveDate,
    pub collected_at: DateTime<Utc>,
    pub values: StatValues,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_counters_take_the_newest_pull() {
        let policy = StatKind::Views.conflict_policy();
        assert_eq!(policy.merge_counter(100, 80), 80);
        assert_eq!(policy.merge_counter(80, 100), 100);
    }

    #[test]
    fn budget_keeps_the_maximum_observed() {
        let policy = StatKind::Budget.conflict_policy();
        assert_eq!(policy.merge_amount(Some(10.0), Some(8.0)), Some(10.0));
        assert_eq!(policy.merge_amount(Some(10.0), Some(15.0)), Some(15.0));
    }

    #[test]
    fn budget_non_null_side_wins() {
        let policy = ConflictPolicy::KeepMax;
        assert_eq!(policy.merge_amount(None, Some(5.0)), Some(5.0));
        assert_eq!(policy.merge_amount(Some(5.0), None), Some(5.0));
        assert_eq!(policy.merge_amount(None, None), None);
    }

    #[test]
    fn equal_budget_values_are_a_no_op() {
        let policy = ConflictPolicy::KeepMax;
        assert_eq!(policy.merge_amount(Some(7.5), Some(7.5)), Some(7.5));
    }

    #[test]
    fn record_from_metadata_stamps_both_timestamps() {
        let metadata = CampaignMetadata {
            campaign_id: "T7joQFHQxN7zs7Az".into(),
            title: "Dietary Bot".into(),
            description: None,
            bot_link: Some("https://t.me/dietary_bot".into()),
            target_channel: vec!["@healthnews".into()],
            last_status: Some("Active".into()),
            is_active: true,
            cpm: Some(0.2),
            views: Some(1200),
        };
        let now = Utc::now();
        let record = CampaignRecord::from_metadata(metadata, now);
        assert_eq!(record.first_seen, now);
        assert_eq!(record.last_seen, now);
        assert_eq!(record.campaign_id, "T7joQFHQxN7zs7Az");
    }
}

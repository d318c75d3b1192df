//! Stats-page fetching and parsing for the Telegram Ads collector.
//!
//! Everything that touches the unstable page layout lives here: the HTML
//! metadata extraction, the `csvExport` script-literal heuristic, and the
//! tab-separated export parser. Downstream crates only see typed values.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

use tgstats_core::{
    CampaignMetadata, StatKind, StatRow, StatValues, ViewsCounters, ADS_BASE_URL,
};

pub const CRATE_NAME: &str = "tgstats-scrape";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("empty response body for {url}")]
    EmptyBody { url: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("stats page for {campaign_id} has no campaign title anchor")]
    MissingTitle { campaign_id: String },
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("export is not tabular data: {0}")]
    NotTabular(String),
    #[error("export header has no date column")]
    MissingDateColumn,
}

/// Abstraction over the source platform so the pipeline can be driven by a
/// scripted double in tests. `AdsClient` is the production implementation.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch_stats_page(&self, campaign_id: &str) -> Result<String, FetchError>;
    async fn fetch_export(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Opaque session cookie supplied by the operator, passed through
    /// unmodified. The collector never performs the auth flow itself.
    pub session_cookie: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: ADS_BASE_URL.to_string(),
            session_cookie: String::new(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// HTTP client for the stats-share pages and their CSV exports. One GET per
/// call, bounded by the configured timeout; retry policy belongs to callers.
#[derive(Debug)]
pub struct AdsClient {
    client: reqwest::Client,
    base_url: String,
}

impl AdsClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if !config.session_cookie.is_empty() {
            let cookie = HeaderValue::from_str(&config.session_cookie)
                .context("session cookie is not a valid header value")?;
            headers.insert(COOKIE, cookie);
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, url: String) -> Result<String, FetchError> {
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody { url: final_url });
        }
        Ok(body)
    }
}

#[async_trait]
impl StatsSource for AdsClient {
    async fn fetch_stats_page(&self, campaign_id: &str) -> Result<String, FetchError> {
        self.get_text(format!("{}/stats/{campaign_id}", self.base_url))
            .await
    }

    async fn fetch_export(&self, url: &str) -> Result<String, FetchError> {
        let absolute = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.base_url, url)
        };
        self.get_text(absolute).await
    }
}

/// Everything one stats page yields: the metadata record plus a map from
/// statistic kind to the signed export URL found in page scripts. The map
/// may be empty (campaign with no stats yet).
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtract {
    pub metadata: CampaignMetadata,
    pub exports: BTreeMap<StatKind, String>,
}

const CHANNEL_PREFIX: &str = "Will be shown in";

/// Parse a stats-share page. The title is the only mandatory anchor; a page
/// without it is rejected as structurally unexpected rather than silently
/// yielding a partial record.
pub fn extract_campaign_page(campaign_id: &str, html: &str) -> Result<PageExtract, ParseError> {
    let doc = Html::parse_document(html);

    let title = select_first_text(&doc, "div.ad-msg-link-preview-title")?.ok_or_else(|| {
        ParseError::MissingTitle {
            campaign_id: campaign_id.to_string(),
        }
    })?;
    let description = select_first_text(&doc, "div.ad-msg-link-preview-desc")?;
    let bot_link = select_bot_link(&doc)?;
    let target_channel = select_first_text(&doc, "div.pr-form-info-block.plus")?
        .map(|text| parse_target_channels(&text))
        .unwrap_or_default();

    let last_status = labeled_value(&doc, "Status")?;
    let is_active = last_status
        .as_deref()
        .map(|s| !s.eq_ignore_ascii_case("on hold"))
        .unwrap_or(false);
    let cpm = labeled_value(&doc, "CPM")?.as_deref().and_then(parse_decimal);
    let views = labeled_value(&doc, "Views")?.as_deref().and_then(parse_integer);

    let exports = extract_export_refs(&doc)?;

    Ok(PageExtract {
        metadata: CampaignMetadata {
            campaign_id: campaign_id.to_string(),
            title,
            description,
            bot_link,
            target_channel,
            last_status,
            is_active,
            cpm,
            views,
        },
        exports,
    })
}

fn selector(input: &str) -> Result<Selector, ParseError> {
    Selector::parse(input).map_err(|e| ParseError::Selector(e.to_string()))
}

fn normalize_ws(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let normalized = normalize_ws(&value);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn select_first_text(doc: &Html, sel: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(sel)?;
    Ok(doc
        .select(&sel)
        .next()
        .and_then(|el| text_or_none(el.text().collect::<String>())))
}

fn select_bot_link(doc: &Html) -> Result<Option<String>, ParseError> {
    let sel = selector("a[href]")?;
    Ok(doc
        .select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .find(|href| href.contains("t.me"))
        .map(ToString::to_string))
}

/// Find the element whose entire text is `label` and return the text of its
/// next sibling element. The page renders aggregates as label/value pairs of
/// adjacent nodes; there is no stable class to select on.
fn labeled_value(doc: &Html, label: &str) -> Result<Option<String>, ParseError> {
    let sel = selector("body *")?;
    for el in doc.select(&sel) {
        if normalize_ws(&el.text().collect::<String>()) != label {
            continue;
        }
        let value = el
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .next()
            .and_then(|sibling| text_or_none(sibling.text().collect::<String>()));
        return Ok(value);
    }
    Ok(None)
}

fn parse_target_channels(text: &str) -> Vec<String> {
    let remainder = text
        .strip_prefix(CHANNEL_PREFIX)
        .map(str::trim_start)
        .unwrap_or(text);
    remainder
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Lenient numeric parse for the aggregate CPM block ("0,2 TON" and the
/// like): keep digit/separator characters, accept a comma decimal point.
fn parse_decimal(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    cleaned.replace(',', ".").parse().ok()
}

/// Lenient integer parse for the aggregate views block ("1 234" etc.).
fn parse_integer(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Scan embedded script text for `"csvExport":"..."` literals and classify
/// each by the "budget" keyword. This is an undocumented contract with the
/// source platform; keeping the heuristic behind this one function means a
/// layout change only ever touches this file.
fn extract_export_refs(doc: &Html) -> Result<BTreeMap<StatKind, String>, ParseError> {
    let sel = selector("script")?;
    let mut refs = BTreeMap::new();
    for script in doc.select(&sel) {
        let text: String = script.text().collect();
        let Some(url) = export_url_in_script(&text) else {
            continue;
        };
        let kind = if text.contains("budget") {
            StatKind::Budget
        } else {
            StatKind::Views
        };
        refs.insert(kind, url);
    }
    Ok(refs)
}

fn export_url_in_script(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("csvExport\":\"")?;
    let (raw, _) = rest.split_once('"')?;
    Some(raw.replace("\\/", "/"))
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d %b %Y", "%b %d, %Y"];

fn parse_stat_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.date())
}

/// Counter cell: absent or non-numeric means no recorded activity that day.
fn parse_counter(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else { return 0 };
    let cleaned: String = raw.chars().filter(|c| !matches!(c, ' ' | ',')).collect();
    cleaned.parse().unwrap_or(0)
}

/// Budget cell: absent or non-numeric means the value is unknown, which the
/// KeepMax policy must distinguish from zero. Comma decimals accepted.
fn parse_amount(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    raw.replace(',', ".").parse().ok()
}

/// Parse one tab-separated export into dated rows. Rows with unparseable
/// dates are dropped with a warning; only a structurally invalid document
/// (empty body, header without a date column) is an error. A header with
/// zero data rows is an empty result, not a failure.
pub fn parse_export(
    kind: StatKind,
    campaign_id: &str,
    body: &str,
    collected_at: DateTime<Utc>,
) -> Result<Vec<StatRow>, ParseError> {
    if body.trim().is_empty() {
        return Err(ParseError::NotTabular("empty export body".to_string()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParseError::NotTabular(e.to_string()))?
        .clone();
    let date_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("date"))
        .ok_or(ParseError::MissingDateColumn)?;

    let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let views_idx = column("Views");
    let clicks_idx = column("Clicks");
    let started_bot_idx = column("Started bot");
    // The budget export names its column with the currency ("Spent budget, TON").
    let budget_idx = headers.iter().position(|h| {
        h.to_ascii_lowercase().starts_with("spent budget") || h.eq_ignore_ascii_case("spent_budget")
    });

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(campaign_id, kind = %kind, error = %err, "skipping malformed export row");
                continue;
            }
        };

        let raw_date = record.get(date_idx).unwrap_or_default();
        let Some(date) = parse_stat_date(raw_date) else {
            warn!(campaign_id, kind = %kind, raw_date, "dropping export row with unparseable date");
            continue;
        };

        let values = match kind {
            StatKind::Views => StatValues::Views(ViewsCounters {
                views: parse_counter(views_idx.and_then(|i| record.get(i))),
                clicks: parse_counter(clicks_idx.and_then(|i| record.get(i))),
                started_bot: parse_counter(started_bot_idx.and_then(|i| record.get(i))),
            }),
            StatKind::Budget => StatValues::Budget {
                spent_budget: parse_amount(budget_idx.and_then(|i| record.get(i))),
            },
        };

        rows.push(StatRow {
            campaign_id: campaign_id.to_string(),
            date,
            collected_at,
            values,
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAMPAIGN_ID: &str = "T7joQFHQxN7zs7Az";

    const STATS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Ad Statistics</title></head>
<body>
  <div class="ad-msg-link-preview-title">
    Dietary
    Bot
  </div>
  <div class="ad-msg-link-preview-desc">Personalized meal plans in Telegram.</div>
  <a href="https://t.me/dietary_bot">@dietary_bot</a>
  <div class="pr-form-info-block plus">Will be shown in @healthnews, @fitness_daily</div>
  <section class="pr-form-info">
    <span>Status</span><span>Active</span>
    <span>CPM</span><span>0,2 TON</span>
    <span>Views</span><span>1 234</span>
  </section>
  <script>var viewsChart = {"csvExport":"\/stats\/T7joQFHQxN7zs7Az\/views.csv?sig=abc"};</script>
  <script>var budgetChart = {"csvExport":"\/stats\/T7joQFHQxN7zs7Az\/budget.csv?sig=def"};</script>
</body>
</html>"#;

    fn extract(html: &str) -> PageExtract {
        extract_campaign_page(CAMPAIGN_ID, html).expect("extraction should succeed")
    }

    #[test]
    fn title_is_extracted_verbatim_after_whitespace_normalization() {
        let page = extract(STATS_PAGE);
        assert_eq!(page.metadata.title, "Dietary Bot");
        assert_eq!(
            page.metadata.description.as_deref(),
            Some("Personalized meal plans in Telegram.")
        );
        assert_eq!(
            page.metadata.bot_link.as_deref(),
            Some("https://t.me/dietary_bot")
        );
    }

    #[test]
    fn missing_title_anchor_is_a_parse_error() {
        let html = "<html><body><div class=\"pr-form-info-block plus\">@x</div></body></html>";
        let err = extract_campaign_page(CAMPAIGN_ID, html).unwrap_err();
        assert!(matches!(err, ParseError::MissingTitle { .. }));
    }

    #[test]
    fn channel_prefix_is_stripped_when_present() {
        let page = extract(STATS_PAGE);
        assert_eq!(page.metadata.target_channel, vec!["@healthnews", "@fitness_daily"]);
    }

    #[test]
    fn channels_without_prefix_are_preserved_unchanged() {
        let html = STATS_PAGE.replace("Will be shown in @healthnews, @fitness_daily", "@solo_channel");
        let page = extract(&html);
        assert_eq!(page.metadata.target_channel, vec!["@solo_channel"]);
    }

    #[test]
    fn status_and_aggregates_come_from_labeled_pairs() {
        let page = extract(STATS_PAGE);
        assert_eq!(page.metadata.last_status.as_deref(), Some("Active"));
        assert!(page.metadata.is_active);
        assert_eq!(page.metadata.cpm, Some(0.2));
        assert_eq!(page.metadata.views, Some(1234));
    }

    #[test]
    fn on_hold_status_marks_campaign_inactive() {
        let html = STATS_PAGE.replace("<span>Active</span>", "<span>On hold</span>");
        let page = extract(&html);
        assert_eq!(page.metadata.last_status.as_deref(), Some("On hold"));
        assert!(!page.metadata.is_active);
    }

    #[test]
    fn export_refs_are_classified_and_unescaped() {
        let page = extract(STATS_PAGE);
        assert_eq!(
            page.exports.get(&StatKind::Views).map(String::as_str),
            Some("/stats/T7joQFHQxN7zs7Az/views.csv?sig=abc")
        );
        assert_eq!(
            page.exports.get(&StatKind::Budget).map(String::as_str),
            Some("/stats/T7joQFHQxN7zs7Az/budget.csv?sig=def")
        );
    }

    #[test]
    fn page_without_export_scripts_still_extracts_metadata() {
        let html = STATS_PAGE
            .lines()
            .filter(|line| !line.contains("csvExport"))
            .collect::<Vec<_>>()
            .join("\n");
        let page = extract(&html);
        assert!(page.exports.is_empty());
        assert_eq!(page.metadata.title, "Dietary Bot");
    }

    #[test]
    fn views_export_rows_parse_with_all_counters() {
        let body = "date\tViews\tClicks\tStarted bot\n\
                    2024-03-01\t100\t5\t2\n\
                    2024-03-02\t80\t3\t1\n";
        let rows = parse_export(StatKind::Views, CAMPAIGN_ID, body, Utc::now()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(
            rows[0].values,
            StatValues::Views(ViewsCounters {
                views: 100,
                clicks: 5,
                started_bot: 2
            })
        );
    }

    #[test]
    fn absent_counter_columns_default_to_zero() {
        let body = "date\tViews\n2024-03-01\t42\n";
        let rows = parse_export(StatKind::Views, CAMPAIGN_ID, body, Utc::now()).unwrap();
        assert_eq!(
            rows[0].values,
            StatValues::Views(ViewsCounters {
                views: 42,
                clicks: 0,
                started_bot: 0
            })
        );
    }

    #[test]
    fn budget_export_accepts_currency_column_and_comma_decimals() {
        let body = "date\tSpent budget, TON\n2024-03-01\t1,25\n2024-03-02\t2.5\n";
        let rows = parse_export(StatKind::Budget, CAMPAIGN_ID, body, Utc::now()).unwrap();
        assert_eq!(rows[0].values, StatValues::Budget { spent_budget: Some(1.25) });
        assert_eq!(rows[1].values, StatValues::Budget { spent_budget: Some(2.5) });
    }

    #[test]
    fn blank_budget_cell_is_null_not_zero() {
        let body = "date\tSpent budget, TON\n2024-03-01\t\n";
        let rows = parse_export(StatKind::Budget, CAMPAIGN_ID, body, Utc::now()).unwrap();
        assert_eq!(rows[0].values, StatValues::Budget { spent_budget: None });
    }

    #[test]
    fn rows_with_unparseable_dates_are_dropped_not_fatal() {
        let body = "date\tViews\nnot-a-date\t9\n2024-03-02\t7\n";
        let rows = parse_export(StatKind::Views, CAMPAIGN_ID, body, Utc::now()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
    }

    #[test]
    fn header_only_export_yields_empty_rows() {
        let body = "date\tViews\tClicks\tStarted bot\n";
        let rows = parse_export(StatKind::Views, CAMPAIGN_ID, body, Utc::now()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn empty_body_is_a_parse_error() {
        let err = parse_export(StatKind::Views, CAMPAIGN_ID, "  \n ", Utc::now()).unwrap_err();
        assert!(matches!(err, ParseError::NotTabular(_)));
    }

    #[test]
    fn header_without_date_column_is_a_parse_error() {
        let err = parse_export(StatKind::Views, CAMPAIGN_ID, "Views\tClicks\n1\t2\n", Utc::now())
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingDateColumn));
    }

    #[test]
    fn export_url_extraction_handles_escaped_slashes() {
        let script = r#"var chart = {"period":"day","csvExport":"\/stats\/abc\/views.csv?sig=s"};"#;
        assert_eq!(
            export_url_in_script(script).as_deref(),
            Some("/stats/abc/views.csv?sig=s")
        );
        assert_eq!(export_url_in_script("var x = 1;"), None);
    }
}

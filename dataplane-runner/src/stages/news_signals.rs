//! dp5: news signals for the day's top movers.
//!
//! Triggers are the first [`MAX_TRIGGERS`] tickers of the published
//! top-movers pulse. A "high" volatility market-health pulse raises the
//! planned call count. Missing triggers, a missing secret, a blocked budget
//! or fetch failures all publish a degraded (possibly empty) signal file
//! instead of failing the stage.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

use dataplane_core::artifact::{enforce_build_limits, Manifest};
use dataplane_core::hashing::sha256_hex;
use dataplane_core::health::{HealthStatus, StageHealthEntry};
use dataplane_core::lineage::{build_lineage, Lineage};
use dataplane_core::lock::LockKey;
use dataplane_core::store;
use dataplane_core::RunContext;

use super::MANIFEST_SCHEMA;
use crate::providers::ProviderRequest;
use crate::runner::{Stage, StageContext, StageError, StageReport};

pub const STAGE_ID: &str = "dp5_news";
pub const NEWS_DIR: &str = "public/data/v3/news";
pub const SIGNALS_PATH: &str = "public/data/v3/news/signals/latest.json";
pub const MANIFEST_PATH: &str = "public/data/v3/news/manifest.json";
pub const TOP_MOVERS_PATH: &str = "public/data/v3/pulse/top-movers/latest.json";
pub const MARKET_HEALTH_PATH: &str = "public/data/v3/pulse/market-health/latest.json";
pub const SIGNALS_SCHEMA: &str = "rv.news.v2";

pub const MAX_TRIGGERS: usize = 6;
pub const MAX_SIGNALS: usize = 60;
/// Articles requested per trigger.
pub const ARTICLES_PER_TICKER: u32 = 5;
const HIGH_VOLATILITY_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Ok,
    Degraded,
}

/// One normalized headline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsSignal {
    pub id: String,
    pub ticker: String,
    pub headline: String,
    pub published_at: String,
    pub url: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalsMeta {
    pub schema: String,
    pub generated_at: String,
    pub run_id: String,
    pub commit: String,
    pub status: SignalStatus,
    pub reason: Option<String>,
    pub lineage: Lineage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalsDocument {
    pub meta: SignalsMeta,
    pub errors: Vec<String>,
    pub signals: Vec<NewsSignal>,
}

fn text(row: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| row.get(*k)?.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Normalize one provider article; rows without a headline are dropped.
pub fn normalize_article(ticker: &str, row: &Value) -> Option<NewsSignal> {
    let headline = text(row, &["title", "headline"])?;
    let published_at = text(row, &["date", "publishedAt"]).unwrap_or_default();
    Some(NewsSignal {
        id: sha256_hex(format!("{headline}|{published_at}").as_bytes()),
        ticker: ticker.to_string(),
        headline,
        published_at,
        url: text(row, &["link", "url"]),
        source: text(row, &["source"]).unwrap_or_else(|| "eodhd".to_string()),
    })
}

/// Deduplicate on id, newest first, capped at [`MAX_SIGNALS`].
pub fn rank_signals(signals: Vec<NewsSignal>) -> Vec<NewsSignal> {
    let mut unique: BTreeMap<String, NewsSignal> = BTreeMap::new();
    for signal in signals {
        unique.entry(signal.id.clone()).or_insert(signal);
    }
    let mut ranked: Vec<NewsSignal> = unique.into_values().collect();
    ranked.sort_by(|a, b| b.published_at.cmp(&a.published_at).then_with(|| a.id.cmp(&b.id)));
    ranked.truncate(MAX_SIGNALS);
    ranked
}

/// Planned calls for `triggers` tickers under the given volatility state.
pub fn planned_calls(triggers: usize, volatility_state: Option<&str>) -> u64 {
    let multiplier = if volatility_state == Some("high") {
        HIGH_VOLATILITY_MULTIPLIER
    } else {
        1.0
    };
    (triggers as f64 * multiplier).ceil() as u64
}

fn load_triggers(run: &RunContext) -> Vec<String> {
    let doc: Option<Value> = store::read_json_lenient(&run.resolve(TOP_MOVERS_PATH));
    doc.as_ref()
        .and_then(|d| d.get("top_movers"))
        .and_then(Value::as_array)
        .map(|movers| {
            movers
                .iter()
                .filter_map(|m| text(m, &["ticker"]))
                .take(MAX_TRIGGERS)
                .collect()
        })
        .unwrap_or_default()
}

fn load_volatility(run: &RunContext) -> Option<String> {
    let doc: Value = store::read_json_lenient(&run.resolve(MARKET_HEALTH_PATH))?;
    text(&doc, &["volatility_state"])
}

/// dp5 stage.
#[derive(Debug, Clone, Default)]
pub struct NewsSignals;

impl Stage for NewsSignals {
    fn id(&self) -> &'static str {
        STAGE_ID
    }

    fn lock_key(&self, run: &RunContext) -> LockKey {
        LockKey::new("eodhd", "news", run.as_of_date())
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageReport, StageError> {
        let triggers = load_triggers(ctx.run);
        let volatility = load_volatility(ctx.run);
        let planned = planned_calls(triggers.len(), volatility.as_deref());
        info!(triggers = triggers.len(), planned, volatility = ?volatility, "dp5 started");

        let mut reason: Option<String> = None;
        if triggers.is_empty() {
            reason = Some("NO_EVENT_TRIGGER".to_string());
        } else if !ctx.providers.has_secret("eodhd") {
            reason = Some("MISSING_SECRET:EODHD_API_KEY".to_string());
        } else if let Err(e) = ctx.providers.assert_budget(planned) {
            warn!(error = %e, "news budget guard blocked the run");
            reason = Some(format!("BUDGET_GUARD_BLOCKED:{e}"));
        }

        let mut collected = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        if reason.is_none() {
            for ticker in &triggers {
                let request = ProviderRequest::EodhdNews {
                    symbol: format!("{ticker}.US"),
                    limit: ARTICLES_PER_TICKER,
                };
                match ctx.providers.call_json::<Vec<Value>>(&request) {
                    Ok(rows) => collected.extend(rows.iter().filter_map(|r| normalize_article(ticker, r))),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) if e.is_unavailable() => {
                        errors.push(format!("{ticker}:{e}"));
                        break;
                    }
                    Err(e) => {
                        warn!(ticker = %ticker, error = %e, "news fetch failed");
                        errors.push(format!("{ticker}:{e}"));
                    }
                }
            }
            if let Some(first) = errors.first() {
                reason = Some(format!("PROVIDER_FETCH_FAILED:{first}"));
            }
        }

        let signals = rank_signals(collected);
        let status = if reason.is_some() {
            SignalStatus::Degraded
        } else {
            SignalStatus::Ok
        };

        let mut extra = Map::new();
        extra.insert("triggers".to_string(), json!(triggers));
        let lineage = build_lineage(ctx.root(), &[TOP_MOVERS_PATH, MARKET_HEALTH_PATH], extra);
        let document = SignalsDocument {
            meta: SignalsMeta {
                schema: SIGNALS_SCHEMA.to_string(),
                generated_at: ctx.run.generated_at_iso(),
                run_id: ctx.run.run_id.clone(),
                commit: ctx.run.commit.clone(),
                status,
                reason: reason.clone(),
                lineage,
            },
            errors,
            signals,
        };
        ctx.artifacts.write_json(SIGNALS_PATH, &document)?;

        let status_text = match status {
            SignalStatus::Ok => "ok",
            SignalStatus::Degraded => "degraded",
        };
        let manifest = Manifest::builder(MANIFEST_SCHEMA, ctx.run)
            .quality("status", status_text)
            .quality("reason", reason.clone())
            .quality("planned_calls", planned)
            .quality("emitted_signals", document.signals.len())
            .lineage(json!({ "source_count": 2, "triggers": triggers.len() }))
            .build(ctx.artifacts.written());
        ctx.artifacts.write_manifest(MANIFEST_PATH, &manifest)?;
        enforce_build_limits(ctx.root(), NEWS_DIR, &ctx.policies.build)?;

        let degraded = status == SignalStatus::Degraded;
        let mut health = StageHealthEntry::new(
            if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            ctx.run,
        );
        health.partial = degraded;
        health.stale = degraded;
        health.coverage = json!({ "signals": document.signals.len(), "triggers": triggers.len() });
        health.manifest = Some(MANIFEST_PATH.to_string());
        health.reason = reason;

        Ok(StageReport {
            summary: format!("DP5 done status={status_text} signals={}", document.signals.len()),
            health,
        })
    }
}

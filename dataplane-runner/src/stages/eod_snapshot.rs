//! dp1: end-of-day snapshot for one exchange and trading date.
//!
//! Each mapped symbol takes its bar from the local mirror when one exists
//! for the trading date, else from eodhd, else from tiingo. Bars failing
//! the schema check are dropped and replaced by the last published row for
//! that symbol when the errors policy says so.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use dataplane_core::artifact::{enforce_build_limits, Manifest};
use dataplane_core::health::{HealthStatus, StageHealthEntry};
use dataplane_core::lock::LockKey;
use dataplane_core::taxonomy::{Action, Classification};
use dataplane_core::RunContext;
use serde_json::json;

use super::{coverage_ratio, read_last_good, MANIFEST_SCHEMA};
use crate::providers::{ProviderCallError, ProviderRequest};
use crate::runner::{Stage, StageContext, StageError, StageReport};
use crate::universe::{load_local_bars, Universe, UniverseEntry};

pub const STAGE_ID: &str = "dp1_eod";
pub const RAW_SCHEMA: &str = "rv.eod.raw.v1";

/// Latest weekday on or before `as_of`.
pub fn default_trading_date(as_of: NaiveDate) -> NaiveDate {
    let back = match as_of.weekday() {
        Weekday::Sat => 1,
        Weekday::Sun => 2,
        _ => 0,
    };
    as_of.checked_sub_days(Days::new(back)).unwrap_or(as_of)
}

/// One published end-of-day row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EodRecord {
    pub canonical_id: String,
    pub ticker: String,
    pub exchange: String,
    #[serde(default)]
    pub currency: Option<String>,
    pub trading_date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjusted_close: f64,
    pub volume: u64,
    pub dividend: f64,
    pub split: f64,
    pub provider: String,
    /// Carried over from the previous publish.
    #[serde(default)]
    pub last_good: bool,
}

/// Row shape shared by the eodhd `eod` and tiingo `daily` endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
struct ProviderBar {
    #[serde(alias = "formatted_date")]
    date: Option<String>,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    #[serde(alias = "adjusted_close", alias = "adjClose")]
    adj_close: Option<f64>,
    volume: Option<f64>,
    #[serde(alias = "divCash")]
    dividend: Option<f64>,
    #[serde(alias = "splitFactor")]
    split: Option<f64>,
}

/// A bar before validation.
#[derive(Debug, Clone, PartialEq)]
struct Bar {
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    adj_close: f64,
    volume: f64,
    dividend: f64,
    split: f64,
}

impl Bar {
    fn from_provider(row: &ProviderBar, trading_date: NaiveDate) -> Self {
        let date = match row.date.as_deref() {
            Some(d) => d.get(..10).unwrap_or(d).to_string(),
            None => trading_date.format("%Y-%m-%d").to_string(),
        };
        let close = row.close.unwrap_or(f64::NAN);
        Self {
            date,
            open: row.open.unwrap_or(f64::NAN),
            high: row.high.unwrap_or(f64::NAN),
            low: row.low.unwrap_or(f64::NAN),
            close,
            adj_close: row.adj_close.unwrap_or(close),
            volume: row.volume.unwrap_or(0.0),
            dividend: row.dividend.unwrap_or(0.0),
            split: row.split.unwrap_or(1.0),
        }
    }

    fn local(root: &std::path::Path, ticker: &str, trading_date: NaiveDate) -> Option<Self> {
        let bar = load_local_bars(root, ticker)
            .into_iter()
            .find(|b| b.trading_date() == Some(trading_date))?;
        let open = bar.open.unwrap_or(bar.close);
        Some(Self {
            open,
            high: bar.high.unwrap_or(open.max(bar.close)),
            low: bar.low.unwrap_or(open.min(bar.close)),
            close: bar.close,
            adj_close: bar.adj_close.unwrap_or(bar.close),
            volume: bar.volume.unwrap_or(0.0),
            dividend: 0.0,
            split: 1.0,
            date: bar.date,
        })
    }

    /// Schema check: parsable date, finite positive prices inside the
    /// high/low range, non-negative volume and dividend, positive split.
    fn validate(&self) -> Result<(), String> {
        if NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").is_err() {
            return Err(format!("bad date {:?}", self.date));
        }
        let prices = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("adjusted_close", self.adj_close),
        ];
        if let Some((name, value)) = prices.iter().find(|(_, v)| !v.is_finite() || *v <= 0.0) {
            return Err(format!("{name}={value}"));
        }
        if self.high < self.low {
            return Err(format!("high {} < low {}", self.high, self.low));
        }
        if self.open > self.high || self.open < self.low || self.close > self.high || self.close < self.low {
            return Err("open/close outside high-low range".to_string());
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(format!("volume={}", self.volume));
        }
        if !self.dividend.is_finite() || self.dividend < 0.0 {
            return Err(format!("dividend={}", self.dividend));
        }
        if !self.split.is_finite() || self.split <= 0.0 {
            return Err(format!("split={}", self.split));
        }
        Ok(())
    }

    fn into_record(self, entry: &UniverseEntry, provider: &str) -> EodRecord {
        EodRecord {
            canonical_id: entry.canonical_id.clone(),
            ticker: entry.ticker.clone(),
            exchange: entry.exchange.clone(),
            currency: entry.currency.clone(),
            trading_date: self.date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            adjusted_close: self.adj_close,
            volume: self.volume.round() as u64,
            dividend: self.dividend,
            split: self.split,
            provider: provider.to_string(),
            last_good: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ErrorRow {
    canonical_id: String,
    ticker: String,
    exchange: String,
    provider: &'static str,
    error: String,
    classification: Classification,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum RawRow {
    Record(EodRecord),
    Error(ErrorRow),
}

#[derive(Debug, Serialize)]
struct RawMeta<'a> {
    schema: &'static str,
    run_id: &'a str,
    generated_at: String,
    exchange: &'a str,
    trading_date: &'a str,
}

#[derive(Debug, Serialize)]
struct RawDocument<'a> {
    meta: RawMeta<'a>,
    rows: &'a [RawRow],
}

#[derive(Debug, Default)]
struct Tally {
    provider_fallback_count: usize,
    fetch_failures: usize,
    schema_violations: usize,
    last_good_used: usize,
}

/// dp1 stage.
#[derive(Debug, Clone)]
pub struct EodSnapshot {
    pub exchange: String,
    /// Defaults to [`default_trading_date`] of the run date.
    pub trading_date: Option<NaiveDate>,
}

impl Default for EodSnapshot {
    fn default() -> Self {
        Self {
            exchange: "US".to_string(),
            trading_date: None,
        }
    }
}

impl EodSnapshot {
    pub fn new(exchange: &str, trading_date: Option<NaiveDate>) -> Self {
        Self {
            exchange: exchange.to_ascii_uppercase(),
            trading_date,
        }
    }

    fn resolve_date(&self, run: &RunContext) -> NaiveDate {
        self.trading_date
            .unwrap_or_else(|| default_trading_date(run.as_of_date()))
    }
}

impl Stage for EodSnapshot {
    fn id(&self) -> &'static str {
        STAGE_ID
    }

    fn lock_key(&self, run: &RunContext) -> LockKey {
        LockKey::new("eodhd", &format!("eod_{}", self.exchange), self.resolve_date(run))
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageReport, StageError> {
        let trading_date = self.resolve_date(ctx.run);
        let date = trading_date.format("%Y-%m-%d").to_string();
        let exchange = self.exchange.as_str();
        let publish_dir = format!("public/data/v3/eod/{exchange}");
        let mirror_dir = format!("mirrors/eodhd/eod/{exchange}");

        let universe = Universe::load(ctx.root())?;
        let entries = universe.for_exchange(exchange);
        let last_good: BTreeMap<String, EodRecord> =
            read_last_good::<EodRecord>(ctx.root(), &format!("{publish_dir}/latest.ndjson.gz"))
                .into_iter()
                .map(|r| (r.canonical_id.clone(), r))
                .collect();

        let local: Vec<Option<Bar>> = entries
            .iter()
            .map(|e| Bar::local(ctx.root(), &e.ticker, trading_date))
            .collect();
        let can_fetch = ctx.providers.has_secret("eodhd") || ctx.providers.has_secret("tiingo");
        let planned = if can_fetch {
            local.iter().filter(|b| b.is_none()).count() as u64
        } else {
            0
        };
        ctx.providers.assert_budget(planned)?;
        info!(exchange, trading_date = %date, symbols = entries.len(), planned, "dp1 started");

        let mut tally = Tally::default();
        let mut rows: Vec<EodRecord> = Vec::new();
        let mut raw: Vec<RawRow> = Vec::new();

        for (entry, local_bar) in entries.iter().copied().zip(local) {
            let (bar, provider) = match local_bar {
                Some(bar) => (bar, "local"),
                None if can_fetch => match fetch_with_fallback(ctx, entry, trading_date) {
                    Ok(Some((bar, provider))) => {
                        if provider == "tiingo" {
                            tally.provider_fallback_count += 1;
                        }
                        (bar, provider)
                    }
                    Ok(None) => {
                        debug!(symbol = %entry.canonical_id, "no provider rows");
                        continue;
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        tally.fetch_failures += 1;
                        raw.push(RawRow::Error(error_row(ctx, entry, e.to_string())));
                        continue;
                    }
                },
                None => continue,
            };

            match bar.validate() {
                Ok(()) => {
                    let record = bar.into_record(entry, provider);
                    raw.push(RawRow::Record(record.clone()));
                    rows.push(record);
                }
                Err(problem) => {
                    tally.schema_violations += 1;
                    let message = format!("SCHEMA_VIOLATION:{}:{provider}:{problem}", entry.canonical_id);
                    warn!(symbol = %entry.canonical_id, provider, %problem, "bar failed schema check");
                    let row = error_row(ctx, entry, message);
                    let use_last_good = row.classification.action == Action::DiscardBatchUseLastGood;
                    raw.push(RawRow::Error(row));
                    if let Some(previous) = last_good.get(&entry.canonical_id).filter(|_| use_last_good) {
                        rows.push(EodRecord {
                            last_good: true,
                            ..previous.clone()
                        });
                        tally.last_good_used += 1;
                    }
                }
            }
        }

        rows.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));

        let expected = entries.len();
        let observed = rows.len();
        let coverage = coverage_ratio(observed, expected);
        let partial = coverage < 1.0;
        let stale = rows.iter().all(|r| r.trading_date != date);

        if observed == 0 {
            return Err(StageError::failed(
                "DP1_EMPTY_RESULT",
                format!("exchange={exchange} trading_date={date} expected={expected}"),
            ));
        }

        let generated_at = ctx.run.generated_at_iso();
        let raw_doc = RawDocument {
            meta: RawMeta {
                schema: RAW_SCHEMA,
                run_id: &ctx.run.run_id,
                generated_at,
                exchange,
                trading_date: &date,
            },
            rows: &raw,
        };
        ctx.artifacts
            .write_gzip_json(&format!("{mirror_dir}/{date}.raw.json.gz"), &raw_doc)?;
        ctx.artifacts
            .write_gzip_ndjson(&format!("{mirror_dir}/{date}.canonical.ndjson.gz"), &rows)?;
        ctx.artifacts
            .write_gzip_ndjson(&format!("{publish_dir}/{date}.ndjson.gz"), &rows)?;
        ctx.artifacts
            .write_gzip_ndjson(&format!("{publish_dir}/latest.ndjson.gz"), &rows)?;

        let manifest_path = format!("{publish_dir}/manifest.json");
        let manifest = Manifest::builder(MANIFEST_SCHEMA, ctx.run)
            .quality("exchange", exchange)
            .quality("trading_date", date.as_str())
            .quality("expected_symbols", expected)
            .quality("observed_symbols", observed)
            .quality("coverage", coverage)
            .quality("stale", stale)
            .quality("partial", partial)
            .quality("provider_fallback_count", tally.provider_fallback_count)
            .quality("fetch_failures", tally.fetch_failures)
            .quality("schema_violations", tally.schema_violations)
            .quality("last_good_used", tally.last_good_used)
            .build(ctx.artifacts.written());
        ctx.artifacts.write_manifest(&manifest_path, &manifest)?;
        enforce_build_limits(ctx.root(), &publish_dir, &ctx.policies.build)?;

        let mut health = StageHealthEntry::new(
            if partial || stale {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            ctx.run,
        );
        health.stale = stale;
        health.partial = partial;
        health.coverage = json!({ "expected": expected, "observed": observed, "ratio": coverage });
        health.manifest = Some(manifest_path);
        if partial {
            health.reason = Some(format!(
                "coverage {observed}/{expected} fetch_failures={} schema_violations={}",
                tally.fetch_failures, tally.schema_violations
            ));
        } else if stale {
            health.reason = Some(format!("no rows for trading date {date}"));
        }

        Ok(StageReport {
            summary: format!("DP1 done exchange={exchange} tradingDate={date} observed={observed}/{expected}"),
            health,
        })
    }
}

fn error_row(ctx: &StageContext<'_>, entry: &UniverseEntry, error: String) -> ErrorRow {
    ErrorRow {
        canonical_id: entry.canonical_id.clone(),
        ticker: entry.ticker.clone(),
        exchange: entry.exchange.clone(),
        provider: "error",
        classification: ctx.classify(&error),
        error,
    }
}

/// eodhd first; tiingo when eodhd failed or returned nothing and tiingo is
/// a configured fallback with a secret.
fn fetch_with_fallback(
    ctx: &mut StageContext<'_>,
    entry: &UniverseEntry,
    trading_date: NaiveDate,
) -> Result<Option<(Bar, &'static str)>, ProviderCallError> {
    let primary = ctx.providers.call_json::<Vec<ProviderBar>>(&ProviderRequest::EodhdEod {
        symbol: entry.eodhd_symbol(),
        from: trading_date,
        to: trading_date,
    });
    let primary_err = match primary {
        Ok(rows) => match rows.last() {
            Some(row) => return Ok(Some((Bar::from_provider(row, trading_date), "eodhd"))),
            None => None,
        },
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => Some(e),
    };

    let fallback = ctx
        .policies
        .providers
        .policy
        .fallbacks
        .iter()
        .any(|p| p == "tiingo");
    if !fallback || !ctx.providers.has_secret("tiingo") {
        return match primary_err {
            Some(e) => Err(e),
            None => Ok(None),
        };
    }

    if let Some(e) = &primary_err {
        debug!(symbol = %entry.canonical_id, error = %e, "eodhd failed, trying tiingo");
    }
    let rows = ctx.providers.call_json::<Vec<ProviderBar>>(&ProviderRequest::TiingoDaily {
        ticker: entry.tiingo_ticker(),
        start: trading_date,
        end: trading_date,
    })?;
    Ok(rows
        .last()
        .map(|row| (Bar::from_provider(row, trading_date), "tiingo")))
}

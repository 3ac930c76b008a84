//! dp2: splits and dividends for every mapped symbol.
//!
//! When eodhd is unavailable (circuit open, cooldown, missing secret) the
//! stage stops calling it, keeps whatever it already fetched and carries
//! the last published rows forward for the remaining symbols. The stage is
//! then reported as degraded.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use dataplane_core::artifact::{enforce_build_limits, Manifest};
use dataplane_core::health::{HealthStatus, StageHealthEntry};
use dataplane_core::lock::LockKey;
use dataplane_core::RunContext;

use super::{read_last_good, MANIFEST_SCHEMA};
use crate::providers::ProviderRequest;
use crate::runner::{Stage, StageContext, StageError, StageReport};
use crate::universe::{Universe, UniverseEntry};

pub const STAGE_ID: &str = "dp2_actions";
pub const SPLITS_PATH: &str = "public/data/v3/actions/splits/latest.ndjson.gz";
pub const DIVIDENDS_PATH: &str = "public/data/v3/actions/dividends/latest.ndjson.gz";
pub const MANIFEST_PATH: &str = "public/data/v3/actions/manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Split,
    Dividend,
}

/// One published corporate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRow {
    pub canonical_id: String,
    pub ticker: String,
    pub exchange: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub event_date: String,
    pub value: f64,
    pub provider: String,
}

/// Split ratio from a number, a numeric string or `"a/b"`.
pub fn parse_split_value(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            let text = s.trim();
            if let Ok(v) = text.parse::<f64>() {
                return v.is_finite().then_some(v);
            }
            let (a, b) = text.split_once('/')?;
            let a: f64 = a.trim().parse().ok()?;
            let b: f64 = b.trim().parse().ok()?;
            (b != 0.0 && a.is_finite() && b.is_finite()).then(|| a / b)
        }
        _ => None,
    }
}

fn number(raw: Option<&Value>) -> Option<f64> {
    let value = match raw? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn event_date(row: &Value) -> Option<String> {
    let date = row.get("date")?.as_str()?.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(date.to_string())
}

fn action(entry: &UniverseEntry, kind: ActionKind, event_date: String, value: f64) -> ActionRow {
    ActionRow {
        canonical_id: entry.canonical_id.clone(),
        ticker: entry.ticker.clone(),
        exchange: entry.exchange.clone(),
        kind,
        event_date,
        value,
        provider: "eodhd".to_string(),
    }
}

/// Split rows with a usable date and a ratio other than 1.
fn split_rows(entry: &UniverseEntry, payload: &[Value]) -> Vec<ActionRow> {
    payload
        .iter()
        .filter_map(|row| {
            let value = parse_split_value(row.get("split")?)?;
            let date = event_date(row)?;
            (value != 1.0).then(|| action(entry, ActionKind::Split, date, value))
        })
        .collect()
}

/// Dividend rows with a usable date and a positive amount.
fn dividend_rows(entry: &UniverseEntry, payload: &[Value]) -> Vec<ActionRow> {
    payload
        .iter()
        .filter_map(|row| {
            let value = number(row.get("value")).or_else(|| number(row.get("unadjustedValue")))?;
            let date = event_date(row)?;
            (value > 0.0).then(|| action(entry, ActionKind::Dividend, date, value))
        })
        .collect()
}

/// Deduplicate on (id, date, value) and order by id then date.
fn finalize(rows: Vec<ActionRow>) -> Vec<ActionRow> {
    let mut unique: BTreeMap<(String, String, u64), ActionRow> = BTreeMap::new();
    for row in rows {
        unique.insert(
            (row.canonical_id.clone(), row.event_date.clone(), row.value.to_bits()),
            row,
        );
    }
    unique.into_values().collect()
}

#[derive(Debug, Clone, Serialize)]
struct SymbolFailure {
    ticker: String,
    errors: Vec<String>,
}

/// dp2 stage.
#[derive(Debug, Clone)]
pub struct CorporateActions {
    /// First event date requested from the provider.
    pub from: NaiveDate,
}

impl Default for CorporateActions {
    fn default() -> Self {
        Self {
            from: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or(NaiveDate::MIN),
        }
    }
}

impl CorporateActions {
    pub fn new(from: NaiveDate) -> Self {
        Self { from }
    }
}

impl Stage for CorporateActions {
    fn id(&self) -> &'static str {
        STAGE_ID
    }

    fn lock_key(&self, run: &RunContext) -> LockKey {
        LockKey::new("eodhd", "actions", run.as_of_date())
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageReport, StageError> {
        let universe = Universe::load(ctx.root())?;
        let entries = universe.entries();
        let to = ctx.run.as_of_date();

        let planned = if ctx.providers.has_secret("eodhd") {
            2 * entries.len() as u64
        } else {
            0
        };
        ctx.providers.assert_budget(planned)?;
        info!(symbols = entries.len(), planned, "dp2 started");

        let mut splits = Vec::new();
        let mut dividends = Vec::new();
        let mut failures: Vec<SymbolFailure> = Vec::new();
        let mut fetched: BTreeSet<String> = BTreeSet::new();
        let mut fresh_splits: BTreeSet<String> = BTreeSet::new();
        let mut fresh_dividends: BTreeSet<String> = BTreeSet::new();
        let mut unavailable: Option<String> = None;

        for entry in entries {
            let symbol = entry.eodhd_symbol();
            let mut errors = Vec::new();

            let requests = [
                ProviderRequest::EodhdSplits {
                    symbol: symbol.clone(),
                    from: self.from,
                    to,
                },
                ProviderRequest::EodhdDividends {
                    symbol: symbol.clone(),
                    from: self.from,
                    to,
                },
            ];
            for request in &requests {
                match ctx.providers.call_json::<Vec<Value>>(request) {
                    Ok(payload) => match request {
                        ProviderRequest::EodhdSplits { .. } => {
                            splits.extend(split_rows(entry, &payload));
                            fresh_splits.insert(entry.canonical_id.clone());
                        }
                        _ => {
                            dividends.extend(dividend_rows(entry, &payload));
                            fresh_dividends.insert(entry.canonical_id.clone());
                        }
                    },
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) if e.is_unavailable() => {
                        unavailable = Some(e.to_string());
                        break;
                    }
                    Err(e) => errors.push(format!("{}:{}", request.endpoint(), e)),
                }
            }
            if unavailable.is_some() {
                warn!(symbol = %entry.canonical_id, "eodhd unavailable, remaining symbols keep last good");
                break;
            }

            if errors.is_empty() {
                fetched.insert(entry.canonical_id.clone());
            } else {
                warn!(symbol = %entry.canonical_id, errors = ?errors, "action fetch issues");
                failures.push(SymbolFailure {
                    ticker: entry.ticker.clone(),
                    errors,
                });
            }
        }

        // Each kind keeps its last published rows for every symbol whose
        // fetch of that kind did not succeed.
        let carry = |rows: Vec<ActionRow>, fresh: &BTreeSet<String>| -> Vec<ActionRow> {
            rows.into_iter()
                .filter(|r| !fresh.contains(&r.canonical_id))
                .collect()
        };
        let carried_splits = carry(read_last_good(ctx.root(), SPLITS_PATH), &fresh_splits);
        let carried_dividends = carry(read_last_good(ctx.root(), DIVIDENDS_PATH), &fresh_dividends);
        let carried_symbols: BTreeSet<&str> = carried_splits
            .iter()
            .chain(&carried_dividends)
            .map(|r| r.canonical_id.as_str())
            .collect();
        let last_good_symbols = carried_symbols.len();

        splits.extend(carried_splits);
        dividends.extend(carried_dividends);
        let splits = finalize(splits);
        let dividends = finalize(dividends);

        ctx.artifacts.write_gzip_ndjson(SPLITS_PATH, &splits)?;
        ctx.artifacts.write_gzip_ndjson(DIVIDENDS_PATH, &dividends)?;

        let degraded = unavailable.is_some() || !failures.is_empty();
        let manifest = Manifest::builder(MANIFEST_SCHEMA, ctx.run)
            .quality("splits", splits.len())
            .quality("dividends", dividends.len())
            .quality("source", "eodhd-actions")
            .quality("fetched_symbols", fetched.len())
            .quality("failures", failures.len())
            .quality(
                "failed_symbols",
                failures.iter().map(|f| f.ticker.clone()).collect::<Vec<_>>(),
            )
            .quality("last_good_symbols", last_good_symbols)
            .quality("provider_available", unavailable.is_none())
            .build(ctx.artifacts.written());
        ctx.artifacts.write_manifest(MANIFEST_PATH, &manifest)?;
        enforce_build_limits(ctx.root(), "public/data/v3/actions", &ctx.policies.build)?;

        let mut health = StageHealthEntry::new(
            if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            ctx.run,
        );
        health.partial = fetched.len() < entries.len();
        health.coverage = json!({
            "splits": splits.len(),
            "dividends": dividends.len(),
            "fetched_symbols": fetched.len(),
            "symbols": entries.len(),
        });
        health.manifest = Some(MANIFEST_PATH.to_string());
        health.reason = match (&unavailable, failures.len()) {
            (Some(reason), _) => Some(format!("provider unavailable: {reason}")),
            (None, 0) => None,
            (None, n) => Some(format!("{n} symbols had action fetch issues")),
        };

        Ok(StageReport {
            summary: format!("DP2 done splits={} dividends={}", splits.len(), dividends.len()),
            health,
        })
    }
}

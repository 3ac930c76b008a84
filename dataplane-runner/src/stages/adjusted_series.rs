//! dp3: adjusted close series per mapped symbol, with input lineage.
//!
//! Inputs are the symbol's local bars, the published split and dividend
//! artifacts and the FX rates. Lineage is recorded over all four and
//! validated immediately; a symbol whose lineage fails is still published
//! and counted in `failed_lineage`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use dataplane_core::artifact::{enforce_build_limits, Manifest};
use dataplane_core::health::{HealthStatus, StageHealthEntry};
use dataplane_core::lineage::{build_lineage, validate_lineage, Lineage};
use dataplane_core::lock::LockKey;
use dataplane_core::RunContext;

use super::corporate_actions::{DIVIDENDS_PATH, SPLITS_PATH};
use super::MANIFEST_SCHEMA;
use crate::runner::{Stage, StageContext, StageError, StageReport};
use crate::universe::{load_local_bars, Universe, LOCAL_BARS_DIR};

pub const STAGE_ID: &str = "dp3_adjusted";
pub const SERIES_DIR: &str = "public/data/v3/series/adjusted";
pub const MANIFEST_PATH: &str = "public/data/v3/series/manifest.json";
pub const FX_RATES_PATH: &str = "public/data/v3/fx/rates/latest.json";
/// Trailing bars published per symbol.
pub const SERIES_WINDOW: usize = 260;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub lineage: Lineage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRow {
    pub canonical_id: String,
    pub ticker: String,
    pub exchange: String,
    pub trading_date: String,
    pub close: f64,
    pub adjusted_close: f64,
    pub meta: SeriesMeta,
}

/// dp3 stage.
#[derive(Debug, Clone, Default)]
pub struct AdjustedSeries;

impl Stage for AdjustedSeries {
    fn id(&self) -> &'static str {
        STAGE_ID
    }

    fn lock_key(&self, run: &RunContext) -> LockKey {
        LockKey::new("local", "adjusted_series", run.as_of_date())
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageReport, StageError> {
        ctx.providers.assert_budget(0)?;
        let universe = Universe::load(ctx.root())?;
        let as_of = ctx.run.as_of_date().format("%Y-%m-%d").to_string();

        let mut failed_lineage = 0usize;
        let mut lineage_failures: Vec<String> = Vec::new();
        let mut empty_series = 0usize;

        for entry in universe.entries() {
            let bars = load_local_bars(ctx.root(), &entry.ticker);
            let bars_path = format!("{LOCAL_BARS_DIR}/{}.json", entry.ticker);
            let sources = [bars_path.as_str(), SPLITS_PATH, DIVIDENDS_PATH, FX_RATES_PATH];
            let mut extra = Map::new();
            extra.insert("as_of".to_string(), Value::String(as_of.clone()));
            let lineage = build_lineage(ctx.root(), &sources, extra);

            let validation = validate_lineage(ctx.root(), &lineage);
            if !validation.ok {
                failed_lineage += 1;
                warn!(symbol = %entry.canonical_id, failures = ?validation.failures, "lineage check failed");
                lineage_failures.extend(validation.failures);
            }

            let start = bars.len().saturating_sub(SERIES_WINDOW);
            let rows: Vec<SeriesRow> = bars[start..]
                .iter()
                .map(|bar| SeriesRow {
                    canonical_id: entry.canonical_id.clone(),
                    ticker: entry.ticker.clone(),
                    exchange: entry.exchange.clone(),
                    trading_date: bar.date.clone(),
                    close: bar.close,
                    adjusted_close: bar.adj_close.unwrap_or(bar.close),
                    meta: SeriesMeta {
                        lineage: lineage.clone(),
                    },
                })
                .collect();
            if rows.is_empty() {
                empty_series += 1;
            }

            ctx.artifacts
                .write_gzip_ndjson(&format!("{SERIES_DIR}/{}.ndjson.gz", entry.safe_id()), &rows)?;
        }

        let symbols = universe.len();
        let manifest = Manifest::builder(MANIFEST_SCHEMA, ctx.run)
            .quality("symbols", symbols)
            .quality("failed_lineage", failed_lineage)
            .quality("empty_series", empty_series)
            .lineage(json!({ "source_count": 4, "failures": lineage_failures }))
            .build(ctx.artifacts.written());
        ctx.artifacts.write_manifest(MANIFEST_PATH, &manifest)?;
        enforce_build_limits(ctx.root(), SERIES_DIR, &ctx.policies.build)?;
        info!(symbols, failed_lineage, "dp3 series published");

        let degraded = failed_lineage > 0;
        let mut health = StageHealthEntry::new(
            if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            ctx.run,
        );
        health.partial = degraded;
        health.coverage = json!({ "symbols": symbols, "failed_lineage": failed_lineage });
        health.manifest = Some(MANIFEST_PATH.to_string());
        if degraded {
            health.reason = lineage_failures.first().cloned();
        }

        Ok(StageReport {
            summary: format!("DP3 done symbols={symbols} failedLineage={failed_lineage}"),
            health,
        })
    }
}

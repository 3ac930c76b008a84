//! dp0: publish the mapped universe and report drift against the source
//! ticker list.
//!
//! The source list at `public/data/universe/all.json` is an array of
//! tickers or `{ "ticker": ... }` objects. Tickers present in the source but
//! absent from the symbol mapping degrade the stage; the drift report keeps
//! both directions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{info, warn};

use dataplane_core::artifact::{enforce_build_limits, Manifest};
use dataplane_core::health::{HealthStatus, StageHealthEntry};
use dataplane_core::lineage::{build_lineage, Lineage};
use dataplane_core::lock::LockKey;
use dataplane_core::store;
use dataplane_core::RunContext;

use super::MANIFEST_SCHEMA;
use crate::runner::{Stage, StageContext, StageError, StageReport};
use crate::universe::{Universe, MAPPING_PATH};

pub const STAGE_ID: &str = "dp0_universe";
pub const SOURCE_PATH: &str = "public/data/universe/all.json";
pub const UNIVERSE_DIR: &str = "public/data/v3/universe";
pub const UNIVERSE_PATH: &str = "public/data/v3/universe/universe.json";
pub const MAPPING_ARTIFACT_PATH: &str = "public/data/v3/universe/symbol-mapping.json";
pub const MANIFEST_PATH: &str = "public/data/v3/universe/manifest.json";
pub const DRIFT_DIR: &str = "public/data/v3/system/drift";
pub const DRIFT_SCHEMA: &str = "rv.universe.drift.v1";

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceItem {
    Ticker(String),
    Object {
        #[serde(default)]
        ticker: Option<String>,
    },
    Other(Value),
}

impl SourceItem {
    fn ticker(self) -> Option<String> {
        let ticker = match self {
            Self::Ticker(t) => t,
            Self::Object { ticker } => ticker?,
            Self::Other(_) => return None,
        };
        let ticker = ticker.trim().to_string();
        (!ticker.is_empty()).then_some(ticker)
    }
}

/// Drift between the source ticker list and the mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub meta: DriftMeta,
    pub counts: DriftCounts,
    pub missing_in_policy: Vec<String>,
    pub extra_in_policy: Vec<String>,
    pub lineage: Lineage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftMeta {
    pub schema: String,
    pub generated_at: String,
    pub run_id: String,
    pub commit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftCounts {
    pub source: usize,
    pub policy: usize,
}

pub fn drift_path(run: &RunContext) -> String {
    format!("{DRIFT_DIR}/universe-drift-{}.json", run.as_of_date().format("%Y-%m-%d"))
}

fn load_source_tickers(ctx: &StageContext<'_>) -> Result<BTreeSet<String>, StageError> {
    let path = ctx.run.resolve(SOURCE_PATH);
    let items: Vec<SourceItem> = match store::read_json(&path) {
        Ok(Some(items)) => items,
        Ok(None) => return Err(StageError::failed("DP0_SOURCE_MISSING", SOURCE_PATH)),
        Err(e) => return Err(StageError::failed("DP0_SOURCE_INVALID", e.to_string())),
    };
    Ok(items.into_iter().filter_map(SourceItem::ticker).collect())
}

/// dp0 stage.
#[derive(Debug, Clone, Default)]
pub struct UniverseSync;

impl Stage for UniverseSync {
    fn id(&self) -> &'static str {
        STAGE_ID
    }

    fn lock_key(&self, run: &RunContext) -> LockKey {
        LockKey::new("local", "universe", run.as_of_date())
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageReport, StageError> {
        ctx.providers.assert_budget(0)?;
        let universe = Universe::load(ctx.root())?;
        let source = load_source_tickers(ctx)?;
        let policy: BTreeSet<String> = universe.entries().iter().map(|e| e.ticker.clone()).collect();

        let missing_in_policy: Vec<String> = source.difference(&policy).cloned().collect();
        let extra_in_policy: Vec<String> = policy.difference(&source).cloned().collect();
        if !missing_in_policy.is_empty() {
            warn!(missing = missing_in_policy.len(), "source tickers missing from the symbol mapping");
        }

        let mut extra = Map::new();
        extra.insert(
            "as_of".to_string(),
            Value::String(ctx.run.as_of_date().format("%Y-%m-%d").to_string()),
        );
        let lineage = build_lineage(ctx.root(), &[SOURCE_PATH, MAPPING_PATH], extra);

        let symbols: Vec<Value> = universe
            .entries()
            .iter()
            .map(|e| {
                json!({
                    "canonical_id": e.canonical_id,
                    "ticker": e.ticker,
                    "exchange": e.exchange,
                    "currency": e.currency,
                })
            })
            .collect();
        ctx.artifacts.write_json(
            UNIVERSE_PATH,
            &json!({
                "schema": "rv.universe.v3",
                "generated_at": ctx.run.generated_at_iso(),
                "symbols": symbols,
            }),
        )?;

        let mapping: Value = store::read_json_lenient(&ctx.run.resolve(MAPPING_PATH)).unwrap_or(Value::Null);
        let coverage_percent = mapping
            .pointer("/coverage/percent")
            .cloned()
            .unwrap_or(Value::Null);
        ctx.artifacts.write_json(MAPPING_ARTIFACT_PATH, &mapping)?;

        let drift_rel = drift_path(ctx.run);
        let drift = DriftReport {
            meta: DriftMeta {
                schema: DRIFT_SCHEMA.to_string(),
                generated_at: ctx.run.generated_at_iso(),
                run_id: ctx.run.run_id.clone(),
                commit: ctx.run.commit.clone(),
            },
            counts: DriftCounts {
                source: source.len(),
                policy: policy.len(),
            },
            missing_in_policy,
            extra_in_policy,
            lineage,
        };
        ctx.artifacts.write_json(&drift_rel, &drift)?;

        let manifest = Manifest::builder(MANIFEST_SCHEMA, ctx.run)
            .quality("missing_in_policy", drift.missing_in_policy.len())
            .quality("extra_in_policy", drift.extra_in_policy.len())
            .quality("mapping_coverage_percent", coverage_percent)
            .lineage(json!({
                "source_count": drift.lineage.sources.len(),
                "drift_report": drift_rel,
            }))
            .build(ctx.artifacts.written());
        ctx.artifacts.write_manifest(MANIFEST_PATH, &manifest)?;
        enforce_build_limits(ctx.root(), UNIVERSE_DIR, &ctx.policies.build)?;
        enforce_build_limits(ctx.root(), DRIFT_DIR, &ctx.policies.build)?;

        let drifted = !drift.missing_in_policy.is_empty();
        let mut health = StageHealthEntry::new(
            if drifted {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            ctx.run,
        );
        health.partial = drifted;
        health.coverage = json!({ "source": source.len(), "policy": policy.len() });
        health.manifest = Some(MANIFEST_PATH.to_string());
        if drifted {
            health.reason = Some(format!(
                "UNIVERSE_DRIFT:missing_in_policy={}",
                drift.missing_in_policy.len()
            ));
        }
        info!(source = source.len(), policy = policy.len(), "dp0 universe published");

        Ok(StageReport {
            summary: format!("DP0 done source={} policy={}", source.len(), policy.len()),
            health,
        })
    }
}

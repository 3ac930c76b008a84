//! End-to-end stage runs against a temporary root with the workspace
//! policies, a two-symbol universe and a scripted transport.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use dataplane_core::artifact::read_gzip_ndjson;
use dataplane_core::budget::BudgetError;
use dataplane_core::fetch::{HttpResponse, RecordingSleeper, ScriptedTransport};
use dataplane_core::lock::{LockOutcome, RunLock};
use dataplane_core::provider_state::CircuitState;
use dataplane_core::{ArtifactWriter, BudgetLedgerStore, PolicySet, RunContext};
use dataplane_runner::stages::adjusted_series::SeriesRow;
use dataplane_runner::stages::corporate_actions::{ActionKind, ActionRow, DIVIDENDS_PATH, SPLITS_PATH};
use dataplane_runner::stages::eod_snapshot::EodRecord;
use dataplane_runner::stages::news_signals::{NewsSignal, SIGNALS_PATH};
use dataplane_runner::{
    AdjustedSeries, CorporateActions, EodSnapshot, NewsSignals, ProviderCallError, ProviderClients,
    ProviderConfig, ProviderRequest, Secrets, Stage, StageError, StageOutcome, StageReport, StageRunner,
    UniverseSync,
};

const MAPPING: &str = r#"{
  "schema": "rv.universe.mapping.v3",
  "mappings": {
    "US:AAPL": { "ticker": "AAPL", "exchange": "US", "currency": "USD" },
    "US:MSFT": { "ticker": "MSFT", "exchange": "US", "currency": "USD" }
  }
}"#;

const MSFT_EODHD: &str = r#"[{"date":"2026-01-06","open":410.0,"high":415.0,"low":405.0,"close":412.0,"adjusted_close":412.0,"volume":2000}]"#;

fn workspace_policies() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .join("policies")
}

fn copy_dir(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

struct Fixture {
    dir: TempDir,
    run: RunContext,
}

/// A workspace policy file with one textual edit applied.
fn edited_policy(file: &str, from: &str, to: &str) -> String {
    let text = std::fs::read_to_string(workspace_policies().join(file)).unwrap();
    assert!(text.contains(from), "{file} has no '{from}'");
    text.replace(from, to)
}

impl Fixture {
    fn new() -> Self {
        Self::with_policies(&[])
    }

    fn with_policy(file: &str, text: &str) -> Self {
        Self::with_policies(&[(file, text)])
    }

    /// Replace policy files under `policies/` before anything loads them.
    fn with_policies(overrides: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        copy_dir(&workspace_policies(), &dir.path().join("policies"));
        std::fs::write(dir.path().join("policies/universe/symbol-mapping.json"), MAPPING).unwrap();
        for (file, text) in overrides {
            std::fs::write(dir.path().join("policies").join(file), text).unwrap();
        }
        // Tuesday evening, so the default trading date is the run date.
        let at = Utc.with_ymd_and_hms(2026, 1, 6, 22, 0, 0).unwrap();
        let run = RunContext::new(dir.path(), "run-test", "abc123", "policy-test", at);
        Self { dir, run }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn policies(&self) -> PolicySet {
        PolicySet::load(self.root()).unwrap()
    }

    fn write(&self, rel: &str, text: &str) {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn write_bars(&self, ticker: &str, bars: &Value) {
        self.write(&format!("public/data/eod/bars/{ticker}.json"), &bars.to_string());
    }

    fn read_json(&self, rel: &str) -> Value {
        let text = std::fs::read_to_string(self.root().join(rel)).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    fn health(&self) -> Value {
        let text = std::fs::read_to_string(self.run.health_path()).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    fn run_stage(
        &self,
        stage: &dyn Stage,
        transport: &ScriptedTransport,
        secrets: Secrets,
    ) -> Result<StageOutcome, StageError> {
        let policies = self.policies();
        let sleeper = RecordingSleeper::new();
        StageRunner::new(&self.run, &policies, transport, &sleeper)
            .with_config(ProviderConfig::with_base("http://mock"))
            .with_secrets(secrets)
            .run(stage)
    }
}

fn completed(outcome: Result<StageOutcome, StageError>) -> StageReport {
    match outcome {
        Ok(StageOutcome::Completed(report)) => report,
        Ok(StageOutcome::LockHeld(doc)) => panic!("unexpected lock held by {}", doc.owner),
        Err(e) => panic!("stage failed: {e}"),
    }
}

fn aapl_bar() -> Value {
    json!([
        {"date": "2026-01-05", "open": 238.0, "high": 241.0, "low": 237.0, "close": 240.0, "adjClose": 240.0, "volume": 900},
        {"date": "2026-01-06", "open": 240.0, "high": 245.0, "low": 239.0, "close": 244.0, "adjClose": 243.5, "volume": 1000}
    ])
}

fn ok(body: &str) -> Result<HttpResponse, dataplane_core::fetch::TransportError> {
    Ok(HttpResponse::new(200, body))
}

fn status(code: u16, body: &str) -> Result<HttpResponse, dataplane_core::fetch::TransportError> {
    Ok(HttpResponse::new(code, body))
}

// ─── dp1 ────────────────────────────────────────────────────────────

#[test]
fn dp1_combines_local_bars_and_eodhd() {
    let fx = Fixture::new();
    fx.write_bars("AAPL", &aapl_bar());
    let transport = ScriptedTransport::new(vec![ok(MSFT_EODHD)]);

    let report = completed(fx.run_stage(
        &EodSnapshot::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(report.summary, "DP1 done exchange=US tradingDate=2026-01-06 observed=2/2");

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("http://mock/eodhd/eod/MSFT.US?"));
    assert!(calls[0].contains("from=2026-01-06"));
    assert!(calls[0].ends_with("api_token=key-e"));

    let rows: Vec<EodRecord> =
        read_gzip_ndjson(&fx.root().join("public/data/v3/eod/US/latest.ndjson.gz")).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].canonical_id, "US:AAPL");
    assert_eq!(rows[0].provider, "local");
    assert_eq!(rows[0].adjusted_close, 243.5);
    assert_eq!(rows[1].canonical_id, "US:MSFT");
    assert_eq!(rows[1].provider, "eodhd");
    assert_eq!(rows[1].volume, 2000);

    let manifest = fx.read_json("public/data/v3/eod/US/manifest.json");
    assert_eq!(manifest["meta"]["schema"], "rv.manifest.v3");
    assert_eq!(manifest["meta"]["run_id"], "run-test");
    assert_eq!(manifest["meta"]["quality"]["observed_symbols"], 2);
    assert_eq!(manifest["meta"]["quality"]["stale"], false);
    let paths: Vec<&str> = manifest["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["path"].as_str().unwrap())
        .collect();
    assert!(paths.contains(&"public/data/v3/eod/US/latest.ndjson.gz"));
    assert!(paths.contains(&"mirrors/eodhd/eod/US/2026-01-06.raw.json.gz"));
    assert!(!paths.iter().any(|p| p.ends_with("manifest.json")));

    let ledger: Value = serde_json::from_str(
        &std::fs::read_to_string(fx.run.budget_ledger_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(ledger["used_calls"], 1);
    assert_eq!(ledger["used_calls_by_stage"]["dp1_eod"], 1);

    let health = fx.health();
    assert_eq!(health["stages"]["dp1_eod"]["status"], "ok");
    assert_eq!(health["stages"]["dp1_eod"]["manifest"], "public/data/v3/eod/US/manifest.json");
    assert_eq!(health["system"]["status"], "ok");
    assert_eq!(health["system"]["budget"]["used_calls"], 1);
    assert_eq!(health["meta"]["run_id"], "run-test");
}

#[test]
fn dp1_falls_back_to_tiingo() {
    let fx = Fixture::new();
    fx.write_bars("AAPL", &aapl_bar());
    let tiingo = r#"[{"date":"2026-01-06T00:00:00.000Z","open":410.0,"high":415.0,"low":405.0,"close":411.0,"adjClose":411.0,"volume":1800,"divCash":0.0,"splitFactor":1.0}]"#;
    let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(404, "not found")), ok(tiingo)]);

    let report = completed(fx.run_stage(
        &EodSnapshot::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e").with("tiingo", "key-t"),
    ));
    assert!(report.summary.ends_with("observed=2/2"));

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].starts_with("http://mock/tiingo/daily/msft/prices?"));
    assert!(calls[1].ends_with("token=key-t"));

    let rows: Vec<EodRecord> =
        read_gzip_ndjson(&fx.root().join("public/data/v3/eod/US/latest.ndjson.gz")).unwrap();
    assert_eq!(rows[1].provider, "tiingo");
    assert_eq!(rows[1].trading_date, "2026-01-06");

    let manifest = fx.read_json("public/data/v3/eod/US/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["provider_fallback_count"], 1);
    assert_eq!(manifest["meta"]["quality"]["fetch_failures"], 0);
}

#[test]
fn dp1_without_rows_fails_and_records_error_health() {
    let fx = Fixture::new();
    let transport = ScriptedTransport::new(vec![]);

    let err = fx
        .run_stage(&EodSnapshot::default(), &transport, Secrets::default())
        .unwrap_err();
    assert!(matches!(err, StageError::Failed { code: "DP1_EMPTY_RESULT", .. }));
    assert_eq!(transport.call_count(), 0);
    assert!(!fx.root().join("public/data/v3/eod/US/latest.ndjson.gz").exists());

    let health = fx.health();
    assert_eq!(health["stages"]["dp1_eod"]["status"], "error");
    assert!(health["stages"]["dp1_eod"]["reason"]
        .as_str()
        .unwrap()
        .starts_with("DP1_EMPTY_RESULT:"));
    assert_eq!(health["system"]["status"], "error");
}

#[test]
fn dp1_replaces_schema_violation_with_last_good_row() {
    let fx = Fixture::new();
    fx.write_bars("AAPL", &aapl_bar());
    let previous = EodRecord {
        canonical_id: "US:MSFT".into(),
        ticker: "MSFT".into(),
        exchange: "US".into(),
        currency: Some("USD".into()),
        trading_date: "2026-01-05".into(),
        open: 400.0,
        high: 405.0,
        low: 398.0,
        close: 404.0,
        adjusted_close: 404.0,
        volume: 1500,
        dividend: 0.0,
        split: 1.0,
        provider: "eodhd".into(),
        last_good: false,
    };
    ArtifactWriter::new(fx.root())
        .write_gzip_ndjson("public/data/v3/eod/US/latest.ndjson.gz", &[previous])
        .unwrap();

    // close above high
    let bad = r#"[{"date":"2026-01-06","open":410.0,"high":415.0,"low":405.0,"close":500.0,"adjusted_close":500.0,"volume":2000}]"#;
    let transport = ScriptedTransport::new(vec![ok(bad)]);

    let report = completed(fx.run_stage(
        &EodSnapshot::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert!(report.summary.ends_with("observed=2/2"));

    let rows: Vec<EodRecord> =
        read_gzip_ndjson(&fx.root().join("public/data/v3/eod/US/latest.ndjson.gz")).unwrap();
    let msft = rows.iter().find(|r| r.canonical_id == "US:MSFT").unwrap();
    assert!(msft.last_good);
    assert_eq!(msft.trading_date, "2026-01-05");
    assert_eq!(msft.close, 404.0);

    let manifest = fx.read_json("public/data/v3/eod/US/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["schema_violations"], 1);
    assert_eq!(manifest["meta"]["quality"]["last_good_used"], 1);
}

#[test]
fn dp1_provider_failure_degrades_and_persists_state() {
    let fx = Fixture::new();
    fx.write_bars("AAPL", &aapl_bar());
    let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(401, "bad key"))]);

    let report = completed(fx.run_stage(
        &EodSnapshot::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert!(report.summary.ends_with("observed=1/2"));
    assert_eq!(transport.call_count(), 1);

    let health = fx.health();
    assert_eq!(health["stages"]["dp1_eod"]["status"], "degraded");
    assert_eq!(health["stages"]["dp1_eod"]["partial"], true);
    assert_eq!(health["stages"]["dp1_eod"]["coverage"]["observed"], 1);

    let manifest = fx.read_json("public/data/v3/eod/US/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["fetch_failures"], 1);
    assert!(fx.run.provider_state_path().is_file());
    let state = std::fs::read_to_string(fx.run.provider_state_path()).unwrap();
    assert!(state.contains("eodhd"));
}

#[test]
fn held_lock_skips_the_stage() {
    let fx = Fixture::new();
    let stage = EodSnapshot::default();
    let lock = RunLock::new(fx.run.lock_dir(), 900);
    let _guard = match lock.acquire(&stage.lock_key(&fx.run), "other-run").unwrap() {
        LockOutcome::Acquired(guard) => guard,
        LockOutcome::Held(_) => panic!("fresh lock dir"),
    };
    let transport = ScriptedTransport::new(vec![]);

    match fx.run_stage(&stage, &transport, Secrets::default().with("eodhd", "key-e")) {
        Ok(StageOutcome::LockHeld(doc)) => {
            assert_eq!(doc.owner, "other-run");
            assert!(doc.expires_at > Utc::now() + Duration::seconds(60));
        }
        other => panic!("expected lock held, got {other:?}"),
    }
    assert_eq!(transport.call_count(), 0);
    assert!(!fx.run.health_path().exists());
}

#[test]
fn budget_exhaustion_fails_before_any_call() {
    let fx = Fixture::with_policy(
        "budget.toml",
        r#"
schema_version = "v3"
hard_cap = 10
reserve = 9
stop_before_calls = true
"#,
    );
    let transport = ScriptedTransport::new(vec![ok(MSFT_EODHD), ok(MSFT_EODHD)]);

    let err = fx
        .run_stage(
            &EodSnapshot::default(),
            &transport,
            Secrets::default().with("eodhd", "key-e"),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::Budget(BudgetError::Exhausted {
            planned: 2,
            remaining: 1,
            ..
        })
    ));
    assert_eq!(transport.call_count(), 0);

    let health = fx.health();
    assert_eq!(health["stages"]["dp1_eod"]["status"], "error");
    assert!(health["stages"]["dp1_eod"]["reason"]
        .as_str()
        .unwrap()
        .starts_with("BUDGET_EXHAUSTED"));
    assert_eq!(health["system"]["budget"]["safe_remaining"], 1);
}

// ─── dp2 ────────────────────────────────────────────────────────────

#[test]
fn dp2_publishes_splits_and_dividends() {
    let fx = Fixture::new();
    let transport = ScriptedTransport::new(vec![
        ok(r#"[{"date":"2020-08-31","split":"4.000000/1.000000"}]"#),
        ok(r#"[{"date":"2025-11-10","value":0.26},{"date":"2025-08-11","value":0.26}]"#),
        ok("[]"),
        ok(r#"[{"date":"2025-11-20","value":0.91}]"#),
    ]);

    let report = completed(fx.run_stage(
        &CorporateActions::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(report.summary, "DP2 done splits=1 dividends=3");

    let calls = transport.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[0].starts_with("http://mock/eodhd/splits/AAPL.US?from=1990-01-01&to=2026-01-06"));
    assert!(calls[1].starts_with("http://mock/eodhd/div/AAPL.US?"));

    let splits: Vec<ActionRow> = read_gzip_ndjson(&fx.root().join(SPLITS_PATH)).unwrap();
    assert_eq!(splits.len(), 1);
    assert_eq!(splits[0].kind, ActionKind::Split);
    assert_eq!(splits[0].value, 4.0);
    let dividends: Vec<ActionRow> = read_gzip_ndjson(&fx.root().join(DIVIDENDS_PATH)).unwrap();
    assert_eq!(dividends.len(), 3);
    assert_eq!(dividends[0].event_date, "2025-08-11");

    let health = fx.health();
    assert_eq!(health["stages"]["dp2_actions"]["status"], "ok");
    let ledger: Value = serde_json::from_str(
        &std::fs::read_to_string(fx.run.budget_ledger_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(ledger["used_calls_by_stage"]["dp2_actions"], 4);
}

#[test]
fn dp2_without_secret_keeps_last_good_and_degrades() {
    let fx = Fixture::new();
    let carried = ActionRow {
        canonical_id: "US:AAPL".into(),
        ticker: "AAPL".into(),
        exchange: "US".into(),
        kind: ActionKind::Split,
        event_date: "2020-08-31".into(),
        value: 4.0,
        provider: "eodhd".into(),
    };
    ArtifactWriter::new(fx.root())
        .write_gzip_ndjson(SPLITS_PATH, &[carried.clone()])
        .unwrap();
    let transport = ScriptedTransport::new(vec![]);

    let report = completed(fx.run_stage(&CorporateActions::default(), &transport, Secrets::default()));
    assert_eq!(report.summary, "DP2 done splits=1 dividends=0");
    assert_eq!(transport.call_count(), 0);

    let splits: Vec<ActionRow> = read_gzip_ndjson(&fx.root().join(SPLITS_PATH)).unwrap();
    assert_eq!(splits, vec![carried]);

    let manifest = fx.read_json("public/data/v3/actions/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["provider_available"], false);
    assert_eq!(manifest["meta"]["quality"]["last_good_symbols"], 1);

    let health = fx.health();
    assert_eq!(health["stages"]["dp2_actions"]["status"], "degraded");
    assert!(health["stages"]["dp2_actions"]["reason"]
        .as_str()
        .unwrap()
        .contains("MISSING_SECRET:EODHD_API_KEY"));
}

fn action_row(canonical_id: &str, kind: ActionKind, event_date: &str, value: f64) -> ActionRow {
    let ticker = canonical_id.trim_start_matches("US:");
    ActionRow {
        canonical_id: canonical_id.into(),
        ticker: ticker.into(),
        exchange: "US".into(),
        kind,
        event_date: event_date.into(),
        value,
        provider: "eodhd".into(),
    }
}

fn seed_actions(fx: &Fixture, splits: &[ActionRow], dividends: &[ActionRow]) {
    let mut writer = ArtifactWriter::new(fx.root());
    writer.write_gzip_ndjson(SPLITS_PATH, splits).unwrap();
    writer.write_gzip_ndjson(DIVIDENDS_PATH, dividends).unwrap();
}

fn provider_state(fx: &Fixture) -> Value {
    let text = std::fs::read_to_string(fx.run.provider_state_path()).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[test]
fn dp2_keeps_last_good_dividends_when_only_dividends_fail() {
    let fx = Fixture::new();
    let carried = action_row("US:AAPL", ActionKind::Dividend, "2025-08-11", 0.26);
    seed_actions(&fx, &[], &[carried.clone()]);
    let transport = ScriptedTransport::new(vec![
        ok(r#"[{"date":"2020-08-31","split":"4/1"}]"#),
        status(404, "not found"),
        ok("[]"),
        ok("[]"),
    ]);

    let report = completed(fx.run_stage(
        &CorporateActions::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(report.summary, "DP2 done splits=1 dividends=1");
    assert_eq!(transport.call_count(), 4);

    let splits: Vec<ActionRow> = read_gzip_ndjson(&fx.root().join(SPLITS_PATH)).unwrap();
    assert_eq!(splits.len(), 1);
    assert_eq!(splits[0].canonical_id, "US:AAPL");
    assert_eq!(splits[0].value, 4.0);
    let dividends: Vec<ActionRow> = read_gzip_ndjson(&fx.root().join(DIVIDENDS_PATH)).unwrap();
    assert_eq!(dividends, vec![carried]);

    let manifest = fx.read_json("public/data/v3/actions/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["failed_symbols"], json!(["AAPL"]));
    assert_eq!(manifest["meta"]["quality"]["fetched_symbols"], 1);
    assert_eq!(manifest["meta"]["quality"]["last_good_symbols"], 1);
    assert_eq!(manifest["meta"]["quality"]["provider_available"], true);

    let health = fx.health();
    assert_eq!(health["stages"]["dp2_actions"]["status"], "degraded");
    assert_eq!(health["stages"]["dp2_actions"]["partial"], true);
    assert_eq!(health["stages"]["dp2_actions"]["reason"], "1 symbols had action fetch issues");
}

#[test]
fn dp2_stops_calling_when_the_circuit_opens_mid_run() {
    let fx = Fixture::new();
    let msft_split = action_row("US:MSFT", ActionKind::Split, "2003-02-18", 2.0);
    let aapl_dividend = action_row("US:AAPL", ActionKind::Dividend, "2025-08-11", 0.26);
    seed_actions(&fx, &[msft_split.clone()], &[aapl_dividend.clone()]);
    // A permanent failure opens the circuit at once under the workspace error policy.
    let transport = ScriptedTransport::new(vec![status(401, "bad key"), ok("[]"), ok("[]"), ok("[]")]);

    let report = completed(fx.run_stage(
        &CorporateActions::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(report.summary, "DP2 done splits=1 dividends=1");

    let splits: Vec<ActionRow> = read_gzip_ndjson(&fx.root().join(SPLITS_PATH)).unwrap();
    assert_eq!(splits, vec![msft_split]);
    let dividends: Vec<ActionRow> = read_gzip_ndjson(&fx.root().join(DIVIDENDS_PATH)).unwrap();
    assert_eq!(dividends, vec![aapl_dividend]);

    let manifest = fx.read_json("public/data/v3/actions/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["provider_available"], false);
    assert_eq!(manifest["meta"]["quality"]["fetched_symbols"], 0);

    let health = fx.health();
    assert_eq!(health["stages"]["dp2_actions"]["status"], "degraded");
    assert!(health["stages"]["dp2_actions"]["reason"]
        .as_str()
        .unwrap()
        .contains("PROVIDER_SKIPPED:eodhd:CIRCUIT_OPEN"));

    let state = provider_state(&fx);
    assert_eq!(state["providers"]["eodhd"]["circuit_state"], "open");
    assert_eq!(state["providers"]["eodhd"]["failures"]["UNAUTHORIZED"], 1);
}

#[test]
fn error_policy_threshold_opens_the_circuit() {
    let errors = edited_policy("errors.toml", "transient = 5", "transient = 1");
    let fx = Fixture::with_policy("errors.toml", &errors);
    let transport = ScriptedTransport::new(vec![status(404, "not found"), ok("[]"), ok("[]"), ok("[]")]);

    let report = completed(fx.run_stage(
        &CorporateActions::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(report.summary, "DP2 done splits=0 dividends=0");

    let state = provider_state(&fx);
    assert_eq!(state["providers"]["eodhd"]["circuit_state"], "open");
    assert!(state["providers"]["eodhd"]["open_until"].is_string());
    let health = fx.health();
    assert!(health["stages"]["dp2_actions"]["reason"]
        .as_str()
        .unwrap()
        .contains("CIRCUIT_OPEN"));
}

#[test]
fn endpoint_limit_is_checked_before_the_half_open_call() {
    let providers = edited_policy(
        "providers.toml",
        "[providers.eodhd.endpoints.news]",
        "[providers.eodhd.endpoints.splits]\ndaily_requests = 0\n\n[providers.eodhd.endpoints.news]",
    );
    let fx = Fixture::with_policy("providers.toml", &providers);
    fx.write(
        "mirrors/ops/provider-state.json",
        r#"{"schema_version":"v1","updated_at":"2020-01-01T00:00:00Z","providers":{"eodhd":{"circuit_state":"open","open_until":"2020-01-01T00:15:00Z"}}}"#,
    );
    // Only dividends reach the network: the first is the half-open call,
    // the second closes the circuit.
    let transport = ScriptedTransport::new(vec![ok(r#"[{"date":"2025-11-10","value":0.26}]"#), ok("[]")]);

    let report = completed(fx.run_stage(
        &CorporateActions::default(),
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(report.summary, "DP2 done splits=0 dividends=1");
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("http://mock/eodhd/div/AAPL.US?"));
    assert!(calls[1].starts_with("http://mock/eodhd/div/MSFT.US?"));

    let state = provider_state(&fx);
    assert_eq!(state["providers"]["eodhd"]["circuit_state"], "closed");
    assert_eq!(fx.health()["stages"]["dp2_actions"]["status"], "degraded");
}

#[test]
fn failed_call_is_recorded_even_when_budget_accounting_fails() {
    let fx = Fixture::new();
    let policies = fx.policies();
    let transport = ScriptedTransport::new(vec![status(401, "bad key")]);
    let sleeper = RecordingSleeper::new();
    let config = ProviderConfig::with_base("http://mock");
    let secrets = Secrets::default().with("eodhd", "key-e");
    let budget = BudgetLedgerStore::init(fx.run.budget_ledger_path(), &policies.budget).unwrap();
    // The ledger can no longer be replaced, so consuming the call fails.
    std::fs::remove_file(fx.run.budget_ledger_path()).unwrap();
    std::fs::create_dir(fx.run.budget_ledger_path()).unwrap();

    let mut clients = ProviderClients::new(
        &fx.run,
        &policies,
        &transport,
        &sleeper,
        &config,
        &secrets,
        "dp2_actions",
        budget,
    );
    let request = ProviderRequest::EodhdSplits {
        symbol: "AAPL.US".into(),
        from: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        to: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
    };
    let err = clients.call(&request).unwrap_err();
    assert!(matches!(err, ProviderCallError::Budget(_)), "{err}");
    assert_eq!(transport.call_count(), 1);

    let entry = clients.state().entry("eodhd").unwrap();
    assert_eq!(entry.failures.get("UNAUTHORIZED"), Some(&1));
    assert_eq!(entry.last_http_status, Some(401));
    assert_eq!(entry.circuit_state, CircuitState::Open);
}

// ─── dp3 ────────────────────────────────────────────────────────────

fn long_history(days: u64) -> Value {
    let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let rows: Vec<Value> = (0..days)
        .map(|i| {
            let date = start + chrono::Days::new(i);
            let close = 100.0 + i as f64;
            json!({"date": date.format("%Y-%m-%d").to_string(), "close": close, "adj_close": close - 1.0})
        })
        .collect();
    Value::Array(rows)
}

fn seed_adjustment_inputs(fx: &Fixture, with_fx: bool) {
    let mut writer = ArtifactWriter::new(fx.root());
    writer.write_gzip_ndjson::<Value>(SPLITS_PATH, &[]).unwrap();
    writer.write_gzip_ndjson::<Value>(DIVIDENDS_PATH, &[]).unwrap();
    if with_fx {
        writer
            .write_json("public/data/v3/fx/rates/latest.json", &json!({"base": "USD", "rates": {}}))
            .unwrap();
    }
}

#[test]
fn dp3_publishes_trailing_window_with_lineage() {
    let fx = Fixture::new();
    fx.write_bars("AAPL", &long_history(300));
    fx.write_bars("MSFT", &json!([{"date": "2026-01-06", "close": 412.0}]));
    seed_adjustment_inputs(&fx, true);
    let transport = ScriptedTransport::new(vec![]);

    let report = completed(fx.run_stage(&AdjustedSeries, &transport, Secrets::default()));
    assert_eq!(report.summary, "DP3 done symbols=2 failedLineage=0");
    assert_eq!(transport.call_count(), 0);

    let aapl: Vec<SeriesRow> =
        read_gzip_ndjson(&fx.root().join("public/data/v3/series/adjusted/US__AAPL.ndjson.gz")).unwrap();
    assert_eq!(aapl.len(), 260);
    let last = aapl.last().unwrap();
    assert_eq!(last.close, 399.0);
    assert_eq!(last.adjusted_close, 398.0);
    assert_eq!(last.meta.lineage.sources.len(), 4);
    assert!(last.meta.lineage.sources.iter().all(|s| s.exists));

    let msft: Vec<SeriesRow> =
        read_gzip_ndjson(&fx.root().join("public/data/v3/series/adjusted/US__MSFT.ndjson.gz")).unwrap();
    assert_eq!(msft[0].adjusted_close, 412.0);

    let manifest = fx.read_json("public/data/v3/series/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["symbols"], 2);
    assert_eq!(manifest["meta"]["lineage"]["source_count"], 4);
    assert_eq!(fx.health()["stages"]["dp3_adjusted"]["status"], "ok");
}

#[test]
fn dp3_missing_input_marks_lineage_failure() {
    let fx = Fixture::new();
    fx.write_bars("AAPL", &long_history(3));
    fx.write_bars("MSFT", &long_history(3));
    seed_adjustment_inputs(&fx, false);

    let report = completed(fx.run_stage(&AdjustedSeries, &ScriptedTransport::new(vec![]), Secrets::default()));
    assert_eq!(report.summary, "DP3 done symbols=2 failedLineage=2");

    let health = fx.health();
    assert_eq!(health["stages"]["dp3_adjusted"]["status"], "degraded");
    assert_eq!(health["stages"]["dp3_adjusted"]["partial"], true);
    assert!(health["stages"]["dp3_adjusted"]["reason"]
        .as_str()
        .unwrap()
        .starts_with("LINEAGE_SOURCE_MISSING:public/data/v3/fx/rates/latest.json"));
}

// ─── dp0 ────────────────────────────────────────────────────────────

#[test]
fn dp0_publishes_universe_and_reports_drift() {
    let fx = Fixture::new();
    fx.write("public/data/universe/all.json", r#"["AAPL", {"ticker": "MSFT"}, "NVDA"]"#);
    let transport = ScriptedTransport::new(vec![]);

    let report = completed(fx.run_stage(&UniverseSync, &transport, Secrets::default()));
    assert_eq!(report.summary, "DP0 done source=3 policy=2");
    assert_eq!(transport.call_count(), 0);

    let universe = fx.read_json("public/data/v3/universe/universe.json");
    assert_eq!(universe["symbols"].as_array().unwrap().len(), 2);
    assert_eq!(universe["symbols"][0]["canonical_id"], "US:AAPL");
    let mapping = fx.read_json("public/data/v3/universe/symbol-mapping.json");
    assert_eq!(mapping["mappings"]["US:MSFT"]["ticker"], "MSFT");

    let drift = fx.read_json("public/data/v3/system/drift/universe-drift-2026-01-06.json");
    assert_eq!(drift["meta"]["schema"], "rv.universe.drift.v1");
    assert_eq!(drift["counts"], json!({"source": 3, "policy": 2}));
    assert_eq!(drift["missing_in_policy"], json!(["NVDA"]));
    assert_eq!(drift["extra_in_policy"], json!([]));
    assert_eq!(drift["lineage"]["sources"].as_array().unwrap().len(), 2);

    let manifest = fx.read_json("public/data/v3/universe/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["missing_in_policy"], 1);
    assert_eq!(manifest["meta"]["quality"]["extra_in_policy"], 0);

    let health = fx.health();
    assert_eq!(health["stages"]["dp0_universe"]["status"], "degraded");
    assert_eq!(health["stages"]["dp0_universe"]["partial"], true);
    assert_eq!(health["stages"]["dp0_universe"]["reason"], "UNIVERSE_DRIFT:missing_in_policy=1");
}

#[test]
fn dp0_without_drift_is_ok() {
    let fx = Fixture::new();
    fx.write("public/data/universe/all.json", r#"["AAPL", "MSFT"]"#);

    let report = completed(fx.run_stage(&UniverseSync, &ScriptedTransport::new(vec![]), Secrets::default()));
    assert_eq!(report.summary, "DP0 done source=2 policy=2");
    assert_eq!(fx.health()["stages"]["dp0_universe"]["status"], "ok");
}

#[test]
fn dp0_missing_source_fails() {
    let fx = Fixture::new();
    let err = fx
        .run_stage(&UniverseSync, &ScriptedTransport::new(vec![]), Secrets::default())
        .unwrap_err();
    assert!(matches!(err, StageError::Failed { code: "DP0_SOURCE_MISSING", .. }));
    assert!(!fx.root().join("public/data/v3/universe/universe.json").exists());
    assert_eq!(fx.health()["stages"]["dp0_universe"]["status"], "error");
}

// ─── dp5 ────────────────────────────────────────────────────────────

fn write_pulse(fx: &Fixture, tickers: &[&str], volatility: &str) {
    let movers: Vec<Value> = tickers.iter().map(|t| json!({ "ticker": t })).collect();
    fx.write(
        "public/data/v3/pulse/top-movers/latest.json",
        &json!({ "top_movers": movers }).to_string(),
    );
    fx.write(
        "public/data/v3/pulse/market-health/latest.json",
        &json!({ "volatility_state": volatility }).to_string(),
    );
}

#[test]
fn dp5_collects_deduped_signals_for_top_movers() {
    let fx = Fixture::new();
    write_pulse(&fx, &["AAPL", "MSFT"], "high");
    let transport = ScriptedTransport::new(vec![
        ok(r#"[{"title":"Apple earnings","date":"2026-01-06T13:00:00+00:00","link":"https://a"},{"title":"Chip rally","date":"2026-01-05T10:00:00+00:00"}]"#),
        ok(r#"[{"title":"Chip rally","date":"2026-01-05T10:00:00+00:00"},{"title":"   "}]"#),
    ]);

    let report = completed(fx.run_stage(
        &NewsSignals,
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(report.summary, "DP5 done status=ok signals=2");

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("http://mock/eodhd/news?s=AAPL.US&limit=5"));
    assert!(calls[1].starts_with("http://mock/eodhd/news?s=MSFT.US&limit=5"));

    let doc = fx.read_json(SIGNALS_PATH);
    assert_eq!(doc["meta"]["schema"], "rv.news.v2");
    assert_eq!(doc["meta"]["status"], "ok");
    let signals: Vec<NewsSignal> = serde_json::from_value(doc["signals"].clone()).unwrap();
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[0].headline, "Apple earnings");
    assert_eq!(signals[0].url.as_deref(), Some("https://a"));
    assert_eq!(signals[1].headline, "Chip rally");
    assert_eq!(signals[1].ticker, "AAPL");

    let manifest = fx.read_json("public/data/v3/news/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["planned_calls"], 3);
    assert_eq!(manifest["meta"]["quality"]["emitted_signals"], 2);

    let health = fx.health();
    assert_eq!(health["stages"]["dp5_news"]["status"], "ok");
    assert_eq!(health["stages"]["dp5_news"]["stale"], false);
    assert_eq!(health["stages"]["dp5_news"]["coverage"], json!({"signals": 2, "triggers": 2}));
}

#[test]
fn dp5_without_triggers_publishes_degraded_empty_file() {
    let fx = Fixture::new();
    let transport = ScriptedTransport::new(vec![]);

    let report = completed(fx.run_stage(
        &NewsSignals,
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(report.summary, "DP5 done status=degraded signals=0");
    assert_eq!(transport.call_count(), 0);

    let doc = fx.read_json(SIGNALS_PATH);
    assert_eq!(doc["meta"]["reason"], "NO_EVENT_TRIGGER");
    assert_eq!(doc["signals"], json!([]));

    let health = fx.health();
    assert_eq!(health["stages"]["dp5_news"]["status"], "degraded");
    assert_eq!(health["stages"]["dp5_news"]["partial"], true);
    assert_eq!(health["stages"]["dp5_news"]["stale"], true);
}

#[test]
fn dp5_without_secret_skips_calls() {
    let fx = Fixture::new();
    write_pulse(&fx, &["AAPL"], "normal");
    let transport = ScriptedTransport::new(vec![]);

    let report = completed(fx.run_stage(&NewsSignals, &transport, Secrets::default()));
    assert_eq!(report.summary, "DP5 done status=degraded signals=0");
    assert_eq!(transport.call_count(), 0);
    assert_eq!(fx.read_json(SIGNALS_PATH)["meta"]["reason"], "MISSING_SECRET:EODHD_API_KEY");
}

#[test]
fn dp5_fetch_failure_keeps_other_tickers() {
    let fx = Fixture::new();
    write_pulse(&fx, &["AAPL", "MSFT"], "normal");
    let transport = ScriptedTransport::new(vec![
        status(404, "not found"),
        ok(r#"[{"title":"Azure growth","date":"2026-01-06T09:00:00+00:00"}]"#),
    ]);

    let report = completed(fx.run_stage(
        &NewsSignals,
        &transport,
        Secrets::default().with("eodhd", "key-e"),
    ));
    assert_eq!(report.summary, "DP5 done status=degraded signals=1");
    assert_eq!(transport.call_count(), 2);

    let doc = fx.read_json(SIGNALS_PATH);
    assert!(doc["meta"]["reason"]
        .as_str()
        .unwrap()
        .starts_with("PROVIDER_FETCH_FAILED:AAPL:HTTP_404"));
    assert_eq!(doc["errors"].as_array().unwrap().len(), 1);
    assert_eq!(doc["signals"][0]["ticker"], "MSFT");

    let manifest = fx.read_json("public/data/v3/news/manifest.json");
    assert_eq!(manifest["meta"]["quality"]["planned_calls"], 2);
    assert_eq!(fx.health()["stages"]["dp5_news"]["status"], "degraded");
}

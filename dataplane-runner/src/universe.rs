//! Symbol universe and locally mirrored bars.
//!
//! The universe lives at `policies/universe/symbol-mapping.json` and maps a
//! canonical id (`US:AAPL`) to the ticker, exchange and per-provider symbol.
//! Local bars are read from `public/data/eod/bars/<TICKER>.json`, either a
//! bare array of bars or `{ "bars": [...] }`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAPPING_PATH: &str = "policies/universe/symbol-mapping.json";
pub const LOCAL_BARS_DIR: &str = "public/data/eod/bars";

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("UNIVERSE_MISSING:{0}")]
    Missing(PathBuf),

    #[error("UNIVERSE_IO:{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("UNIVERSE_INVALID:{path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIds {
    #[serde(default)]
    pub eodhd: Option<String>,
    #[serde(default)]
    pub tiingo: Option<String>,
}

/// One entry of the symbol mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedSymbol {
    pub ticker: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub provider_ids: ProviderIds,
}

fn default_exchange() -> String {
    "US".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMapping {
    #[serde(default)]
    pub schema: Option<String>,
    pub mappings: BTreeMap<String, MappedSymbol>,
}

/// A mapped symbol with its canonical id attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniverseEntry {
    pub canonical_id: String,
    pub ticker: String,
    pub exchange: String,
    pub currency: Option<String>,
    pub provider_ids: ProviderIds,
}

impl UniverseEntry {
    /// EODHD symbol: explicit id, else `TICKER.EXCHANGE`. Class shares use
    /// a dash (`BRK.B.US` becomes `BRK-B.US`).
    pub fn eodhd_symbol(&self) -> String {
        let raw = self
            .provider_ids
            .eodhd
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.ticker, self.exchange));
        let raw = raw.trim().to_ascii_uppercase();
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            [base, class, exchange]
                if class.len() == 1
                    && class.chars().all(|c| c.is_ascii_alphabetic())
                    && (2..=4).contains(&exchange.len()) =>
            {
                format!("{base}-{class}.{exchange}")
            }
            _ => raw,
        }
    }

    /// Tiingo ticker: explicit id, else the lower-cased ticker with dots
    /// replaced by dashes.
    pub fn tiingo_ticker(&self) -> String {
        self.provider_ids
            .tiingo
            .clone()
            .unwrap_or_else(|| self.ticker.to_ascii_lowercase().replace('.', "-"))
    }

    /// File-system safe form of the canonical id.
    pub fn safe_id(&self) -> String {
        safe_id(&self.canonical_id)
    }
}

pub fn safe_id(canonical_id: &str) -> String {
    canonical_id.replace([':', '/'], "__")
}

/// The loaded universe, ordered by canonical id.
#[derive(Debug, Clone)]
pub struct Universe {
    entries: Vec<UniverseEntry>,
}

impl Universe {
    pub fn load(root: &Path) -> Result<Self, UniverseError> {
        let path = root.join(MAPPING_PATH);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UniverseError::Missing(path))
            }
            Err(source) => return Err(UniverseError::Io { path, source }),
        };
        let mapping: SymbolMapping = serde_json::from_str(&text)
            .map_err(|source| UniverseError::Invalid { path, source })?;
        Ok(Self::from_mapping(mapping))
    }

    pub fn from_mapping(mapping: SymbolMapping) -> Self {
        let entries = mapping
            .mappings
            .into_iter()
            .map(|(canonical_id, m)| UniverseEntry {
                canonical_id,
                ticker: m.ticker,
                exchange: m.exchange,
                currency: m.currency,
                provider_ids: m.provider_ids,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[UniverseEntry] {
        &self.entries
    }

    /// Entries listed on `exchange` (case-insensitive).
    pub fn for_exchange(&self, exchange: &str) -> Vec<&UniverseEntry> {
        self.entries
            .iter()
            .filter(|e| e.exchange.eq_ignore_ascii_case(exchange))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A bar from the local mirror. Prices other than `close` may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalBar {
    pub date: String,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    pub close: f64,
    #[serde(default, alias = "adjClose", alias = "adjusted_close")]
    pub adj_close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl LocalBar {
    pub fn trading_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.date.get(..10)?, "%Y-%m-%d").ok()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BarsFile {
    List(Vec<serde_json::Value>),
    Wrapped { bars: Vec<serde_json::Value> },
}

pub fn local_bars_path(root: &Path, ticker: &str) -> PathBuf {
    root.join(LOCAL_BARS_DIR).join(format!("{ticker}.json"))
}

/// Load local bars for `ticker`, sorted by date. Missing or unreadable
/// files yield no bars; rows without a valid date or finite close are
/// dropped.
pub fn load_local_bars(root: &Path, ticker: &str) -> Vec<LocalBar> {
    let path = local_bars_path(root, ticker);
    let Some(file) = dataplane_core::store::read_json_lenient::<BarsFile>(&path) else {
        return Vec::new();
    };
    let rows = match file {
        BarsFile::List(rows) | BarsFile::Wrapped { bars: rows } => rows,
    };
    let mut bars: Vec<LocalBar> = rows
        .into_iter()
        .filter_map(|row| serde_json::from_value::<LocalBar>(row).ok())
        .filter(|bar| bar.trading_date().is_some() && bar.close.is_finite())
        .map(|mut bar| {
            bar.date.truncate(10);
            bar
        })
        .collect();
    bars.sort_by(|a, b| a.date.cmp(&b.date));
    bars
}

use crate::data::HistorySource;
use chrono::NaiveDate;
use chrono_tz::Europe::Warsaw;
use std::path::PathBuf;
use tracing::warn;

/// Runtime settings read from the environment (and `.env`, loaded in `main`).
#[derive(Clone, Debug)]
pub struct DashboardSettings {
    pub quandl_api_key: Option<String>,
    pub currconv_api_key: Option<String>,
    pub cache_dir: PathBuf,
    pub cache_ttl_secs: u64,
    pub http_timeout_secs: u64,
    pub retry_attempts: usize,
    pub history_sources: Vec<HistorySource>,
    pub metadata_url: String,
}

impl DashboardSettings {
    pub fn from_env() -> Self {
        let history_sources = match std::env::var("WSE_DASHBOARD_HISTORY_SOURCES") {
            Ok(raw) => parse_history_sources(&raw),
            Err(_) => DEFAULT_HISTORY_SOURCES.to_vec(),
        };

        Self {
            quandl_api_key: non_empty_var("QUANDL_API_KEY"),
            currconv_api_key: non_empty_var("CURRCONV_API_KEY"),
            cache_dir: non_empty_var("WSE_DASHBOARD_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".cache")),
            cache_ttl_secs: parsed_var("WSE_DASHBOARD_CACHE_TTL_SECS").unwrap_or(86_400),
            http_timeout_secs: parsed_var("WSE_DASHBOARD_HTTP_TIMEOUT_SECS")
                .map(|v: u64| v.clamp(1, 120))
                .unwrap_or(15),
            retry_attempts: parsed_var("WSE_DASHBOARD_RETRY_ATTEMPTS")
                .map(|v: usize| v.clamp(1, 8))
                .unwrap_or(3),
            history_sources,
            metadata_url: non_empty_var("WSE_METADATA_URL")
                .unwrap_or_else(|| WSE_METADATA_URL.to_string()),
        }
    }
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            quandl_api_key: None,
            currconv_api_key: None,
            cache_dir: PathBuf::from(".cache"),
            cache_ttl_secs: 86_400,
            http_timeout_secs: 15,
            retry_attempts: 3,
            history_sources: DEFAULT_HISTORY_SOURCES.to_vec(),
            metadata_url: WSE_METADATA_URL.to_string(),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_var(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid number, using the default", key, raw);
            None
        }
    }
}

/// Parses a comma-separated source order such as `stooq,quandl`.
///
/// Unknown names are skipped with a warning; an empty result falls back to the
/// default order.
pub fn parse_history_sources(raw: &str) -> Vec<HistorySource> {
    let mut sources = Vec::new();
    for name in raw.split(',').map(|s| s.trim().to_ascii_lowercase()) {
        if name.is_empty() {
            continue;
        }
        let source = match name.as_str() {
            "quandl" => HistorySource::Quandl,
            "stooq" => HistorySource::Stooq,
            other => {
                warn!(
                    "Unknown history source '{}' in WSE_DASHBOARD_HISTORY_SOURCES; allowed values: quandl | stooq",
                    other
                );
                continue;
            }
        };
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    if sources.is_empty() {
        warn!("No usable history sources configured; using default order quandl,stooq");
        return DEFAULT_HISTORY_SOURCES.to_vec();
    }
    sources
}

/// Today's date on the exchange's clock.
pub fn exchange_today() -> NaiveDate {
    chrono::Utc::now().with_timezone(&Warsaw).date_naive()
}

/// Wall-clock time on the exchange's clock, formatted `HH:MM:SS`.
pub fn exchange_clock() -> String {
    chrono::Utc::now()
        .with_timezone(&Warsaw)
        .format("%H:%M:%S")
        .to_string()
}

pub const DEFAULT_HISTORY_SOURCES: &[HistorySource] = &[HistorySource::Quandl, HistorySource::Stooq];

pub const WSE_METADATA_URL: &str =
    "https://raw.githubusercontent.com/wieckiewiczpiotr/sample/master/WSE_metadata.csv";

// ── Top panel ───────────────────────────────────────────────────────────────
/// Indices shown in the top panel when the live quote source answers.
pub const INDICES: &[&str] = &["WIG30", "MWIG40", "SWIG80", "WIG_GAMES", "WIG_BANKI", "WIG_SPOZYW"];
/// Indices shown when falling back to the history source.
pub const FALLBACK_INDICES: &[&str] = &["WIG", "WIG20", "MWIG40", "SWIG80", "WIG_ODZIEZ", "WIG_LEKI"];
/// Days of history requested to find the latest index close in the fallback path.
pub const FALLBACK_INDEX_LOOKBACK_DAYS: i64 = 5;
/// Currencies quoted against PLN in the top panel.
pub const SPOT_CURRENCIES: &[&str] = &["USD", "EUR", "CHF", "GBP"];
pub const INDEX_REFRESH_SECS: u64 = 120;
pub const RATES_REFRESH_SECS: u64 = 900;

// ── Charts ──────────────────────────────────────────────────────────────────
pub const DEFAULT_TICKERS: &[&str] = &["KGHM", "KRUK", "TSGAMES"];
pub const DEFAULT_CANDLE_TICKER: &str = "KRUK";
pub const DEFAULT_CURRENCIES: &[&str] = &["USD", "EUR", "CHF", "GBP"];
/// Default date range for stock charts, ending today.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 365;
/// NBP serves at most a year of rates per request.
pub const CURRENCY_HISTORY_DAYS: i64 = 364;

// ── Portfolio sampler ───────────────────────────────────────────────────────
pub const MIN_SAMPLES: usize = 100;
pub const MAX_SAMPLES: usize = 8000;
pub const SAMPLES_STEP: usize = 100;
pub const DEFAULT_SAMPLES: usize = 3000;

use crate::client::MarketClient;
use crate::sources::first_success;
use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Providers of daily OHLC history for WSE tickers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Quandl,
    Stooq,
}

impl fmt::Display for HistorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quandl => write!(f, "quandl"),
            Self::Stooq => write!(f, "stooq"),
        }
    }
}

/// Represents a single daily candlestick (OHLCV).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Daily history for one security, sorted by date ascending.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    pub source: String,
    pub history: Vec<Candle>,
}

impl PriceSeries {
    pub fn new(symbol: &str, source: &str, mut history: Vec<Candle>) -> Self {
        history.sort_by_key(|c| c.date);
        history.dedup_by_key(|c| c.date);
        Self {
            symbol: symbol.to_uppercase(),
            source: source.to_string(),
            history,
        }
    }

    /// `(date, close)` pairs in date order.
    pub fn closes(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.history.iter().map(|c| (c.date, c.close))
    }

    pub fn latest_close(&self) -> Option<f64> {
        self.history.last().map(|c| c.close)
    }
}

// ── Quandl ──────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct QuandlResponse {
    dataset: QuandlDataset,
}

#[derive(Deserialize, Debug)]
struct QuandlDataset {
    column_names: Vec<String>,
    data: Vec<Vec<serde_json::Value>>,
}

fn quandl_url(ticker: &str, start: NaiveDate, end: NaiveDate, api_key: &str) -> String {
    format!(
        "https://www.quandl.com/api/v3/datasets/WSE/{}.json?start_date={}&end_date={}&api_key={}",
        ticker,
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d"),
        api_key
    )
}

/// Parses a Quandl `WSE/<ticker>` dataset. Rows arrive newest first.
pub fn parse_quandl_dataset(ticker: &str, body: &str) -> Result<PriceSeries> {
    let parsed: QuandlResponse =
        serde_json::from_str(body).context("unexpected Quandl response shape")?;
    let dataset = parsed.dataset;

    let column = |name: &str| {
        dataset
            .column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    };
    let date_idx = column("Date").ok_or(anyhow!("Quandl dataset has no Date column"))?;
    let close_idx = column("Close").ok_or(anyhow!("Quandl dataset has no Close column"))?;
    let open_idx = column("Open");
    let high_idx = column("High");
    let low_idx = column("Low");
    let volume_idx = column("Volume");

    let number = |row: &[serde_json::Value], idx: Option<usize>| {
        idx.and_then(|i| row.get(i)).and_then(|v| v.as_f64())
    };

    let mut history = Vec::with_capacity(dataset.data.len());
    for row in dataset.data.iter().map(Vec::as_slice) {
        let Some(date) = row
            .get(date_idx)
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        else {
            continue;
        };
        let Some(close) = number(row, Some(close_idx)) else {
            continue;
        };
        history.push(Candle {
            date,
            open: number(row, open_idx).unwrap_or(close),
            high: number(row, high_idx).unwrap_or(close),
            low: number(row, low_idx).unwrap_or(close),
            close,
            volume: number(row, volume_idx).unwrap_or(0.0),
        });
    }

    if history.is_empty() {
        bail!("no Quandl rows for {}", ticker);
    }
    Ok(PriceSeries::new(ticker, "quandl", history))
}

async fn fetch_quandl(
    client: &MarketClient,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<PriceSeries> {
    let api_key = client
        .settings()
        .quandl_api_key
        .clone()
        .ok_or(anyhow!("QUANDL_API_KEY is not set"))?;
    let body = client.get_text(&quandl_url(ticker, start, end, &api_key)).await?;
    parse_quandl_dataset(ticker, &body)
}

// ── Stooq ───────────────────────────────────────────────────────────────────

fn stooq_url(ticker: &str, start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "https://stooq.com/q/d/l/?s={}&d1={}&d2={}&i=d",
        ticker.to_ascii_lowercase(),
        start.format("%Y%m%d"),
        end.format("%Y%m%d")
    )
}

fn header_index(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

/// Parses Stooq's daily CSV download. Both the English and the Polish header
/// variants are accepted.
pub fn parse_stooq_csv(ticker: &str, body: &str) -> Result<PriceSeries> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("no data") || trimmed.eq_ignore_ascii_case("brak danych") {
        bail!("Stooq has no data for {}", ticker);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(trimmed.as_bytes());
    let headers = reader.headers()?.clone();

    let date_idx = header_index(&headers, &["Date", "Data"])
        .ok_or(anyhow!("Stooq CSV for {} has no date column", ticker))?;
    let close_idx = header_index(&headers, &["Close", "Zamkniecie"])
        .ok_or(anyhow!("Stooq CSV for {} has no close column", ticker))?;
    let open_idx = header_index(&headers, &["Open", "Otwarcie"]);
    let high_idx = header_index(&headers, &["High", "Najwyzszy"]);
    let low_idx = header_index(&headers, &["Low", "Najnizszy"]);
    let volume_idx = header_index(&headers, &["Volume", "Wolumen"]);

    let mut history = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
        };
        let Some(date) = record
            .get(date_idx)
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        else {
            continue;
        };
        let Some(close) = field(Some(close_idx)) else {
            continue;
        };
        history.push(Candle {
            date,
            open: field(open_idx).unwrap_or(close),
            high: field(high_idx).unwrap_or(close),
            low: field(low_idx).unwrap_or(close),
            close,
            volume: field(volume_idx).unwrap_or(0.0),
        });
    }

    if history.is_empty() {
        bail!("no Stooq rows for {}", ticker);
    }
    Ok(PriceSeries::new(ticker, "stooq", history))
}

async fn fetch_stooq(
    client: &MarketClient,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<PriceSeries> {
    let body = client.get_text(&stooq_url(ticker, start, end)).await?;
    parse_stooq_csv(ticker, &body)
}

async fn fetch_from_source(
    client: &MarketClient,
    source: HistorySource,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<PriceSeries> {
    match source {
        HistorySource::Quandl => fetch_quandl(client, ticker, start, end).await,
        HistorySource::Stooq => fetch_stooq(client, ticker, start, end).await,
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

pub(crate) fn cache_file(cache_dir: &Path, ticker: &str, start: NaiveDate, end: NaiveDate) -> PathBuf {
    cache_dir.join(format!(
        "{}_{}_{}.json",
        ticker,
        start.format("%Y%m%d"),
        end.format("%Y%m%d")
    ))
}

fn cache_age_secs(path: &Path) -> Result<u64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(std::time::SystemTime::now()
        .duration_since(modified)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

fn read_cache(path: &Path) -> Result<PriceSeries> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub(crate) fn write_cache(cache_dir: &Path, path: &Path, series: &PriceSeries) -> Result<()> {
    if !cache_dir.exists() {
        std::fs::create_dir_all(cache_dir)?;
    }
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, series)?;
    Ok(())
}

/// Entries older than this many TTLs are deleted when a new one is written.
const CACHE_PRUNE_TTLS: u64 = 7;
/// Pruning never removes entries younger than a week.
const CACHE_PRUNE_MIN_AGE_SECS: u64 = 7 * 86_400;

fn prune_age_secs(ttl_secs: u64) -> u64 {
    ttl_secs
        .saturating_mul(CACHE_PRUNE_TTLS)
        .max(CACHE_PRUNE_MIN_AGE_SECS)
}

/// Deletes `.json` entries in `cache_dir` older than `max_age_secs`.
/// Returns how many were removed.
fn prune_cache(cache_dir: &Path, max_age_secs: u64) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(cache_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if matches!(cache_age_secs(&path), Ok(age) if age > max_age_secs) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Returns the cached series when it is younger than `ttl_secs`.
fn fresh_cache(path: &Path, ttl_secs: u64) -> Option<PriceSeries> {
    if !path.exists() {
        return None;
    }
    match cache_age_secs(path) {
        Ok(age) if age < ttl_secs => read_cache(path).ok(),
        _ => None,
    }
}

/// Fetches daily history for `ticker` over `[start, end]`, trying the
/// configured sources in order.
///
/// Results are cached on disk; a stale entry is served when every source fails.
pub async fn fetch_history(
    client: &MarketClient,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<PriceSeries> {
    let ticker = ticker.trim().to_uppercase();
    if ticker.is_empty() {
        bail!("ticker cannot be empty");
    }
    if start > end {
        bail!("start date {} is after end date {}", start, end);
    }

    let settings = client.settings();
    let path = cache_file(&settings.cache_dir, &ticker, start, end);

    if let Some(series) = fresh_cache(&path, settings.cache_ttl_secs) {
        info!("Loading {} from cache...", ticker);
        return Ok(series);
    }

    info!("Cache miss for {}, fetching...", ticker);
    let what = format!("history for {}", ticker);
    match first_success(&what, &settings.history_sources, |source| {
        fetch_from_source(client, source, &ticker, start, end)
    })
    .await
    {
        Ok((_, series)) => {
            if let Err(err) = write_cache(&settings.cache_dir, &path, &series) {
                warn!("Failed to write cache for {}: {}", ticker, err);
            }
            match prune_cache(&settings.cache_dir, prune_age_secs(settings.cache_ttl_secs)) {
                Ok(0) => {}
                Ok(removed) => debug!("Pruned {} expired cache entries", removed),
                Err(err) => warn!("Failed to prune cache: {}", err),
            }
            Ok(series)
        }
        Err(all_failed) => {
            if path.exists() {
                if let Ok(series) = read_cache(&path) {
                    warn!("All history sources failed for {}, using stale cache", ticker);
                    return Ok(series);
                }
            }
            Err(all_failed.into())
        }
    }
}

/// Fetches several tickers one after another; duplicates are fetched once.
pub async fn fetch_histories(
    client: &MarketClient,
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<PriceSeries>> {
    let mut out: Vec<PriceSeries> = Vec::with_capacity(tickers.len());
    for ticker in tickers {
        let symbol = ticker.trim().to_uppercase();
        if out.iter().any(|s| s.symbol == symbol) {
            continue;
        }
        let series = fetch_history(client, &symbol, start, end)
            .await
            .with_context(|| format!("historical fetch failed for {}", symbol))?;
        out.push(series);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_quandl_sorts_ascending() {
        let body = r#"{"dataset":{"column_names":["Date","Open","High","Low","Close","%Change","Volume"],
            "data":[["2020-01-03",101.0,103.0,100.0,102.5,1.2,5000.0],
                    ["2020-01-02",99.0,101.5,98.0,101.0,null,null]]}}"#;
        let series = parse_quandl_dataset("kghm", body).unwrap();

        assert_eq!(series.symbol, "KGHM");
        assert_eq!(series.source, "quandl");
        assert_eq!(series.history.len(), 2);
        assert_eq!(series.history[0].date, d(2020, 1, 2));
        assert_eq!(series.history[0].volume, 0.0);
        assert_eq!(series.latest_close(), Some(102.5));
    }

    #[test]
    fn test_parse_quandl_without_close_is_error() {
        let body = r#"{"dataset":{"column_names":["Date","Open"],"data":[["2020-01-02",1.0]]}}"#;
        assert!(parse_quandl_dataset("KGHM", body).is_err());
    }

    #[test]
    fn test_parse_stooq_english_header() {
        let body = "Date,Open,High,Low,Close,Volume\n\
                    2021-03-01,150.1,152.0,149.0,151.2,120000\n\
                    2021-03-02,151.2,153.4,150.5,153.0,98000\n";
        let series = parse_stooq_csv("KRUK", body).unwrap();

        assert_eq!(series.source, "stooq");
        let closes: Vec<_> = series.closes().collect();
        assert_eq!(closes, vec![(d(2021, 3, 1), 151.2), (d(2021, 3, 2), 153.0)]);
        assert_eq!(series.history[1].volume, 98000.0);
    }

    #[test]
    fn test_parse_stooq_polish_header_without_volume() {
        let body = "Data,Otwarcie,Najwyzszy,Najnizszy,Zamkniecie\n2021-03-01,10,11,9,10.5\n";
        let series = parse_stooq_csv("wig20", body).unwrap();
        assert_eq!(series.symbol, "WIG20");
        assert_eq!(series.history[0].close, 10.5);
        assert_eq!(series.history[0].volume, 0.0);
    }

    #[test]
    fn test_parse_stooq_no_data() {
        assert!(parse_stooq_csv("XXX", "No data").is_err());
        assert!(parse_stooq_csv("XXX", "Date,Open,High,Low,Close,Volume\n").is_err());
    }

    #[test]
    fn test_price_series_dedups_dates() {
        let candle = |day, close| Candle {
            date: d(2022, 5, day),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        };
        let series = PriceSeries::new("abc", "stooq", vec![candle(3, 3.0), candle(2, 2.0), candle(3, 3.0)]);
        assert_eq!(series.history.len(), 2);
        assert_eq!(series.history[0].close, 2.0);
    }

    #[test]
    fn test_cache_round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_file(dir.path(), "KGHM", d(2020, 1, 1), d(2020, 12, 31));
        let series = parse_stooq_csv("KGHM", "Date,Close\n2020-01-02,100\n").unwrap();

        write_cache(dir.path(), &path, &series).unwrap();
        let cached = fresh_cache(&path, 3600).unwrap();
        assert_eq!(cached.history, series.history);

        assert!(fresh_cache(&path, 0).is_none(), "zero TTL should treat the entry as stale");
    }

    #[tokio::test]
    async fn test_fetch_history_serves_stale_cache_when_sources_fail() {
        let dir = tempfile::tempdir().unwrap();
        let settings = crate::config::DashboardSettings {
            cache_dir: dir.path().to_path_buf(),
            cache_ttl_secs: 0,
            quandl_api_key: None,
            history_sources: vec![HistorySource::Quandl],
            ..crate::config::DashboardSettings::default()
        };
        let (start, end) = (d(2020, 1, 1), d(2020, 1, 31));
        let series = parse_stooq_csv("KGHM", "Date,Close\n2020-01-02,100\n2020-01-03,101\n").unwrap();
        write_cache(dir.path(), &cache_file(dir.path(), "KGHM", start, end), &series).unwrap();

        let client = MarketClient::new(settings).unwrap();
        let served = fetch_history(&client, "kghm", start, end).await.unwrap();
        assert_eq!(served.symbol, "KGHM");
        assert_eq!(served.history, series.history);

        // Without a stale entry the aggregate failure surfaces.
        let missing = fetch_history(&client, "KRUK", start, end).await.unwrap_err();
        assert!(missing.to_string().contains("all sources failed"));
    }

    #[test]
    fn test_prune_cache_removes_only_old_json() {
        let dir = tempfile::tempdir().unwrap();
        let series = parse_stooq_csv("KGHM", "Date,Close\n2020-01-02,100\n").unwrap();
        let old = cache_file(dir.path(), "KGHM", d(2020, 1, 1), d(2020, 1, 31));
        let fresh = cache_file(dir.path(), "KGHM", d(2020, 2, 1), d(2020, 2, 29));
        write_cache(dir.path(), &old, &series).unwrap();
        write_cache(dir.path(), &fresh, &series).unwrap();
        let other = dir.path().join("notes.txt");
        std::fs::write(&other, "keep").unwrap();

        let month_ago = std::time::SystemTime::now() - std::time::Duration::from_secs(30 * 86_400);
        for path in [&old, &other] {
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(month_ago)
                .unwrap();
        }

        let removed = prune_cache(dir.path(), prune_age_secs(86_400)).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_prune_age_has_floor() {
        assert_eq!(prune_age_secs(0), CACHE_PRUNE_MIN_AGE_SECS);
        assert_eq!(prune_age_secs(86_400 * 2), 86_400 * 14);
    }

    #[tokio::test]
    async fn test_fetch_history_rejects_bad_input() {
        let client = MarketClient::new(crate::config::DashboardSettings::default()).unwrap();
        assert!(fetch_history(&client, "  ", d(2020, 1, 1), d(2020, 2, 1)).await.is_err());
        assert!(fetch_history(&client, "KGHM", d(2020, 2, 1), d(2020, 1, 1)).await.is_err());
    }
}

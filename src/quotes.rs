use crate::client::MarketClient;
use crate::config::{self, FALLBACK_INDEX_LOOKBACK_DAYS, FALLBACK_INDICES, INDICES};
use crate::data;
use crate::sources::{AllSourcesFailed, first_success};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ──────────────────────────────────────────────────────────────────────────────
// NBP exchange rates
// ──────────────────────────────────────────────────────────────────────────────

const NBP_BASE: &str = "https://api.nbp.pl/api/exchangerates";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NbpRate {
    pub currency: String,
    pub code: String,
    pub mid: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NbpTable {
    #[serde(rename = "effectiveDate")]
    pub effective_date: NaiveDate,
    pub rates: Vec<NbpRate>,
}

impl NbpTable {
    pub fn mid(&self, code: &str) -> Option<f64> {
        self.rates
            .iter()
            .find(|r| r.code.eq_ignore_ascii_case(code))
            .map(|r| r.mid)
    }
}

#[derive(Deserialize, Debug)]
struct NbpSeriesResponse {
    currency: String,
    code: String,
    rates: Vec<NbpSeriesPoint>,
}

#[derive(Deserialize, Debug)]
struct NbpSeriesPoint {
    #[serde(rename = "effectiveDate")]
    effective_date: NaiveDate,
    mid: f64,
}

/// Mid rates of one currency against PLN, oldest first.
#[derive(Clone, Debug, Serialize)]
pub struct RateSeries {
    pub code: String,
    pub currency: String,
    pub points: Vec<(NaiveDate, f64)>,
}

/// Parses the latest table A, which NBP wraps in a one-element array.
pub fn parse_nbp_table(body: &str) -> Result<NbpTable> {
    let tables: Vec<NbpTable> = serde_json::from_str(body).context("unexpected NBP table shape")?;
    tables
        .into_iter()
        .next()
        .ok_or(anyhow!("NBP returned no exchange-rate table"))
}

pub fn parse_nbp_series(body: &str) -> Result<RateSeries> {
    let parsed: NbpSeriesResponse = serde_json::from_str(body).context("unexpected NBP rates shape")?;
    let mut points: Vec<(NaiveDate, f64)> = parsed
        .rates
        .into_iter()
        .map(|p| (p.effective_date, p.mid))
        .collect();
    points.sort_by_key(|p| p.0);
    Ok(RateSeries {
        code: parsed.code.to_uppercase(),
        currency: parsed.currency,
        points,
    })
}

pub async fn fetch_nbp_table(client: &MarketClient) -> Result<NbpTable> {
    let body = client
        .get_text(&format!("{}/tables/a/?format=json", NBP_BASE))
        .await?;
    parse_nbp_table(&body)
}

/// Daily mid rates for `code` over `[start, end]`.
pub async fn fetch_currency_history(
    client: &MarketClient,
    code: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<RateSeries> {
    let code = code.trim().to_uppercase();
    if code.is_empty() {
        bail!("currency code cannot be empty");
    }
    let url = format!(
        "{}/rates/a/{}/{}/{}/?format=json",
        NBP_BASE,
        code,
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    );
    let body = client
        .get_text(&url)
        .await
        .with_context(|| format!("NBP history fetch failed for {}", code))?;
    parse_nbp_series(&body)
}

// ──────────────────────────────────────────────────────────────────────────────
// Spot rates (top panel)
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    CurrencyConverter,
    Nbp,
}

impl fmt::Display for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CurrencyConverter => write!(f, "currconv"),
            Self::Nbp => write!(f, "nbp"),
        }
    }
}

impl RateSource {
    /// Decimal places the source publishes.
    pub fn decimals(self) -> usize {
        match self {
            Self::CurrencyConverter => 5,
            Self::Nbp => 4,
        }
    }
}

/// PLN price of one unit of each currency, in request order.
#[derive(Clone, Debug, Serialize)]
pub struct SpotRates {
    pub source: RateSource,
    pub rates: Vec<(String, f64)>,
}

/// Parses a `compact=ultra` answer such as `{"USD_PLN":3.97,"EUR_PLN":4.41}`.
pub fn parse_currconv(body: &str, codes: &[&str]) -> Result<Vec<(String, f64)>> {
    let parsed: HashMap<String, f64> =
        serde_json::from_str(body).context("unexpected currconv response shape")?;
    codes
        .iter()
        .map(|code| {
            let pair = format!("{}_PLN", code);
            parsed
                .get(&pair)
                .map(|rate| (code.to_string(), *rate))
                .ok_or(anyhow!("currconv response lacks {}", pair))
        })
        .collect()
}

async fn fetch_currconv(client: &MarketClient, codes: &[&str]) -> Result<Vec<(String, f64)>> {
    let api_key = client
        .settings()
        .currconv_api_key
        .clone()
        .ok_or(anyhow!("CURRCONV_API_KEY is not set"))?;

    // The free tier answers at most two pairs per request.
    let mut out = Vec::with_capacity(codes.len());
    for chunk in codes.chunks(2) {
        let query = chunk
            .iter()
            .map(|c| format!("{}_PLN", c))
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "https://free.currconv.com/api/v7/convert?q={}&compact=ultra&apiKey={}",
            query, api_key
        );
        let body = client.get_text(&url).await?;
        out.extend(parse_currconv(&body, chunk)?);
    }
    Ok(out)
}

async fn fetch_nbp_spot(client: &MarketClient, codes: &[&str]) -> Result<Vec<(String, f64)>> {
    let table = fetch_nbp_table(client).await?;
    codes
        .iter()
        .map(|code| {
            table
                .mid(code)
                .map(|mid| (code.to_string(), mid))
                .ok_or(anyhow!("NBP table {} lacks {}", table.effective_date, code))
        })
        .collect()
}

pub async fn fetch_spot_rates(client: &MarketClient, codes: &[&str]) -> Result<SpotRates, AllSourcesFailed> {
    let (source, rates) = first_success(
        "exchange rates",
        &[RateSource::CurrencyConverter, RateSource::Nbp],
        |source| async move {
            match source {
                RateSource::CurrencyConverter => fetch_currconv(client, codes).await,
                RateSource::Nbp => fetch_nbp_spot(client, codes).await,
            }
        },
    )
    .await?;
    Ok(SpotRates { source, rates })
}

// ──────────────────────────────────────────────────────────────────────────────
// Index quotes (top panel)
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexQuoteSource {
    StooqQuotes,
    History,
}

impl fmt::Display for IndexQuoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StooqQuotes => write!(f, "stooq-quotes"),
            Self::History => write!(f, "history"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexQuote {
    pub name: String,
    pub value: f64,
    /// Absolute change against the previous close, when the source has it.
    pub change: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct IndexBoard {
    pub source: IndexQuoteSource,
    pub quotes: Vec<IndexQuote>,
}

impl IndexBoard {
    /// Deltas are only shown when every index has one.
    pub fn has_all_changes(&self) -> bool {
        !self.quotes.is_empty() && self.quotes.iter().all(|q| q.change.is_some())
    }
}

fn stooq_quotes_url(indices: &[&str]) -> String {
    let symbols = indices
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("+");
    format!("https://stooq.com/q/l/?s={}&f=sd2t2ohlcp&h&e=csv", symbols)
}

/// Parses Stooq's quote CSV. Every requested index needs a close; the change
/// is derived from the previous-close column when it is present.
pub fn parse_stooq_quotes(body: &str, indices: &[&str]) -> Result<Vec<IndexQuote>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.trim().as_bytes());
    let headers = reader.headers()?.clone();
    let column = |names: &[&str]| {
        headers
            .iter()
            .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
    };
    let symbol_idx = column(&["Symbol"]).ok_or(anyhow!("quote CSV has no Symbol column"))?;
    let close_idx = column(&["Close", "Zamkniecie"]).ok_or(anyhow!("quote CSV has no Close column"))?;
    let prev_idx = column(&["Prev", "Previous", "Prev Close", "Poprzednie"]);

    let mut rows: HashMap<String, (Option<f64>, Option<f64>)> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let number = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
        };
        if let Some(symbol) = record.get(symbol_idx) {
            rows.insert(
                symbol.trim().to_ascii_uppercase(),
                (number(Some(close_idx)), number(prev_idx)),
            );
        }
    }

    indices
        .iter()
        .map(|name| -> Result<IndexQuote> {
            let (close, prev) = rows
                .get(&name.to_ascii_uppercase())
                .copied()
                .ok_or(anyhow!("no quote row for {}", name))?;
            let value = close.ok_or(anyhow!("no close for {}", name))?;
            Ok(IndexQuote {
                name: name.to_string(),
                value,
                change: prev.map(|p| value - p),
            })
        })
        .collect()
}

async fn fetch_stooq_quotes(client: &MarketClient) -> Result<Vec<IndexQuote>> {
    let body = client.get_text(&stooq_quotes_url(INDICES)).await?;
    parse_stooq_quotes(&body, INDICES)
}

/// Latest close of each fallback index from the history sources.
async fn fetch_index_closes(client: &MarketClient) -> Result<Vec<IndexQuote>> {
    let end = config::exchange_today();
    let start = end - Duration::days(FALLBACK_INDEX_LOOKBACK_DAYS);
    let mut quotes = Vec::with_capacity(FALLBACK_INDICES.len());
    for name in FALLBACK_INDICES {
        let series = data::fetch_history(client, name, start, end).await?;
        let value = series
            .latest_close()
            .ok_or(anyhow!("no recent close for {}", name))?;
        quotes.push(IndexQuote {
            name: name.to_string(),
            value,
            change: None,
        });
    }
    Ok(quotes)
}

pub async fn fetch_index_board(client: &MarketClient) -> Result<IndexBoard, AllSourcesFailed> {
    let (source, quotes) = first_success(
        "index quotes",
        &[IndexQuoteSource::StooqQuotes, IndexQuoteSource::History],
        |source| async move {
            match source {
                IndexQuoteSource::StooqQuotes => fetch_stooq_quotes(client).await,
                IndexQuoteSource::History => fetch_index_closes(client).await,
            }
        },
    )
    .await?;
    Ok(IndexBoard { source, quotes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nbp_table_and_lookup() {
        let body = r#"[{"table":"A","no":"1/A/NBP/2024","effectiveDate":"2024-01-02",
            "rates":[{"currency":"dolar amerykański","code":"USD","mid":3.9432},
                     {"currency":"euro","code":"EUR","mid":4.3434}]}]"#;
        let table = parse_nbp_table(body).unwrap();
        assert_eq!(table.effective_date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(table.mid("eur"), Some(4.3434));
        assert_eq!(table.mid("CHF"), None);
    }

    #[test]
    fn test_parse_nbp_table_empty_array() {
        assert!(parse_nbp_table("[]").is_err());
    }

    #[test]
    fn test_parse_nbp_series_sorted() {
        let body = r#"{"table":"A","currency":"frank szwajcarski","code":"CHF",
            "rates":[{"no":"2/A/NBP/2024","effectiveDate":"2024-01-03","mid":4.65},
                     {"no":"1/A/NBP/2024","effectiveDate":"2024-01-02","mid":4.66}]}"#;
        let series = parse_nbp_series(body).unwrap();
        assert_eq!(series.code, "CHF");
        assert_eq!(series.points[0].1, 4.66);
        assert_eq!(series.points.len(), 2);
    }

    #[test]
    fn test_parse_currconv_in_request_order() {
        let body = r#"{"EUR_PLN":4.41231,"USD_PLN":3.97112}"#;
        let rates = parse_currconv(body, &["USD", "EUR"]).unwrap();
        assert_eq!(rates, vec![("USD".to_string(), 3.97112), ("EUR".to_string(), 4.41231)]);
        assert!(parse_currconv(body, &["GBP"]).is_err());
    }

    #[test]
    fn test_parse_stooq_quotes_with_previous_close() {
        let body = "Symbol,Date,Time,Open,High,Low,Close,Prev\n\
                    WIG30,2024-05-06,17:15:00,3100,3150,3090,3140,3120\n\
                    MWIG40,2024-05-06,17:15:00,6000,6050,5990,6010,6020\n";
        let quotes = parse_stooq_quotes(body, &["WIG30", "MWIG40"]).unwrap();
        assert_eq!(quotes[0].value, 3140.0);
        assert_eq!(quotes[0].change, Some(20.0));
        assert_eq!(quotes[1].change, Some(-10.0));
    }

    #[test]
    fn test_parse_stooq_quotes_without_change_column() {
        let body = "Symbol,Date,Time,Open,High,Low,Close\nWIG30,2024-05-06,17:15:00,1,2,1,1.5\n";
        let quotes = parse_stooq_quotes(body, &["wig30"]).unwrap();
        assert_eq!(quotes[0].change, None);
        let board = IndexBoard {
            source: IndexQuoteSource::StooqQuotes,
            quotes,
        };
        assert!(!board.has_all_changes());
    }

    #[test]
    fn test_parse_stooq_quotes_missing_index_is_error() {
        let body = "Symbol,Date,Time,Open,High,Low,Close\nWIG30,N/D,N/D,N/D,N/D,N/D,N/D\n";
        assert!(parse_stooq_quotes(body, &["WIG30"]).is_err());
        assert!(parse_stooq_quotes(body, &["SWIG80"]).is_err());
    }

    #[test]
    fn test_rate_source_decimals() {
        assert_eq!(RateSource::CurrencyConverter.decimals(), 5);
        assert_eq!(RateSource::Nbp.decimals(), 4);
    }
}

use crate::chart::{self, Figure};
use crate::client::MarketClient;
use crate::config::{
    self, CURRENCY_HISTORY_DAYS, DEFAULT_LOOKBACK_DAYS, DEFAULT_SAMPLES, MAX_SAMPLES, MIN_SAMPLES,
    SPOT_CURRENCIES,
};
use crate::data;
use crate::portfolio::{self, SampleSet, WeightScheme};
use crate::quotes;
use crate::reference::{ReferenceTables, SelectOption};
use crate::returns::{LogReturnMatrix, ReturnStatistics};
use crate::sources::SourceFailure;
use anyhow::{Result, bail};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const INDEX_ERROR: &str = "Could not connect to stooq to get index data";
const RATES_ERROR: &str = "Could not connect to API to get exchange rates data";

/// Inclusive date window for historical charts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// The last year ending today on the exchange's clock.
    pub fn last_year() -> Self {
        let end = config::exchange_today();
        Self {
            start: end - Duration::days(DEFAULT_LOOKBACK_DAYS),
            end,
        }
    }

    /// Fills missing bounds from the default window and rejects inverted ranges.
    pub fn resolve(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<Self> {
        let default = Self::last_year();
        let end = end.unwrap_or(default.end);
        let start = start.unwrap_or(end - Duration::days(DEFAULT_LOOKBACK_DAYS));
        if start > end {
            bail!("start date {} is after end date {}", start, end);
        }
        Ok(Self { start, end })
    }
}

/// A top-bar panel together with the time it was produced.
#[derive(Clone, Debug, Serialize)]
pub struct PanelUpdate {
    pub figure: Figure,
    pub last_update: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SourceFailure>,
}

impl PanelUpdate {
    fn now(figure: Figure, source: Option<String>, failures: Vec<SourceFailure>) -> Self {
        Self {
            figure,
            last_update: format!("Last update: {}", config::exchange_clock()),
            source,
            failures,
        }
    }
}

/// Inputs of one Markowitz run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PortfolioRequest {
    pub tickers: Vec<String>,
    #[serde(default)]
    pub samples: Option<usize>,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub scheme: WeightScheme,
}

#[derive(Clone, Debug, Serialize)]
pub struct PortfolioRun {
    pub range: DateRange,
    pub result: SampleSet,
    pub figure: Figure,
}

/// Trims, uppercases and de-duplicates tickers, keeping selection order.
pub fn normalize_symbols(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for symbol in raw.iter().map(|s| s.trim().to_uppercase()) {
        if !symbol.is_empty() && !out.contains(&symbol) {
            out.push(symbol);
        }
    }
    out
}

/// Sample count as offered by the slider: defaulted and kept within bounds.
pub fn clamp_samples(samples: Option<usize>) -> usize {
    samples.unwrap_or(DEFAULT_SAMPLES).clamp(MIN_SAMPLES, MAX_SAMPLES)
}

/// Turns panel requests into figures: fetch, transform, render.
#[derive(Clone)]
pub struct Dashboard {
    client: MarketClient,
    tables: Arc<ReferenceTables>,
}

impl Dashboard {
    pub fn new(client: MarketClient, tables: Arc<ReferenceTables>) -> Self {
        Self { client, tables }
    }

    /// Builds the client and downloads the reference tables.
    pub async fn connect(settings: config::DashboardSettings) -> Result<Self> {
        let client = MarketClient::new(settings)?;
        let tables = ReferenceTables::load(&client).await?;
        Ok(Self::new(client, Arc::new(tables)))
    }

    pub fn tables(&self) -> &ReferenceTables {
        &self.tables
    }

    /// Index levels. When every source fails the panel carries an error
    /// indicator instead of an error.
    pub async fn index_panel(&self) -> PanelUpdate {
        match quotes::fetch_index_board(&self.client).await {
            Ok(board) => PanelUpdate::now(chart::index_panel(&board), Some(board.source.to_string()), Vec::new()),
            Err(all_failed) => {
                warn!("{}", all_failed);
                PanelUpdate::now(chart::error_panel(INDEX_ERROR, 20), None, all_failed.failures)
            }
        }
    }

    pub async fn rates_panel(&self) -> PanelUpdate {
        match quotes::fetch_spot_rates(&self.client, SPOT_CURRENCIES).await {
            Ok(rates) => PanelUpdate::now(chart::rate_panel(&rates), Some(rates.source.to_string()), Vec::new()),
            Err(all_failed) => {
                warn!("{}", all_failed);
                PanelUpdate::now(chart::error_panel(RATES_ERROR, 14), None, all_failed.failures)
            }
        }
    }

    pub async fn line_chart(&self, tickers: &[String], range: DateRange) -> Result<Figure> {
        let symbols = normalize_symbols(tickers);
        if symbols.is_empty() {
            bail!("at least 1 symbol is required");
        }
        let series = data::fetch_histories(&self.client, &symbols, range.start, range.end).await?;
        Ok(chart::stock_line_chart(&series))
    }

    pub async fn candlestick_chart(&self, ticker: &str, range: DateRange) -> Result<Figure> {
        let series = data::fetch_history(&self.client, ticker, range.start, range.end).await?;
        Ok(chart::candlestick_chart(&series))
    }

    /// Mid-rate history for the selected currencies over the last 364 days.
    pub async fn currency_chart(&self, codes: &[String]) -> Result<Figure> {
        let codes = normalize_symbols(codes);
        if codes.is_empty() {
            bail!("at least 1 currency is required");
        }
        if let Some(unknown) = codes.iter().find(|c| !self.tables.has_currency(c)) {
            bail!("unknown currency {}", unknown);
        }

        let end = config::exchange_today();
        let start = end - Duration::days(CURRENCY_HISTORY_DAYS);
        let mut series = Vec::with_capacity(codes.len());
        for code in &codes {
            series.push(quotes::fetch_currency_history(&self.client, code, start, end).await?);
        }
        Ok(chart::currency_chart(&series))
    }

    /// Fetches closes, derives return statistics, samples random portfolios
    /// and renders the volatility/return scatter.
    pub async fn markowitz(&self, request: &PortfolioRequest) -> Result<PortfolioRun> {
        let symbols = normalize_symbols(&request.tickers);
        if symbols.len() < 2 {
            bail!("at least 2 symbols are required");
        }
        let range = DateRange::resolve(request.start, request.end)?;
        let samples = clamp_samples(request.samples);

        let series = data::fetch_histories(&self.client, &symbols, range.start, range.end).await?;
        let matrix = LogReturnMatrix::from_series(&series)?;
        if matrix.periods() == 0 {
            bail!("no overlapping prices for {} between {} and {}", symbols.join(", "), range.start, range.end);
        }
        let stats = ReturnStatistics::from_matrix(&matrix);
        let result = portfolio::sample_portfolios(&stats, samples, request.scheme, request.seed)?;
        info!(
            "Sampled {} portfolios for {} over {} periods",
            result.samples.len(),
            result.symbols.join(", "),
            result.periods
        );

        let figure = chart::markowitz_scatter(&result);
        Ok(PortfolioRun { range, result, figure })
    }

    pub fn company_options(&self, include_historical: bool) -> Vec<SelectOption> {
        self.tables.company_options(include_historical)
    }

    pub fn currency_options(&self) -> Vec<SelectOption> {
        self.tables.currency_options()
    }

    /// One option per selected ticker, labelled with the company name when known.
    pub fn candle_options(&self, tickers: &[String]) -> Vec<SelectOption> {
        normalize_symbols(tickers)
            .into_iter()
            .map(|code| SelectOption {
                label: self
                    .tables
                    .company(&code)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| code.clone()),
                value: code,
            })
            .collect()
    }
}

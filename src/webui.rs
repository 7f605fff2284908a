use crate::chart::Figure;
use crate::config;
use crate::dashboard::{Dashboard, DateRange, PanelUpdate, PortfolioRequest, PortfolioRun, normalize_symbols};
use crate::reference::SelectOption;
use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");

#[derive(Clone)]
struct WebState {
    dashboard: Dashboard,
    portfolio: Arc<Mutex<PortfolioRuntimeState>>,
}

#[derive(Clone, Debug, Serialize)]
struct ApiError {
    error: String,
}

#[derive(Clone, Debug, Serialize, Default)]
struct PortfolioRuntimeState {
    last_request: Option<PortfolioRequest>,
    last_run: Option<PortfolioRun>,
    last_error: Option<String>,
    updated_at: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct FullUiState {
    portfolio: PortfolioRuntimeState,
    today: NaiveDate,
    earliest_listing: Option<NaiveDate>,
    min_samples: usize,
    max_samples: usize,
    samples_step: usize,
    default_samples: usize,
    default_tickers: &'static [&'static str],
    default_candle_ticker: &'static str,
    default_currencies: &'static [&'static str],
    index_refresh_secs: u64,
    rates_refresh_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CompaniesQuery {
    all: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CandleOptionsQuery {
    tickers: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StocksRequest {
    tickers: Vec<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct CandleRequest {
    ticker: String,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct CurrencyHistoryRequest {
    currencies: Vec<String>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub async fn run_webui_server(port: u16, dashboard: Dashboard) -> Result<()> {
    let state = WebState {
        dashboard,
        portfolio: Arc::new(Mutex::new(PortfolioRuntimeState::default())),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/app.js", get(app_js))
        .route("/api/health", get(health))
        .route("/api/state", get(full_state))
        .route("/api/companies", get(companies))
        .route("/api/currencies", get(currencies))
        .route("/api/candle-options", get(candle_options))
        .route("/api/indices", get(indices))
        .route("/api/rates", get(rates))
        .route("/api/stocks/line", post(stocks_line))
        .route("/api/stocks/candle", post(stocks_candle))
        .route("/api/currencies/history", post(currency_history))
        .route("/api/portfolio", post(portfolio_run))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("WebUI listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn app_js() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/javascript; charset=utf-8")], APP_JS)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn full_state(State(state): State<WebState>) -> ApiResult<FullUiState> {
    Ok(Json(FullUiState {
        portfolio: state.portfolio.lock().await.clone(),
        today: config::exchange_today(),
        earliest_listing: state.dashboard.tables().earliest_listing(),
        min_samples: config::MIN_SAMPLES,
        max_samples: config::MAX_SAMPLES,
        samples_step: config::SAMPLES_STEP,
        default_samples: config::DEFAULT_SAMPLES,
        default_tickers: config::DEFAULT_TICKERS,
        default_candle_ticker: config::DEFAULT_CANDLE_TICKER,
        default_currencies: config::DEFAULT_CURRENCIES,
        index_refresh_secs: config::INDEX_REFRESH_SECS,
        rates_refresh_secs: config::RATES_REFRESH_SECS,
    }))
}

async fn companies(State(state): State<WebState>, Query(query): Query<CompaniesQuery>) -> Json<Vec<SelectOption>> {
    Json(state.dashboard.company_options(query.all.unwrap_or(false)))
}

async fn currencies(State(state): State<WebState>) -> Json<Vec<SelectOption>> {
    Json(state.dashboard.currency_options())
}

async fn candle_options(
    State(state): State<WebState>,
    Query(query): Query<CandleOptionsQuery>,
) -> Json<Vec<SelectOption>> {
    let tickers = split_list(query.tickers.as_deref().unwrap_or_default());
    Json(state.dashboard.candle_options(&tickers))
}

async fn indices(State(state): State<WebState>) -> Json<PanelUpdate> {
    Json(state.dashboard.index_panel().await)
}

async fn rates(State(state): State<WebState>) -> Json<PanelUpdate> {
    Json(state.dashboard.rates_panel().await)
}

async fn stocks_line(State(state): State<WebState>, Json(req): Json<StocksRequest>) -> ApiResult<Figure> {
    let tickers = normalize_symbols(&req.tickers);
    if tickers.is_empty() {
        return Err(api_err(StatusCode::BAD_REQUEST, "tickers cannot be empty"));
    }
    let range = DateRange::resolve(req.start, req.end).map_err(bad_request)?;
    let figure = state
        .dashboard
        .line_chart(&tickers, range)
        .await
        .map_err(internal_err)?;
    Ok(Json(figure))
}

async fn stocks_candle(State(state): State<WebState>, Json(req): Json<CandleRequest>) -> ApiResult<Figure> {
    let ticker = req.ticker.trim().to_uppercase();
    if ticker.is_empty() {
        return Err(api_err(StatusCode::BAD_REQUEST, "ticker is required"));
    }
    let range = DateRange::resolve(req.start, req.end).map_err(bad_request)?;
    let figure = state
        .dashboard
        .candlestick_chart(&ticker, range)
        .await
        .map_err(internal_err)?;
    Ok(Json(figure))
}

async fn currency_history(
    State(state): State<WebState>,
    Json(req): Json<CurrencyHistoryRequest>,
) -> ApiResult<Figure> {
    let codes = normalize_symbols(&req.currencies);
    if codes.is_empty() {
        return Err(api_err(StatusCode::BAD_REQUEST, "currencies cannot be empty"));
    }
    if let Some(unknown) = codes.iter().find(|c| !state.dashboard.tables().has_currency(c)) {
        return Err(api_err(StatusCode::BAD_REQUEST, &format!("unknown currency {}", unknown)));
    }
    let figure = state
        .dashboard
        .currency_chart(&codes)
        .await
        .map_err(internal_err)?;
    Ok(Json(figure))
}

async fn portfolio_run(State(state): State<WebState>, Json(req): Json<PortfolioRequest>) -> ApiResult<PortfolioRun> {
    if normalize_symbols(&req.tickers).len() < 2 {
        return Err(api_err(StatusCode::BAD_REQUEST, "at least 2 symbols are required"));
    }
    DateRange::resolve(req.start, req.end).map_err(bad_request)?;

    {
        let mut ps = state.portfolio.lock().await;
        ps.last_request = Some(req.clone());
        ps.last_error = None;
    }

    let outcome = state.dashboard.markowitz(&req).await;

    let mut ps = state.portfolio.lock().await;
    ps.updated_at = Some(chrono::Local::now().to_rfc3339());
    match outcome {
        Ok(run) => {
            ps.last_run = Some(run.clone());
            Ok(Json(run))
        }
        Err(err) => {
            warn!("Portfolio run failed: {:#}", err);
            ps.last_error = Some(format!("{:#}", err));
            Err(internal_err(format!("{:#}", err)))
        }
    }
}

/// Splits a comma-separated query value into trimmed, non-empty items.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn api_err(status: StatusCode, message: &str) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.to_string(),
        }),
    )
}

fn bad_request<E: std::fmt::Display>(err: E) -> (StatusCode, Json<ApiError>) {
    api_err(StatusCode::BAD_REQUEST, &err.to_string())
}

fn internal_err<E: std::fmt::Display>(err: E) -> (StatusCode, Json<ApiError>) {
    api_err(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("KGHM, KRUK,,"), vec!["KGHM", "KRUK"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_portfolio_request_defaults() {
        let req: PortfolioRequest = serde_json::from_str(r#"{"tickers":["KGHM","KRUK"]}"#).unwrap();
        assert_eq!(req.samples, None);
        assert_eq!(req.scheme, crate::portfolio::WeightScheme::NormalizedUniform);

        let req: PortfolioRequest = serde_json::from_str(
            r#"{"tickers":["A","B"],"samples":500,"start":"2020-01-01","seed":3,"scheme":"dirichlet"}"#,
        )
        .unwrap();
        assert_eq!(req.start, NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(req.scheme, crate::portfolio::WeightScheme::Dirichlet);
    }

    #[test]
    fn test_api_err_shape() {
        let (status, Json(body)) = bad_request("start date is after end date");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(serde_json::to_value(body).unwrap()["error"], "start date is after end date");
    }
}

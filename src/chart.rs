//! Plotly-compatible figure descriptors.
//!
//! The browser hands these straight to `Plotly.react`, so field names follow
//! Plotly's JSON schema rather than Rust conventions.

use crate::data::PriceSeries;
use crate::portfolio::SampleSet;
use crate::quotes::{IndexBoard, RateSeries, SpotRates};
use chrono::NaiveDate;
use serde::Serialize;

const PLOT_BG: &str = "#434247";
const PANEL_BG: &str = "#35353b";
const GRID: &str = "#35353b";
const FONT: &str = "#d8d8d8";
const ERROR_FONT: &str = "tomato";

/// Plotly's cyclical HSV palette, used for stock lines.
pub const HSV_PALETTE: &[&str] = &[
    "#ff0000", "#ffa700", "#afff00", "#08ff00", "#00ff9f", "#00b7ff", "#0010ff", "#9700ff", "#ff00bf",
];

/// Plotly's cyclical Phase palette, used for currency lines.
pub const PHASE_PALETTE: &[&str] = &[
    "rgb(167, 119, 12)",
    "rgb(197, 96, 51)",
    "rgb(217, 67, 96)",
    "rgb(221, 38, 163)",
    "rgb(196, 59, 224)",
    "rgb(153, 97, 244)",
    "rgb(95, 127, 228)",
    "rgb(40, 144, 183)",
    "rgb(15, 151, 136)",
    "rgb(39, 153, 79)",
    "rgb(119, 141, 17)",
];

#[derive(Clone, Debug, Serialize)]
pub struct Figure {
    pub data: Vec<Trace>,
    pub layout: Layout,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trace {
    Scatter(ScatterTrace),
    Candlestick(CandlestickTrace),
    Indicator(IndicatorTrace),
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum AxisValue {
    Date(NaiveDate),
    Number(f64),
}

#[derive(Clone, Debug, Serialize)]
pub struct ScatterTrace {
    pub x: Vec<AxisValue>,
    pub y: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<Line>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<Marker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hovertemplate: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Line {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Marker {
    pub size: f64,
    /// One value per point, mapped through `colorscale`.
    pub color: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colorscale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversescale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub showscale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colorbar: Option<ColorBar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<Line>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ColorBar {
    pub title: Title,
}

#[derive(Clone, Debug, Serialize)]
pub struct CandlestickTrace {
    pub x: Vec<NaiveDate>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub name: String,
    pub increasing: CandleSide,
    pub decreasing: CandleSide,
}

#[derive(Clone, Debug, Serialize)]
pub struct CandleSide {
    pub line: Line,
}

#[derive(Clone, Debug, Serialize)]
pub struct IndicatorTrace {
    pub mode: &'static str,
    pub title: Title,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub number: NumberStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NumberStyle {
    pub font: Font,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valueformat: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Delta {
    pub reference: f64,
    pub relative: bool,
    pub valueformat: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Domain {
    pub row: usize,
    pub column: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Title {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font: Option<Font>,
}

impl Title {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font: None,
        }
    }

    fn sized(text: impl Into<String>, size: u32) -> Self {
        Self {
            text: text.into(),
            font: Some(Font::size(size)),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Font {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Font {
    fn size(size: u32) -> Self {
        Self {
            size: Some(size),
            color: None,
        }
    }

    fn color(color: &str) -> Self {
        Self {
            size: None,
            color: Some(color.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Axis {
    pub gridcolor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Title>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Grid {
    pub rows: usize,
    pub columns: usize,
    pub pattern: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct Margin {
    pub t: u32,
    pub b: u32,
    pub l: u32,
    pub r: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct Layout {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Title>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xaxis: Option<Axis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxis: Option<Axis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<Grid>,
    pub plot_bgcolor: String,
    pub paper_bgcolor: String,
    pub font: Font,
    pub margin: Margin,
}

fn axis(title: Option<&str>) -> Axis {
    Axis {
        gridcolor: GRID.to_string(),
        title: title.map(Title::plain),
    }
}

fn chart_layout(title: String, height: Option<u32>, margin: Margin) -> Layout {
    Layout {
        title: Some(Title::plain(title)),
        height,
        xaxis: Some(axis(None)),
        yaxis: Some(axis(None)),
        grid: None,
        plot_bgcolor: PLOT_BG.to_string(),
        paper_bgcolor: PLOT_BG.to_string(),
        font: Font::color(FONT),
        margin,
    }
}

fn panel_layout(columns: usize, height: u32, top: u32) -> Layout {
    Layout {
        title: None,
        height: Some(height),
        xaxis: None,
        yaxis: None,
        grid: Some(Grid {
            rows: 1,
            columns,
            pattern: "independent",
        }),
        plot_bgcolor: PANEL_BG.to_string(),
        paper_bgcolor: PANEL_BG.to_string(),
        font: Font::color(FONT),
        margin: Margin { t: top, b: 0, l: 0, r: 0 },
    }
}

fn line_trace(name: &str, points: impl Iterator<Item = (NaiveDate, f64)>, color: &str) -> Trace {
    let (x, y): (Vec<AxisValue>, Vec<f64>) = points.map(|(d, v)| (AxisValue::Date(d), v)).unzip();
    Trace::Scatter(ScatterTrace {
        x,
        y,
        name: Some(name.to_string()),
        mode: "lines",
        line: Some(Line {
            color: Some(color.to_string()),
            width: None,
        }),
        marker: None,
        text: None,
        hovertemplate: None,
    })
}

/// Closing prices of several tickers on one chart.
pub fn stock_line_chart(series: &[PriceSeries]) -> Figure {
    let data = series
        .iter()
        .zip(HSV_PALETTE.iter().cycle())
        .map(|(s, color)| line_trace(&s.symbol, s.closes(), color))
        .collect();
    let names = series.iter().map(|s| s.symbol.as_str()).collect::<Vec<_>>().join(", ");
    Figure {
        data,
        layout: chart_layout(
            format!("Stock chart for {}", names),
            Some(300),
            Margin { t: 40, b: 30, l: 60, r: 60 },
        ),
    }
}

pub fn candlestick_chart(series: &PriceSeries) -> Figure {
    let side = |color: &str| CandleSide {
        line: Line {
            color: Some(color.to_string()),
            width: None,
        },
    };
    let trace = CandlestickTrace {
        x: series.history.iter().map(|c| c.date).collect(),
        open: series.history.iter().map(|c| c.open).collect(),
        high: series.history.iter().map(|c| c.high).collect(),
        low: series.history.iter().map(|c| c.low).collect(),
        close: series.history.iter().map(|c| c.close).collect(),
        name: series.symbol.clone(),
        increasing: side("lime"),
        decreasing: side("red"),
    };
    Figure {
        data: vec![Trace::Candlestick(trace)],
        layout: chart_layout(
            format!("Candlestick chart for {}", series.symbol),
            Some(350),
            Margin { t: 30, b: 0, l: 60, r: 60 },
        ),
    }
}

pub fn currency_chart(series: &[RateSeries]) -> Figure {
    let data = series
        .iter()
        .zip(PHASE_PALETTE.iter().cycle())
        .map(|(s, color)| line_trace(&s.code, s.points.iter().copied(), color))
        .collect();
    let codes = series.iter().map(|s| s.code.as_str()).collect::<Vec<_>>().join(", ");
    Figure {
        data,
        layout: chart_layout(
            format!("Exchange rates for {}", codes),
            None,
            Margin { t: 30, b: 30, l: 60, r: 60 },
        ),
    }
}

/// Volatility/return scatter, colored by Sharpe ratio, with weights on hover.
pub fn markowitz_scatter(set: &SampleSet) -> Figure {
    let x = set
        .samples
        .iter()
        .map(|s| AxisValue::Number(s.volatility))
        .collect();
    let y = set.samples.iter().map(|s| s.expected_return).collect();
    let sharpe = set.samples.iter().map(|s| s.sharpe).collect();
    let text = set.samples.iter().map(|s| s.weights_label()).collect();

    let trace = ScatterTrace {
        x,
        y,
        name: None,
        mode: "markers",
        line: None,
        marker: Some(Marker {
            size: 9.0,
            color: sharpe,
            colorscale: Some("RdPu".to_string()),
            reversescale: Some(true),
            showscale: Some(true),
            colorbar: Some(ColorBar {
                title: Title::plain("sharpe"),
            }),
            line: Some(Line {
                color: None,
                width: Some(1.0),
            }),
        }),
        text: Some(text),
        hovertemplate: Some(format!(
            "volatility=%{{x}}<br>returns=%{{y}}<br>sharpe=%{{marker.color}}<br>weights ({})=%{{text}}<extra></extra>",
            set.symbols.join(", ")
        )),
    };

    let mut layout = chart_layout(
        format!("Portfolio allocation for {}", set.symbols.join(", ")),
        None,
        Margin { t: 40, b: 30, l: 60, r: 60 },
    );
    layout.xaxis = Some(axis(Some("Volatility")));
    layout.yaxis = Some(axis(Some("Returns")));

    Figure {
        data: vec![Trace::Scatter(trace)],
        layout,
    }
}

fn indicator(title: &str, value: f64, column: usize, valueformat: Option<String>, delta: Option<Delta>) -> Trace {
    Trace::Indicator(IndicatorTrace {
        mode: if delta.is_some() { "number+delta" } else { "number" },
        title: Title::sized(title, 14),
        value: Some(value),
        number: NumberStyle {
            font: Font::size(20),
            valueformat,
        },
        delta,
        domain: Some(Domain { row: 1, column }),
    })
}

/// Top-bar index levels. Relative deltas appear only when every index has a
/// change value.
pub fn index_panel(board: &IndexBoard) -> Figure {
    let with_delta = board.has_all_changes();
    let data = board
        .quotes
        .iter()
        .enumerate()
        .map(|(column, q)| {
            let delta = match (with_delta, q.change) {
                (true, Some(change)) => Some(Delta {
                    reference: q.value - change,
                    relative: true,
                    valueformat: ".2%".to_string(),
                }),
                _ => None,
            };
            indicator(&q.name, q.value, column, None, delta)
        })
        .collect();
    Figure {
        data,
        layout: panel_layout(board.quotes.len(), 70, 30),
    }
}

/// Top-bar PLN exchange rates.
pub fn rate_panel(rates: &SpotRates) -> Figure {
    let format = format!(".{}f", rates.source.decimals());
    let data = rates
        .rates
        .iter()
        .enumerate()
        .map(|(column, (code, rate))| indicator(code, *rate, column, Some(format.clone()), None))
        .collect();
    Figure {
        data,
        layout: panel_layout(rates.rates.len(), 60, 23),
    }
}

/// Inert placeholder shown when no source could serve a panel.
pub fn error_panel(message: &str, title_size: u32) -> Figure {
    let trace = Trace::Indicator(IndicatorTrace {
        mode: "number",
        title: Title::sized(message, title_size),
        value: None,
        number: NumberStyle {
            font: Font::size(1),
            valueformat: None,
        },
        delta: None,
        domain: None,
    });
    let mut layout = panel_layout(1, 70, 30);
    layout.grid = None;
    layout.font = Font::color(ERROR_FONT);
    Figure {
        data: vec![trace],
        layout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Candle;
    use crate::portfolio::{PortfolioSample, WeightScheme};
    use crate::quotes::{IndexQuote, IndexQuoteSource, RateSource};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn series(symbol: &str) -> PriceSeries {
        let history = (1..=3)
            .map(|day| Candle {
                date: date(day),
                open: 10.0,
                high: 12.0,
                low: 9.0,
                close: 10.0 + day as f64,
                volume: 100.0,
            })
            .collect();
        PriceSeries::new(symbol, "stooq", history)
    }

    #[test]
    fn test_line_chart_cycles_palette() {
        let many: Vec<PriceSeries> = (0..HSV_PALETTE.len() + 1).map(|i| series(&format!("T{}", i))).collect();
        let fig = stock_line_chart(&many);
        assert_eq!(fig.data.len(), many.len());

        let json = serde_json::to_value(&fig).unwrap();
        assert_eq!(json["data"][0]["type"], "scatter");
        assert_eq!(json["data"][0]["line"]["color"], HSV_PALETTE[0]);
        assert_eq!(json["data"][HSV_PALETTE.len()]["line"]["color"], HSV_PALETTE[0]);
        assert_eq!(json["data"][0]["x"][0], "2024-03-01");
        assert_eq!(json["layout"]["height"], 300);
    }

    #[test]
    fn test_candlestick_fields() {
        let fig = candlestick_chart(&series("KRUK"));
        let json = serde_json::to_value(&fig).unwrap();
        assert_eq!(json["data"][0]["type"], "candlestick");
        assert_eq!(json["data"][0]["close"][2], 13.0);
        assert_eq!(json["data"][0]["increasing"]["line"]["color"], "lime");
        assert_eq!(json["layout"]["title"]["text"], "Candlestick chart for KRUK");
    }

    #[test]
    fn test_markowitz_scatter_colors_by_sharpe() {
        let set = SampleSet {
            symbols: vec!["KGHM".into(), "KRUK".into()],
            scheme: WeightScheme::NormalizedUniform,
            seed: 1,
            periods: 250,
            samples: vec![PortfolioSample {
                weights: vec![0.25, 0.75],
                expected_return: 0.2,
                volatility: 0.1,
                sharpe: 2.0,
            }],
        };
        let json = serde_json::to_value(markowitz_scatter(&set)).unwrap();
        let trace = &json["data"][0];
        assert_eq!(trace["mode"], "markers");
        assert_eq!(trace["x"][0], 0.1);
        assert_eq!(trace["marker"]["color"][0], 2.0);
        assert_eq!(trace["marker"]["colorscale"], "RdPu");
        assert_eq!(trace["text"][0], "0.25, 0.75");
        assert_eq!(json["layout"]["xaxis"]["title"]["text"], "Volatility");
        assert_eq!(json["layout"]["title"]["text"], "Portfolio allocation for KGHM, KRUK");
    }

    #[test]
    fn test_index_panel_delta_only_when_complete() {
        let mut board = IndexBoard {
            source: IndexQuoteSource::StooqQuotes,
            quotes: vec![
                IndexQuote { name: "WIG30".into(), value: 110.0, change: Some(10.0) },
                IndexQuote { name: "MWIG40".into(), value: 50.0, change: Some(-5.0) },
            ],
        };
        let json = serde_json::to_value(index_panel(&board)).unwrap();
        assert_eq!(json["data"][0]["mode"], "number+delta");
        assert_eq!(json["data"][0]["delta"]["reference"], 100.0);
        assert_eq!(json["data"][1]["domain"]["column"], 1);
        assert_eq!(json["layout"]["grid"]["columns"], 2);

        board.quotes[1].change = None;
        let json = serde_json::to_value(index_panel(&board)).unwrap();
        assert_eq!(json["data"][0]["mode"], "number");
        assert!(json["data"][0].get("delta").is_none());
    }

    #[test]
    fn test_rate_panel_uses_source_precision() {
        let rates = SpotRates {
            source: RateSource::Nbp,
            rates: vec![("USD".into(), 3.9432), ("EUR".into(), 4.3434)],
        };
        let json = serde_json::to_value(rate_panel(&rates)).unwrap();
        assert_eq!(json["data"][1]["number"]["valueformat"], ".4f");
        assert_eq!(json["data"][1]["title"]["text"], "EUR");
    }

    #[test]
    fn test_error_panel() {
        let json = serde_json::to_value(error_panel("Could not connect", 20)).unwrap();
        assert_eq!(json["layout"]["font"]["color"], "tomato");
        assert_eq!(json["data"][0]["title"]["font"]["size"], 20);
        assert!(json["data"][0].get("value").is_none());
    }
}

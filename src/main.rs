mod chart;
mod client;
mod config;
mod dashboard;
mod data;
mod portfolio;
mod quotes;
mod reference;
mod returns;
mod sources;
mod webui;

use chrono::NaiveDate;
use clap::Parser;
use client::MarketClient;
use dashboard::{Dashboard, PortfolioRequest};
use portfolio::WeightScheme;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "WSE dashboard: Warsaw Stock Exchange charts, PLN exchange rates and Markowitz portfolio sampling",
    after_help = "EXAMPLES:
    # Serve the dashboard on port 8050
    cargo run --release -- --webui --port 8050

    # Sample 3000 random portfolios over the last year
    cargo run --release -- --portfolio KGHM,KRUK,TSGAMES --samples 3000 --seed 42

    # Print the index panel as Plotly JSON
    cargo run --release -- --indices --json"
)]
struct Args {
    /// Launch in WebUI mode (the default when no other mode is given)
    #[arg(long)]
    webui: bool,

    /// WebUI server port
    #[arg(long, default_value_t = 8050)]
    port: u16,

    /// Run the Markowitz sampler: provide comma-separated tickers (e.g., KGHM,KRUK,TSGAMES)
    #[arg(long)]
    portfolio: Option<String>,

    /// Number of random portfolios to draw (clamped to 100..=8000)
    #[arg(long)]
    samples: Option<usize>,

    /// First day of price history, YYYY-MM-DD (default: one year before --end)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day of price history, YYYY-MM-DD (default: today in Warsaw)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    /// How random weights are drawn
    #[arg(long, value_enum, default_value_t = WeightScheme::NormalizedUniform)]
    scheme: WeightScheme,

    /// Print the current index levels
    #[arg(long)]
    indices: bool,

    /// Print the current PLN exchange rates
    #[arg(long)]
    rates: bool,

    /// Print figure JSON instead of a summary table
    #[arg(long)]
    json: bool,
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wse_dashboard=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    let settings = config::DashboardSettings::from_env();
    info!(
        "History sources: {}",
        settings
            .history_sources
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    if args.indices || args.rates {
        // Top panels do not need the reference tables.
        let client = MarketClient::new(settings)?;
        let dashboard = Dashboard::new(client, Arc::new(reference::ReferenceTables::empty()));
        if args.indices {
            let panel = dashboard.index_panel().await;
            if args.json {
                print_json(&panel);
            } else {
                print_panel("Indices", &panel);
            }
        }
        if args.rates {
            let panel = dashboard.rates_panel().await;
            if args.json {
                print_json(&panel);
            } else {
                print_panel("PLN rates", &panel);
            }
        }
        return Ok(());
    }

    if let Some(ref tickers) = args.portfolio {
        let tickers: Vec<String> = tickers
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if tickers.len() < 2 {
            error!("Portfolio sampling requires at least 2 tickers. Example: --portfolio KGHM,KRUK,TSGAMES");
            return Ok(());
        }
        let request = PortfolioRequest {
            tickers,
            samples: args.samples,
            start: args.start,
            end: args.end,
            seed: args.seed,
            scheme: args.scheme,
        };
        let client = MarketClient::new(settings)?;
        let dashboard = Dashboard::new(client, Arc::new(reference::ReferenceTables::empty()));
        match dashboard.markowitz(&request).await {
            Ok(run) => {
                if args.json {
                    print_json(&run.figure);
                } else {
                    portfolio::print_sample_set(&run.result);
                }
                info!("Portfolio sampling completed.");
            }
            Err(e) => error!("Portfolio sampling failed: {:#}", e),
        }
        return Ok(());
    }

    if !args.webui {
        info!("No mode selected, starting the WebUI");
    }
    let dashboard = Dashboard::connect(settings).await?;
    match webui::run_webui_server(args.port, dashboard).await {
        Ok(_) => info!("WebUI exited."),
        Err(e) => error!("WebUI failed: {}", e),
    }
    Ok(())
}

fn print_panel(title: &str, panel: &dashboard::PanelUpdate) {
    println!("\n{} ({})", title, panel.last_update);
    match &panel.source {
        Some(source) => println!("  source: {}", source),
        None => {
            for failure in &panel.failures {
                println!("  {} failed: {}", failure.source, failure.reason);
            }
        }
    }
    for trace in &panel.figure.data {
        if let chart::Trace::Indicator(ind) = trace {
            match ind.value {
                Some(value) => println!("  {:<12} {:>12.4}", ind.title.text, value),
                None => println!("  {}", ind.title.text),
            }
        }
    }
}

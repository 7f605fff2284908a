use crate::client::MarketClient;
use crate::quotes::{self, NbpTable};
use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

/// One WSE listing from the metadata table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Company {
    pub code: String,
    pub name: String,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Currency {
    pub code: String,
    pub name: String,
}

/// A `{label, value}` pair for dropdown menus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
}

/// Lookup tables loaded once at startup and shared read-only afterwards.
#[derive(Clone, Debug)]
pub struct ReferenceTables {
    companies: Vec<Company>,
    latest_listing: Option<NaiveDate>,
    currencies: Vec<Currency>,
}

impl ReferenceTables {
    /// Downloads the company metadata and the NBP currency table.
    pub async fn load(client: &MarketClient) -> Result<Self> {
        let url = client.settings().metadata_url.clone();
        let metadata = client
            .get_text(&url)
            .await
            .context("failed to download WSE company metadata")?;
        let companies = parse_company_metadata(&metadata)?;

        let table = quotes::fetch_nbp_table(client)
            .await
            .context("failed to download NBP currency table")?;

        let tables = Self::from_parts(companies, &table);
        info!(
            "Loaded {} companies ({} currently listed) and {} currencies",
            tables.companies.len(),
            tables.current_companies().count(),
            tables.currencies.len()
        );
        Ok(tables)
    }

    /// Tables with no companies or currencies, for modes that never consult them.
    pub fn empty() -> Self {
        Self {
            companies: Vec::new(),
            latest_listing: None,
            currencies: Vec::new(),
        }
    }

    pub fn from_parts(companies: Vec<Company>, table: &NbpTable) -> Self {
        let latest_listing = companies.iter().filter_map(|c| c.to_date).max();
        let currencies = table
            .rates
            .iter()
            .map(|r| Currency {
                code: r.code.clone(),
                name: r.currency.clone(),
            })
            .collect();
        Self {
            companies,
            latest_listing,
            currencies,
        }
    }

    /// Companies whose listing reaches the most recent date in the table.
    pub fn current_companies(&self) -> impl Iterator<Item = &Company> {
        self.companies
            .iter()
            .filter(move |c| c.to_date.is_some() && c.to_date == self.latest_listing)
    }

    /// Dropdown options; historically listed companies only when asked.
    pub fn company_options(&self, include_historical: bool) -> Vec<SelectOption> {
        let to_option = |c: &Company| SelectOption {
            label: c.name.clone(),
            value: c.code.clone(),
        };
        if include_historical {
            self.companies.iter().map(to_option).collect()
        } else {
            self.current_companies().map(to_option).collect()
        }
    }

    pub fn currency_options(&self) -> Vec<SelectOption> {
        self.currencies
            .iter()
            .map(|c| SelectOption {
                label: format!("{} ({})", c.name, c.code),
                value: c.code.clone(),
            })
            .collect()
    }

    pub fn company(&self, code: &str) -> Option<&Company> {
        self.companies.iter().find(|c| c.code.eq_ignore_ascii_case(code))
    }

    pub fn has_currency(&self, code: &str) -> bool {
        self.currencies.iter().any(|c| c.code.eq_ignore_ascii_case(code))
    }

    /// Earliest end-of-listing date, the lower bound for date pickers.
    pub fn earliest_listing(&self) -> Option<NaiveDate> {
        self.companies.iter().filter_map(|c| c.to_date).min()
    }
}

/// Extracts a readable company name from the metadata `name` field.
///
/// The field looks like `"Stock Prices for KGHM Polska Miedz SA, ..."`: the
/// text before the first comma, after the first `for`, left-trimmed. Falls back
/// to the ticker code when there is no `for`.
pub fn display_name(raw: &str, code: &str) -> String {
    let head = raw.split(',').next().unwrap_or_default();
    match head.split("for").nth(1) {
        Some(rest) => rest.trim_start().to_string(),
        None => code.to_string(),
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Parses the WSE metadata CSV (`code,name,...,from_date,to_date`).
pub fn parse_company_metadata(body: &str) -> Result<Vec<Company>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));

    let code_idx = column("code").ok_or(anyhow!("metadata CSV has no code column"))?;
    let name_idx = column("name");
    let from_idx = column("from_date");
    let to_idx = column("to_date");

    let mut companies = Vec::new();
    for record in reader.records() {
        let record = record?;
        let code = record.get(code_idx).unwrap_or_default().trim().to_string();
        if code.is_empty() {
            continue;
        }
        let raw_name = name_idx.and_then(|i| record.get(i)).unwrap_or_default();
        companies.push(Company {
            name: display_name(raw_name, &code),
            from_date: from_idx.and_then(|i| record.get(i)).and_then(parse_date),
            to_date: to_idx.and_then(|i| record.get(i)).and_then(parse_date),
            code,
        });
    }

    if companies.is_empty() {
        bail!("metadata CSV contains no companies");
    }
    Ok(companies)
}

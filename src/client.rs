use crate::config::DashboardSettings;
use anyhow::{Result, anyhow};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = "Mozilla/5.0";

/// Shared HTTP access to the market-data services.
#[derive(Clone, Debug)]
pub struct MarketClient {
    client: Client,
    settings: DashboardSettings,
}

impl MarketClient {
    pub fn new(settings: DashboardSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &DashboardSettings {
        &self.settings
    }

    /// GET `url` and return the body as text, retrying transport errors and
    /// non-success statuses.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=attempts {
            debug!("GET {} (attempt {}/{})", redact(url), attempt, attempts);
            let outcome = match self.client.get(url).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(ok_resp) => ok_resp.text().await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            match outcome {
                Ok(body) => return Ok(body),
                // reqwest errors embed the full URL, keys included.
                Err(err) => last_err = Some(anyhow!("GET {} failed: {}", redact(url), err.without_url())),
            }

            if attempt < attempts {
                warn!(
                    "GET {} failed (attempt {}/{}), retrying...",
                    redact(url),
                    attempt,
                    attempts
                );
                retry_sleep(attempt).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("GET {} failed", redact(url))))
    }
}

async fn retry_sleep(attempt: usize) {
    let millis = (250_u64 * (attempt as u64)).min(1500);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Strips API keys from URLs before they reach the logs.
pub fn redact(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let params = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("api_key") || key.eq_ignore_ascii_case("apikey") => {
                format!("{}=***", key)
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", base, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_keys() {
        assert_eq!(
            redact("https://x.test/a?q=USD_PLN&apiKey=secret&compact=ultra"),
            "https://x.test/a?q=USD_PLN&apiKey=***&compact=ultra"
        );
        assert_eq!(
            redact("https://x.test/b.json?api_key=abc"),
            "https://x.test/b.json?api_key=***"
        );
        assert_eq!(redact("https://x.test/plain"), "https://x.test/plain");
    }
}

//! Binance futures balance client.

use super::CapitalSource;
use crate::config::SourceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: u64 = 5000;

/// Per-asset balance row returned by `/fapi/v2/balance`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    available_balance: Decimal,
}

/// Reads the available balance of one margin asset.
pub struct BinanceBalanceSource {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    asset: String,
}

impl BinanceBalanceSource {
    /// Create a new balance source from configuration.
    pub fn new(config: &SourceConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = match &config.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if config.testnet => FUTURES_TESTNET_URL.to_string(),
            None => FUTURES_BASE_URL.to_string(),
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
            asset: config.asset.clone(),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .context("Invalid signing key")?;
        mac.update(query_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn signed_query(&self) -> Result<String> {
        let params = [
            ("recvWindow", RECV_WINDOW_MS.to_string()),
            ("timestamp", Self::timestamp().to_string()),
        ];
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }
}

#[async_trait]
impl CapitalSource for BinanceBalanceSource {
    #[instrument(skip(self), fields(asset = %self.asset))]
    async fn available_balance(&self) -> Result<Decimal> {
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, self.signed_query()?);

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("Failed to fetch account balance")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let balances: Vec<AssetBalance> = response
            .json()
            .await
            .context("Failed to parse account balance response")?;

        let balance = balances
            .into_iter()
            .find(|b| b.asset == self.asset)
            .map(|b| b.available_balance)
            .with_context(|| format!("Asset {} missing from balance response", self.asset))?;

        debug!(%balance, "Fetched available balance");
        Ok(balance)
    }
}

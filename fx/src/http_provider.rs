//! HTTP client for Frankfurter-compatible rate APIs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use fxrates_common::{constants, Currency};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::error::{FxError, FxResult};
use crate::provider::{LatestRates, RateProvider, SupportedCurrency};

/// Configuration for the HTTP rate provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API root, without trailing path segments.
    pub base_url: String,
    /// Client-level timeout applied to every request.
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.frankfurter.app".to_string(),
            timeout: constants::provider_timeout(),
        }
    }
}

/// Rate provider backed by a Frankfurter-style REST API.
///
/// The native base of the default deployment is EUR (ECB reference rates).
pub struct HttpRateProvider {
    client: Client,
    base_url: String,
}

impl HttpRateProvider {
    /// Create a new provider client.
    pub fn new(config: ProviderConfig) -> FxResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FxError::provider("client setup", e))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> FxResult<T> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, operation, "Requesting rates");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| FxError::provider(operation, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "Rate provider returned error status");
            return Err(FxError::provider(
                operation,
                format!("HTTP {} from {}", status, url),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FxError::provider(operation, format!("invalid response body: {}", e)))
    }
}

fn join_codes(codes: &[Currency]) -> String {
    codes
        .iter()
        .map(Currency::code)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    fn name(&self) -> &str {
        "frankfurter"
    }

    #[instrument(skip_all, fields(base = %base))]
    async fn get_latest_rates(&self, base: &Currency) -> FxResult<LatestRates> {
        self.get_json("latest rates", "latest", &[("from", base.code().to_string())])
            .await
    }

    #[instrument(skip_all, fields(base = %base))]
    async fn get_latest_rates_for_currencies(
        &self,
        base: &Currency,
        targets: &[Currency],
    ) -> FxResult<LatestRates> {
        self.get_json(
            "latest rates",
            "latest",
            &[("from", base.code().to_string()), ("to", join_codes(targets))],
        )
        .await
    }

    async fn get_supported_currencies(&self) -> FxResult<Vec<SupportedCurrency>> {
        let raw: BTreeMap<String, String> =
            self.get_json("supported currencies", "currencies", &[]).await?;

        Ok(raw
            .into_iter()
            .filter_map(|(code, name)| match Currency::parse(&code) {
                Ok(code) => Some(SupportedCurrency { code, name }),
                Err(e) => {
                    warn!(error = %e, "Skipping unsupported currency code from provider");
                    None
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn convert(
        &self,
        amount: Decimal,
        from: &Currency,
        to: &Currency,
    ) -> FxResult<LatestRates> {
        self.get_json(
            "convert",
            "latest",
            &[
                ("amount", amount.to_string()),
                ("from", from.code().to_string()),
                ("to", to.code().to_string()),
            ],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn get_historical_rates(
        &self,
        date: NaiveDate,
        base: &Currency,
    ) -> FxResult<LatestRates> {
        let path = date.format("%Y-%m-%d").to_string();
        self.get_json("historical rates", &path, &[("from", base.code().to_string())])
            .await
    }
}

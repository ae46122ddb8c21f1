//! Usage warehouse driver.
//!
//! The warehouse aggregates relay counts per account from the first day of
//! the current calendar month (inclusive) through now (inclusive) and is
//! the single authority for usage; this service does no per-request
//! counting. Queries are filtered server-side so only accounts at or above
//! the requested threshold come back.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::store::AccountId;

/// Errors raised by the usage warehouse.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

/// Month-to-date usage per account, for accounts at or above a threshold.
#[async_trait]
pub trait UsageWarehouse: Send + Sync {
    async fn month_to_date_usage(
        &self,
        threshold_relays: i64,
    ) -> Result<HashMap<AccountId, i64>, WarehouseError>;
}

/// One account's aggregated usage as returned by the warehouse.
#[derive(Debug, Deserialize)]
struct AccountUsageRow {
    account_id: String,
    total_relays: i64,
}

/// Warehouse driver speaking to the usage aggregation HTTP endpoint.
pub struct HttpUsageWarehouse {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpUsageWarehouse {
    pub fn new(
        base_url: String,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, WarehouseError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl UsageWarehouse for HttpUsageWarehouse {
    async fn month_to_date_usage(
        &self,
        threshold_relays: i64,
    ) -> Result<HashMap<AccountId, i64>, WarehouseError> {
        let mut request = self
            .client
            .get(format!("{}/v1/usage/accounts", self.base_url))
            .query(&[("min_relays", threshold_relays.to_string())]);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WarehouseError::UnexpectedStatus(status.as_u16()));
        }

        let rows: Vec<AccountUsageRow> = response.json().await?;

        tracing::debug!(num_accounts = rows.len(), "fetched month-to-date usage");

        Ok(rows
            .into_iter()
            .map(|row| (AccountId::from(row.account_id), row.total_relays))
            .collect())
    }
}

//! JSON-over-HTTP client for the inventory service.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::ForwardError;
use crate::registry::Instance;

/// Request body of `POST /inventory/query`.
#[derive(Debug, Serialize)]
struct StockQuery<'a> {
    product_id: &'a str,
}

/// Stock level reported by the inventory service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockReply {
    pub stock: i32,
}

#[derive(Debug, Clone)]
pub struct InventoryClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl InventoryClient {
    pub fn new(timeout: Duration) -> Result<Self, ForwardError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ForwardError::Transport(format!("failed to build inventory client: {e}")))?;
        Ok(Self { http, timeout })
    }

    /// Ask `instance` for the stock of `product_id`.
    pub async fn query(&self, instance: &Instance, product_id: &str) -> Result<StockReply, ForwardError> {
        let url = format!("{}/inventory/query", instance.address.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&StockQuery { product_id })
            .send()
            .await
            .map_err(|e| self.classify(instance, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(ForwardError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<StockReply>()
            .await
            .map_err(|e| ForwardError::Transport(format!("invalid inventory reply: {e}")))
    }

    fn classify(&self, instance: &Instance, e: reqwest::Error) -> ForwardError {
        if e.is_timeout() {
            ForwardError::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_connect() {
            ForwardError::ConnectionRefused(instance.address.clone())
        } else if e.is_builder() {
            ForwardError::InvalidTarget(format!("{}: {e}", instance.address))
        } else {
            ForwardError::Transport(e.to_string())
        }
    }
}

//! Typed stock lookup.
//!
//! The inventory service is called through the same dispatch pipeline as
//! proxied routes (breaker, registry, balancer, deadline), but with a typed
//! request and reply instead of a pass-through body.

pub mod client;

use std::sync::Arc;
use std::time::Duration;

pub use client::{InventoryClient, StockReply};

use crate::config::InventoryConfig;
use crate::dispatch::{CallOutcome, DispatchError, Dispatcher, ForwardError};
use crate::resilience::timeouts::effective_deadline;

impl CallOutcome for StockReply {}

/// Stock lookups against the configured inventory service.
#[derive(Debug)]
pub struct Inventory {
    dispatcher: Arc<Dispatcher>,
    client: InventoryClient,
    service: String,
    deadline: Duration,
}

impl Inventory {
    pub fn new(config: &InventoryConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, ForwardError> {
        let deadline = Duration::from_millis(config.timeout_ms);
        Ok(Self {
            dispatcher,
            client: InventoryClient::new(deadline)?,
            service: config.service.clone(),
            deadline,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current stock of `product_id`. `inbound_remaining` caps the call
    /// deadline to what is left of the caller's own budget.
    pub async fn stock(
        &self,
        product_id: &str,
        inbound_remaining: Option<Duration>,
    ) -> Result<StockReply, DispatchError> {
        let client = &self.client;
        let deadline = effective_deadline(self.deadline, inbound_remaining);
        self.dispatcher
            .call(&self.service, deadline, |instance| async move {
                client.query(&instance, product_id).await
            })
            .await
    }
}

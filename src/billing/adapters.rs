use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::config;

/// key: billing-adapter -> payment provider contract

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Succeeded,
    Pending,
    Failed,
}

#[derive(Debug, Clone)]
pub struct GatewayCharge {
    pub status: ChargeStatus,
    pub external_id: Option<String>,
}

/// The engine only knows this contract; Stripe/Coinbase wire formats live
/// behind whatever implements it.
#[async_trait]
pub trait PaymentGatewayAdapter: Send + Sync {
    async fn charge(
        &self,
        amount_cents: i64,
        currency: &str,
        reference: &str,
    ) -> Result<GatewayCharge>;
}

/// key: billing-adapter-http -> charges through a configured gateway service
pub struct HttpGatewayAdapter {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpGatewayAdapter {
    pub fn new(endpoint: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            config::PAYMENT_GATEWAY_ENDPOINT.clone(),
            config::PAYMENT_GATEWAY_TOKEN.clone(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct GatewayChargeResponse {
    status: String,
    #[serde(default)]
    external_id: Option<String>,
}

#[async_trait]
impl PaymentGatewayAdapter for HttpGatewayAdapter {
    async fn charge(
        &self,
        amount_cents: i64,
        currency: &str,
        reference: &str,
    ) -> Result<GatewayCharge> {
        let url = format!("{}/charges", self.endpoint.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "amount_cents": amount_cents,
            "currency": currency,
            "reference": reference,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "payment gateway returned {} for reference {reference}",
                response.status()
            ));
        }

        let body: GatewayChargeResponse = response.json().await?;
        let status = match body.status.as_str() {
            "succeeded" => ChargeStatus::Succeeded,
            "pending" => ChargeStatus::Pending,
            "failed" => ChargeStatus::Failed,
            other => return Err(anyhow!("payment gateway returned unknown status '{other}'")),
        };

        Ok(GatewayCharge {
            status,
            external_id: body.external_id,
        })
    }
}

/// key: billing-adapter-stub -> local development and tests
pub struct StubGatewayAdapter;

#[async_trait]
impl PaymentGatewayAdapter for StubGatewayAdapter {
    async fn charge(
        &self,
        _amount_cents: i64,
        _currency: &str,
        _reference: &str,
    ) -> Result<GatewayCharge> {
        Ok(GatewayCharge {
            status: ChargeStatus::Succeeded,
            external_id: Some(format!("stub-{}", Uuid::new_v4())),
        })
    }
}

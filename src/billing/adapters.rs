use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// A declined or failed charge. Never surfaced to end users directly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("payment failed: {message}")]
pub struct PaymentFailed {
    pub message: String,
    pub error_code: Option<String>,
    pub decline_code: Option<String>,
}

impl PaymentFailed {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            decline_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentReceipt {
    pub charge_id: String,
    /// Dollars captured.
    pub amount: Decimal,
}

// key: payment-gateway -> charge collaborator for auto top-up
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn has_payment_method(&self, organization_id: i32) -> Result<bool>;
    async fn charge_customer(
        &self,
        organization_id: i32,
        dollars: Decimal,
    ) -> Result<PaymentReceipt, PaymentFailed>;
}

/// Used when no provider bridge is configured: nobody has a card on file.
pub struct UnconfiguredPaymentGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredPaymentGateway {
    async fn has_payment_method(&self, _organization_id: i32) -> Result<bool> {
        Ok(false)
    }

    async fn charge_customer(
        &self,
        _organization_id: i32,
        _dollars: Decimal,
    ) -> Result<PaymentReceipt, PaymentFailed> {
        Err(PaymentFailed {
            message: "payment gateway not configured".into(),
            error_code: Some("gateway_unconfigured".into()),
            decline_code: None,
        })
    }
}

#[derive(Deserialize)]
struct PaymentMethodBody {
    has_payment_method: bool,
}

#[derive(Deserialize)]
struct ChargeBody {
    id: String,
    amount: Decimal,
}

#[derive(Deserialize, Default)]
struct DeclineBody {
    message: Option<String>,
    error_code: Option<String>,
    decline_code: Option<String>,
}

/// JSON bridge to the payment provider.
pub struct HttpPaymentGateway {
    base: String,
    token: Option<String>,
    client: Client,
}

impl HttpPaymentGateway {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            token,
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base, path);
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn has_payment_method(&self, organization_id: i32) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/customers/{organization_id}/payment-method"),
            )
            .send()
            .await
            .context("payment method lookup failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: PaymentMethodBody = response
            .error_for_status()
            .context("payment method lookup rejected")?
            .json()
            .await
            .context("payment method response was not valid JSON")?;
        Ok(body.has_payment_method)
    }

    async fn charge_customer(
        &self,
        organization_id: i32,
        dollars: Decimal,
    ) -> Result<PaymentReceipt, PaymentFailed> {
        let response = self
            .request(reqwest::Method::POST, "/v1/charges")
            .json(&json!({
                "organization_id": organization_id,
                "amount": dollars.to_string(),
                "currency": "usd",
                "purpose": "credit_auto_topup",
            }))
            .send()
            .await
            .map_err(|err| PaymentFailed {
                message: err.to_string(),
                error_code: Some("transport_error".into()),
                decline_code: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: DeclineBody = response.json().await.unwrap_or_default();
            return Err(PaymentFailed {
                message: body
                    .message
                    .unwrap_or_else(|| format!("charge rejected with status {status}")),
                error_code: body.error_code.or_else(|| Some(status.as_u16().to_string())),
                decline_code: body.decline_code,
            });
        }

        let body: ChargeBody = response.json().await.map_err(|err| PaymentFailed {
            message: format!("unreadable charge response: {err}"),
            error_code: Some("invalid_response".into()),
            decline_code: None,
        })?;
        Ok(PaymentReceipt {
            charge_id: body.id,
            amount: body.amount,
        })
    }
}

//! Payment gateway boundary
//!
//! The engine only depends on the gateway's abstract contract: create an
//! invoice, poll its payment status, and charge a stored payment method for
//! renewals. `HttpPaymentGateway` talks to the configured gateway's REST API;
//! `MockPaymentGateway` records calls and plays back scripted outcomes for
//! tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::GatewayError;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Payment status of a gateway invoice or charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to create a payment invoice for a checkout session.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInvoiceRequest {
    /// Checkout session id; echoed back by the gateway as the external
    /// reference on webhook deliveries.
    pub external_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// A gateway-issued invoice. Referenced by the engine, owned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub invoice_url: String,
    pub amount: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry_date: OffsetDateTime,
}

/// Request to charge a stored payment method (auto-renewal).
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub subscription_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub description: String,
}

/// Outcome of a renewal charge attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeOutcome {
    pub reference: String,
    pub status: PaymentStatus,
}

/// Abstract gateway contract.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_invoice(&self, req: CreateInvoiceRequest) -> GatewayResult<Invoice>;

    /// Read-only status poll. Implementations retry transient failures
    /// internally; this is the only gateway call with internal retries.
    async fn invoice_status(&self, invoice_id: &str) -> GatewayResult<PaymentStatus>;

    async fn charge(&self, req: ChargeRequest) -> GatewayResult<ChargeOutcome>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Configuration for the HTTP gateway adapter.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        let get = |key: &str| {
            std::env::var(key)
                .map_err(|_| GatewayError::Transport(format!("missing env var {key}")))
        };
        Ok(Self {
            base_url: get("PAYMENT_GATEWAY_URL")?,
            api_key: get("PAYMENT_GATEWAY_API_KEY")?,
            webhook_secret: get("PAYMENT_GATEWAY_WEBHOOK_SECRET")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct InvoiceStatusResponse {
    status: PaymentStatus,
}

/// Gateway adapter speaking the invoice REST API over HTTPS.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn check_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> GatewayResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(GatewayError::InvoiceNotFound(body));
            }
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_invoice(&self, req: CreateInvoiceRequest) -> GatewayResult<Invoice> {
        tracing::info!(
            external_id = %req.external_id,
            amount = req.amount,
            currency = %req.currency,
            "Creating gateway invoice"
        );
        let response = self
            .client
            .post(self.url("v1/invoices"))
            .bearer_auth(&self.config.api_key)
            .json(&req)
            .send()
            .await?;
        Self::check_response(response).await
    }

    async fn invoice_status(&self, invoice_id: &str) -> GatewayResult<PaymentStatus> {
        // Transient transport failures on this read-only lookup are retried
        // with backoff; everything else propagates.
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let result: InvoiceStatusResponse = Retry::spawn(strategy, || async {
            let response = self
                .client
                .get(self.url(&format!("v1/invoices/{invoice_id}")))
                .bearer_auth(&self.config.api_key)
                .send()
                .await?;
            Self::check_response(response).await
        })
        .await?;
        Ok(result.status)
    }

    async fn charge(&self, req: ChargeRequest) -> GatewayResult<ChargeOutcome> {
        tracing::info!(
            subscription_id = %req.subscription_id,
            amount = req.amount,
            "Charging stored payment method for renewal"
        );
        let response = self
            .client
            .post(self.url("v1/charges"))
            .bearer_auth(&self.config.api_key)
            .json(&req)
            .send()
            .await?;
        Self::check_response(response).await
    }
}

// =============================================================================
// Mock implementation (test seam)
// =============================================================================

/// Recording mock. By default invoices are created successfully and report
/// `paid`; individual behaviors are scriptable per test.
#[derive(Clone, Default)]
pub struct MockPaymentGateway {
    pub created_invoices: Arc<Mutex<Vec<CreateInvoiceRequest>>>,
    pub charges: Arc<Mutex<Vec<ChargeRequest>>>,
    invoice_statuses: Arc<Mutex<HashMap<String, PaymentStatus>>>,
    fail_invoice_creation: Arc<Mutex<bool>>,
    fail_charges: Arc<Mutex<bool>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_invoice` call fail as unavailable.
    pub fn fail_invoice_creation(&self) {
        *lock(&self.fail_invoice_creation) = true;
    }

    /// Make every subsequent `charge` call report a failed payment.
    pub fn fail_charges(&self) {
        *lock(&self.fail_charges) = true;
    }

    /// Script the status reported for a given invoice id.
    pub fn set_invoice_status(&self, invoice_id: &str, status: PaymentStatus) {
        lock(&self.invoice_statuses).insert(invoice_id.to_string(), status);
    }

    pub fn created_invoice_count(&self) -> usize {
        lock(&self.created_invoices).len()
    }

    pub fn charge_count(&self) -> usize {
        lock(&self.charges).len()
    }
}

// Mutex poisoning cannot happen here outside a panicking test; recover the
// inner value rather than unwrapping.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_invoice(&self, req: CreateInvoiceRequest) -> GatewayResult<Invoice> {
        if *lock(&self.fail_invoice_creation) {
            return Err(GatewayError::Transport("mock gateway unavailable".into()));
        }
        let invoice = Invoice {
            id: format!("inv_{}", req.external_id.simple()),
            invoice_url: format!("https://gateway.test/pay/{}", req.external_id),
            amount: req.amount,
            currency: req.currency.clone(),
            expiry_date: req.expires_at,
        };
        lock(&self.invoice_statuses).insert(invoice.id.clone(), PaymentStatus::Pending);
        lock(&self.created_invoices).push(req);
        Ok(invoice)
    }

    async fn invoice_status(&self, invoice_id: &str) -> GatewayResult<PaymentStatus> {
        lock(&self.invoice_statuses)
            .get(invoice_id)
            .copied()
            .ok_or_else(|| GatewayError::InvoiceNotFound(invoice_id.to_string()))
    }

    async fn charge(&self, req: ChargeRequest) -> GatewayResult<ChargeOutcome> {
        let failed = *lock(&self.fail_charges);
        let outcome = ChargeOutcome {
            reference: format!("ch_{}", lock(&self.charges).len() + 1),
            status: if failed {
                PaymentStatus::Failed
            } else {
                PaymentStatus::Paid
            },
        };
        lock(&self.charges).push(req);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn request(amount: i64) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            external_id: Uuid::new_v4(),
            amount,
            currency: "IDR".to_string(),
            description: "Premium monthly".to_string(),
            expires_at: OffsetDateTime::now_utc() + Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn mock_records_created_invoices() {
        let gateway = MockPaymentGateway::new();
        let invoice = gateway.create_invoice(request(290_000)).await.unwrap();

        assert_eq!(invoice.amount, 290_000);
        assert_eq!(gateway.created_invoice_count(), 1);
        assert_eq!(
            gateway.invoice_status(&invoice.id).await.unwrap(),
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_transport_error() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_invoice_creation();

        let err = gateway.create_invoice(request(290_000)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert_eq!(gateway.created_invoice_count(), 0);
    }

    #[tokio::test]
    async fn scripted_paid_status_is_reported() {
        let gateway = MockPaymentGateway::new();
        let invoice = gateway.create_invoice(request(66_667)).await.unwrap();
        gateway.set_invoice_status(&invoice.id, PaymentStatus::Paid);

        assert_eq!(
            gateway.invoice_status(&invoice.id).await.unwrap(),
            PaymentStatus::Paid
        );
    }
}

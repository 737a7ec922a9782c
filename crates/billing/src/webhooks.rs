//! Payment gateway webhook handling
//!
//! Verifies the gateway's HMAC signature, claims each event exactly once,
//! and routes invoice notifications into checkout session completion. A
//! webhook delivery is never trusted on its own: completion still runs
//! through the same idempotent session claim as the user-facing poll.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use staffly_shared::TriggeredBy;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::checkout::{CheckoutService, GatewayConfirmation};
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentStatus;

type HmacSha256 = Hmac<Sha256>;

/// Signatures older than this are rejected.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// An in-flight claim older than this is treated as abandoned.
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// A verified gateway event.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub data: GatewayEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEventData {
    /// Echo of the checkout session id we sent as `external_id`. Some event
    /// types only carry the invoice reference.
    pub external_id: Option<Uuid>,
    pub invoice_id: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
}

/// A prior delivery attempt as recorded in the event ledger.
#[derive(Debug, sqlx::FromRow)]
struct PriorAttempt {
    processing_result: String,
    processing_started_at: Option<OffsetDateTime>,
}

/// Whether a redelivery may take over a previously recorded attempt.
///
/// Errored attempts are always retryable: the endpoint answered 5xx and the
/// gateway keeps redelivering until it sees success. In-flight attempts are
/// only taken over once stale, so a slow worker is not raced.
fn attempt_reclaimable(prior: &PriorAttempt, now: OffsetDateTime) -> bool {
    match prior.processing_result.as_str() {
        "error" => true,
        "processing" => match prior.processing_started_at {
            Some(started) => now - started > Duration::minutes(PROCESSING_TIMEOUT_MINUTES),
            None => true,
        },
        _ => false,
    }
}

/// Webhook handler for payment gateway events.
pub struct WebhookHandler {
    pool: PgPool,
    checkout: CheckoutService,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, checkout: CheckoutService, webhook_secret: String) -> Self {
        Self {
            pool,
            checkout,
            webhook_secret,
        }
    }

    /// Verify the signature header and parse the event payload.
    ///
    /// Header format: `t=<unix seconds>,v1=<hex hmac-sha256 of "t.payload">`.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<GatewayEvent> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => v1_signature = Some(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("Missing v1 signature in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{timestamp}.{payload}");
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: GatewayEvent = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Webhook payload failed to parse after verification");
            BillingError::WebhookSignatureInvalid
        })?;
        Ok(event)
    }

    /// Handle a verified gateway event.
    ///
    /// The `INSERT ... ON CONFLICT DO NOTHING ... RETURNING` claim guarantees
    /// that only one concurrent delivery processes a given event id. A
    /// redelivery of an event whose earlier attempt errored, or whose claim
    /// went stale mid-flight, takes the claim over instead of being absorbed
    /// as a duplicate.
    pub async fn handle_event(&self, event: GatewayEvent) -> BillingResult<()> {
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (gateway_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (gateway_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event_timestamp)
        .fetch_optional(&self.pool)
        .await?;

        let claimed = match inserted {
            Some(row) => Some(row),
            None => self.reclaim_event(&event.id).await?,
        };

        if claimed.is_none() {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, already claimed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing gateway webhook event"
        );

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        sqlx::query(
            "UPDATE webhook_events SET processing_result = $1, error_message = $2, \
             processed_at = NOW() WHERE gateway_event_id = $3",
        )
        .bind(processing_result)
        .bind(error_message)
        .bind(&event.id)
        .execute(&self.pool)
        .await?;

        result
    }

    /// Take over a retryable prior attempt. The update is a compare-and-swap
    /// on the observed row state, so two concurrent redeliveries cannot both
    /// win the claim.
    async fn reclaim_event(&self, gateway_event_id: &str) -> BillingResult<Option<(Uuid,)>> {
        let prior: Option<PriorAttempt> = sqlx::query_as(
            "SELECT processing_result, processing_started_at FROM webhook_events \
             WHERE gateway_event_id = $1",
        )
        .bind(gateway_event_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(prior) = prior else {
            return Ok(None);
        };
        if !attempt_reclaimable(&prior, OffsetDateTime::now_utc()) {
            return Ok(None);
        }

        let row: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE webhook_events SET processing_result = 'processing', \
             processing_started_at = NOW(), error_message = NULL \
             WHERE gateway_event_id = $1 AND processing_result = $2 \
               AND processing_started_at IS NOT DISTINCT FROM $3 \
             RETURNING id",
        )
        .bind(gateway_event_id)
        .bind(&prior.processing_result)
        .bind(prior.processing_started_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn process_event(&self, event: &GatewayEvent) -> BillingResult<()> {
        let session_id = self.resolve_session_id(&event.data).await?;
        match event.data.status {
            PaymentStatus::Paid => {
                let subscription = self
                    .checkout
                    .complete_session(
                        session_id,
                        GatewayConfirmation {
                            status: PaymentStatus::Paid,
                            transaction_id: event.data.transaction_id.clone(),
                        },
                        TriggeredBy::Webhook,
                    )
                    .await?;
                tracing::info!(
                    session_id = %session_id,
                    subscription_id = %subscription.id,
                    "Webhook completed checkout session"
                );
                Ok(())
            }
            PaymentStatus::Expired => {
                match self
                    .checkout
                    .complete_session(
                        session_id,
                        GatewayConfirmation {
                            status: PaymentStatus::Expired,
                            transaction_id: None,
                        },
                        TriggeredBy::Webhook,
                    )
                    .await
                {
                    // The expiry was applied; the error is the caller-facing
                    // shape, not a processing failure.
                    Err(BillingError::SessionExpired(_)) => Ok(()),
                    Err(BillingError::InvalidSession { .. }) => Ok(()),
                    Err(e) => Err(e),
                    Ok(_) => Ok(()),
                }
            }
            // A failed attempt does not consume the session; the tenant can
            // retry payment on the same invoice until the session times out.
            PaymentStatus::Failed | PaymentStatus::Pending => {
                tracing::info!(
                    session_id = %session_id,
                    status = ?event.data.status,
                    "Payment not completed, session left pending"
                );
                Ok(())
            }
        }
    }

    /// Events normally echo the session id we sent as `external_id`; fall
    /// back to looking the session up by the gateway's invoice reference.
    async fn resolve_session_id(&self, data: &GatewayEventData) -> BillingResult<Uuid> {
        if let Some(id) = data.external_id {
            return Ok(id);
        }
        let session = self
            .checkout
            .session_by_external_reference(&data.invoice_id)
            .await?
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "no checkout session for gateway invoice {}",
                    data.invoice_id
                ))
            })?;
        Ok(session.id)
    }
}

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use jobboard_core::types::{NotificationKind, Payment, Subscription};
use jobboard_storage::{RepoError, SettlementOutcome};

use crate::error::ProblemResponse;
use crate::router::AppState;

pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_TIMESTAMP: &str = "X-Signature-Timestamp";
const MAX_SKEW_SECS: i64 = 600;

pub fn routes() -> Router<AppState> {
    Router::new().route("/payments/webhook", post(handle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CallbackStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Deserialize)]
struct Callback {
    reference: String,
    status: CallbackStatus,
}

#[derive(Debug, Serialize)]
struct SettlementResponse {
    applied: bool,
    payment: Payment,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription: Option<Subscription>,
}

fn rejected(
    result: &'static str,
    status: StatusCode,
    problem: &'static str,
    detail: impl Into<String>,
) -> ProblemResponse {
    counter!("payments_webhook_total", "result" => result).increment(1);
    ProblemResponse::new(status, problem, detail)
}

/// Payment-provider callback. The signature covers the timestamp header
/// followed by the raw body.
async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SettlementResponse>, ProblemResponse> {
    let timestamp_raw = get_required_header(&headers, HEADER_TIMESTAMP)?;
    let signature = get_required_header(&headers, HEADER_SIGNATURE)?;

    let timestamp = parse_timestamp(timestamp_raw).map_err(|err| {
        rejected("invalid_timestamp", StatusCode::BAD_REQUEST, "invalid_timestamp", err)
    })?;
    let now = state.now();
    let skew = now.signed_duration_since(timestamp).num_seconds().abs();
    if skew > MAX_SKEW_SECS {
        warn!(
            stage = "payments",
            %timestamp_raw,
            skew_seconds = skew,
            "timestamp outside ±10 minute window"
        );
        return Err(rejected(
            "stale",
            StatusCode::BAD_REQUEST,
            "timestamp_out_of_range",
            "timestamp outside the allowed ±10 minute window",
        ));
    }

    verify_signature(&state.settings().webhook_secret, timestamp_raw, &body, signature)
        .map_err(|err| {
            rejected("invalid_signature", StatusCode::FORBIDDEN, "invalid_signature", err)
        })?;

    let callback: Callback = serde_json::from_slice(&body).map_err(|err| {
        rejected(
            "invalid_payload",
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse payload: {err}"),
        )
    })?;

    let succeeded = callback.status == CallbackStatus::Succeeded;
    let outcome = state
        .storage()
        .billing()
        .settle_payment(&callback.reference, succeeded, now)
        .await
        .map_err(|err| match err {
            RepoError::NotFound => rejected(
                "unknown_reference",
                StatusCode::NOT_FOUND,
                "not_found",
                "payment not found",
            ),
            other => {
                error!(stage = "payments", error = %other, "failed to settle payment");
                rejected(
                    "error",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error",
                )
            }
        })?;

    let response = match outcome {
        SettlementOutcome::AlreadySettled(payment) => {
            counter!("payments_webhook_total", "result" => "duplicate").increment(1);
            info!(stage = "payments", reference = %payment.reference, "payment already settled");
            SettlementResponse {
                applied: false,
                payment,
                subscription: None,
            }
        }
        SettlementOutcome::Applied { payment, subscription } => {
            let result = if succeeded { "succeeded" } else { "failed" };
            counter!("payments_webhook_total", "result" => result).increment(1);
            info!(
                stage = "payments",
                reference = %payment.reference,
                subscription_id = %subscription.id,
                status = %subscription.status,
                "payment settled"
            );
            notify_owner(&state, &subscription, succeeded).await;
            SettlementResponse {
                applied: true,
                payment,
                subscription: Some(subscription),
            }
        }
    };
    Ok(Json(response))
}

async fn notify_owner(state: &AppState, subscription: &Subscription, succeeded: bool) {
    let owner = match state.storage().companies().find(&subscription.company_id).await {
        Ok(Some(company)) => company.owner_id,
        Ok(None) => return,
        Err(err) => {
            warn!(stage = "payments", error = %err, "failed to load company for payment notice");
            return;
        }
    };
    let (title, body) = if succeeded {
        ("Subscription activated", "Your payment was received and your plan is active.")
    } else {
        ("Payment failed", "Your payment did not go through. The plan was not changed.")
    };
    if let Err(err) = state
        .notifier()
        .notify(
            &owner,
            NotificationKind::System,
            title,
            body,
            json!({"subscription_id": subscription.id}),
        )
        .await
    {
        warn!(stage = "notify", error = %err, "failed to notify company owner");
    }
}

fn get_required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            rejected(
                "missing_header",
                StatusCode::BAD_REQUEST,
                "missing_header",
                format!("missing header {name}"),
            )
        })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

fn verify_signature(
    secret: &Arc<[u8]>,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

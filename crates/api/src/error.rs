//! API error type and response envelope
//!
//! Every response body is `{"success": true, "data": ...}` or
//! `{"success": false, "error": {"code": ..., "message": ...}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use inkwell_billing::{BillingError, PaymentErrorKind};
use serde::Serialize;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

/// Successful envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::InvalidInput(_)
        | BillingError::InvalidAmount(_)
        | BillingError::AmountMismatch { .. }
        | BillingError::InvalidPlan(_)
        | BillingError::InvalidPackage(_)
        | BillingError::WebhookPayloadInvalid(_) => StatusCode::BAD_REQUEST,
        BillingError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
        BillingError::NotFound(_)
        | BillingError::ProfileNotFound(_)
        | BillingError::PaymentNotFound(_)
        | BillingError::SubscriptionNotFound => StatusCode::NOT_FOUND,
        BillingError::SubscriptionAlreadyActive
        | BillingError::SubscriptionAlreadyCanceled
        | BillingError::InvalidTransition { .. }
        | BillingError::InvalidPaymentTransition { .. }
        | BillingError::ConcurrentModification(_)
        | BillingError::WebhookRetryExhausted(_)
        | BillingError::RefundFailed(_) => StatusCode::CONFLICT,
        BillingError::BillingKeyRequired | BillingError::InsufficientCredits { .. } => {
            StatusCode::PAYMENT_REQUIRED
        }
        BillingError::DailyQuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
        BillingError::Gateway(e) => match e.kind {
            PaymentErrorKind::Terminal => StatusCode::PAYMENT_REQUIRED,
            PaymentErrorKind::Transient | PaymentErrorKind::Unknown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        },
        BillingError::Config(_)
        | BillingError::Database(_)
        | BillingError::Lock(_)
        | BillingError::Encryption(_)
        | BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Billing(e) => billing_status(e),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Billing(e) => e.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Billing(BillingError::Gateway(e)) => e.user_message().to_string(),
            _ if self.status().is_server_error() => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = %self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = %self.code(), "Request rejected");
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_billing::PaymentError;

    #[test]
    fn test_billing_errors_map_to_status() {
        let cases = [
            (BillingError::InvalidPlan("x".into()), StatusCode::BAD_REQUEST),
            (
                BillingError::AmountMismatch {
                    expected: 100,
                    actual: 1,
                },
                StatusCode::BAD_REQUEST,
            ),
            (BillingError::SubscriptionNotFound, StatusCode::NOT_FOUND),
            (BillingError::SubscriptionAlreadyActive, StatusCode::CONFLICT),
            (BillingError::DailyQuotaExhausted, StatusCode::TOO_MANY_REQUESTS),
            (
                BillingError::Gateway(PaymentError::terminal("REJECT_CARD_PAYMENT", "declined")),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                BillingError::Gateway(PaymentError::transient("PROVIDER_ERROR", "busy")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BillingError::Database("gone".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = ApiError::from(BillingError::Database("password=hunter2".into()));
        assert_eq!(err.message(), "Internal server error");
        assert_eq!(err.code(), "DATABASE_ERROR");

        let err = ApiError::from(BillingError::InvalidPlan("enterprise".into()));
        assert!(err.message().contains("enterprise"));
    }
}

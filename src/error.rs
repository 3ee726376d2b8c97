use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, warn};

use crate::responses::RequestMeta;

pub const E_BAD_REQUEST: &str = "BAD_REQUEST";
pub const E_BAD_ORDER_NUMBER: &str = "BAD_ORDER_NUMBER";
pub const E_BAD_SUM: &str = "BAD_SUM";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_LOGIN_TAKEN: &str = "LOGIN_TAKEN";
pub const E_BAD_CREDENTIALS: &str = "BAD_CREDENTIALS";
pub const E_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const E_ORDER_CONFLICT: &str = "ORDER_CONFLICT";
pub const E_INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";
const E_INTERNAL: &str = "INTERNAL";

/// Failure of a market request, one variant per response status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    /// Withdrawal exceeds the current balance.
    PaymentRequired(String),
    Conflict(String),
    /// Well-formed request carrying an invalid order number or sum.
    Unprocessable(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

/// An [`ApiError`] bound to the request it answers, plus a machine-readable code.
#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<&'static str>,
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.status()
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    request_id: &'a str,
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = self.meta.request_id.as_str();
        let message = match self.error {
            ApiError::Internal(e) => {
                error!(request_id, request_at = %self.meta.request_at, code = self.code, "internal error: {:?}", e);
                "internal server error".to_string()
            }
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::PaymentRequired(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unprocessable(msg) => {
                warn!(request_id, %status, "request rejected: {msg}");
                msg
            }
        };

        let body = ErrorBody {
            request_id,
            error: message,
            code: self.code.unwrap_or(E_INTERNAL),
        };
        (status, Json(body)).into_response()
    }
}

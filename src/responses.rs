use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Per-request identity, echoed in the `x-request-id` header and error bodies.
#[derive(Clone, Debug)]
pub struct RequestMeta {
    pub request_id: String,
    pub request_at: DateTime<Utc>,
}

impl RequestMeta {
    pub(crate) fn now() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            request_at: Utc::now(),
        }
    }
}

/// Stamps each request with a [`RequestMeta`] and echoes its id as `x-request-id`.
pub async fn meta_middleware(mut req: Request<Body>, next: Next) -> Response {
    let meta = RequestMeta::now();
    let id = HeaderValue::from_str(&meta.request_id).ok();
    req.extensions_mut().insert(meta);

    let mut resp = next.run(req).await;
    if let Some(id) = id {
        resp.headers_mut().insert(REQUEST_ID_HEADER, id);
    }
    resp
}

/// Successful reply: status, extra headers and an optional bare JSON body.
pub struct ApiOk<T> {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<T>,
}

impl<T> ApiOk<T> {
    fn with_body(status: StatusCode, data: T) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Some(data),
        }
    }

    pub fn ok(data: T) -> Self {
        Self::with_body(StatusCode::OK, data)
    }

    /// 202, used when an order is queued for scoring.
    pub fn accepted(data: T) -> Self {
        Self::with_body(StatusCode::ACCEPTED, data)
    }

    /// 204, no body. Empty listings answer with this.
    pub fn no_content() -> Self {
        Self {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        match self.body {
            Some(body) => (self.status, self.headers, Json(body)).into_response(),
            None => (self.status, self.headers).into_response(),
        }
    }
}

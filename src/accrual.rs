//! Client for the external accrual provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::types::OrderStatus;

/// The provider's view of an order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderAccrual {
    pub order: String,
    pub status: ProviderStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl From<ProviderStatus> for OrderStatus {
    fn from(status: ProviderStatus) -> Self {
        match status {
            ProviderStatus::Registered | ProviderStatus::Processing => OrderStatus::Processing,
            ProviderStatus::Invalid => OrderStatus::Invalid,
            ProviderStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// What a single lookup told us.
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualOutcome {
    /// The provider knows the order.
    Ready(OrderAccrual),
    /// The provider has no record of the order yet.
    NotYetKnown,
    /// Back off; carries the provider's `Retry-After` when it sent one.
    RateLimited(Option<Duration>),
}

#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    #[error("accrual request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected accrual response status {0}")]
    UnexpectedStatus(StatusCode),
}

/// One lookup per call; retrying is the caller's business.
#[async_trait]
pub trait AccrualProvider: Send + Sync {
    async fn fetch(&self, number: &str) -> Result<AccrualOutcome, AccrualError>;
}

pub struct HttpAccrualClient {
    client: Client,
    base_url: String,
}

impl HttpAccrualClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AccrualError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    fn order_url(&self, number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, number)
    }
}

#[async_trait]
impl AccrualProvider for HttpAccrualClient {
    async fn fetch(&self, number: &str) -> Result<AccrualOutcome, AccrualError> {
        let url = self.order_url(number);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        debug!(%url, %status, "accrual provider responded");

        match status {
            StatusCode::OK => Ok(AccrualOutcome::Ready(response.json().await?)),
            StatusCode::NO_CONTENT => Ok(AccrualOutcome::NotYetKnown),
            StatusCode::TOO_MANY_REQUESTS => Ok(AccrualOutcome::RateLimited(retry_after(&response))),
            other => Err(AccrualError::UnexpectedStatus(other)),
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn provider(Path(number): Path<String>) -> Response {
        match number.as_str() {
            "12345678903" => Json(json!({"order": number, "status": "PROCESSED", "accrual": 500})).into_response(),
            "9278923470" => Json(json!({"order": number, "status": "REGISTERED"})).into_response(),
            "2377225624" => StatusCode::NO_CONTENT.into_response(),
            "49927398716" => {
                let mut headers = HeaderMap::new();
                headers.insert("Retry-After", "7".parse().unwrap());
                (StatusCode::TOO_MANY_REQUESTS, headers, "No more than N requests per minute allowed").into_response()
            }
            "1234566" => (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response(),
            "0" => (StatusCode::OK, "not json").into_response(),
            _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    async fn start_provider() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/api/orders/{number}", get(provider));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn client() -> HttpAccrualClient {
        let addr = start_provider().await;
        HttpAccrualClient::new(format!("http://{addr}/"), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn processed_order_is_ready() {
        let outcome = client().await.fetch("12345678903").await.unwrap();
        assert_eq!(
            outcome,
            AccrualOutcome::Ready(OrderAccrual {
                order: "12345678903".into(),
                status: ProviderStatus::Processed,
                accrual: Some(Decimal::from(500)),
            })
        );
    }

    #[tokio::test]
    async fn registered_order_has_no_accrual() {
        let outcome = client().await.fetch("9278923470").await.unwrap();
        let AccrualOutcome::Ready(acc) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert_eq!(acc.status, ProviderStatus::Registered);
        assert_eq!(acc.accrual, None);
        assert_eq!(OrderStatus::from(acc.status), OrderStatus::Processing);
    }

    #[tokio::test]
    async fn no_content_means_not_yet_known() {
        let outcome = client().await.fetch("2377225624").await.unwrap();
        assert_eq!(outcome, AccrualOutcome::NotYetKnown);
    }

    #[tokio::test]
    async fn too_many_requests_carries_retry_after() {
        let c = client().await;
        assert_eq!(
            c.fetch("49927398716").await.unwrap(),
            AccrualOutcome::RateLimited(Some(Duration::from_secs(7)))
        );
        assert_eq!(c.fetch("1234566").await.unwrap(), AccrualOutcome::RateLimited(None));
    }

    #[tokio::test]
    async fn server_error_and_garbage_are_errors() {
        let c = client().await;
        assert!(matches!(
            c.fetch("1").await,
            Err(AccrualError::UnexpectedStatus(StatusCode::INTERNAL_SERVER_ERROR))
        ));
        assert!(matches!(c.fetch("0").await, Err(AccrualError::Http(_))));
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_error() {
        let c = HttpAccrualClient::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        assert!(c.fetch("12345678903").await.is_err());
    }
}

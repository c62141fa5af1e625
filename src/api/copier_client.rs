//! HTTP client for the external copy engine.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::LifecycleError;
use crate::models::SettlementPeriod;

use super::types::{ProfitResponse, ToggleRequest, ToggleResponse};
use super::CopyEngine;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Non-retryable response from the copy engine.
#[derive(Debug, Error)]
#[error("copy engine rejected {resource} {id}: {status} - {body}")]
pub struct CopierRejected {
    pub status: StatusCode,
    pub resource: &'static str,
    pub id: String,
    pub body: String,
}

impl CopierRejected {
    async fn from_response(response: Response, resource: &'static str, id: &str) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self {
            status,
            resource,
            id: id.to_string(),
            body,
        }
    }
}

/// Client for the copy engine's profit and account-control endpoints.
pub struct CopierClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    backoff: ExponentialBackoff,
    max_retries: u32,
}

impl CopierClient {
    /// Create a client for `base_url`, authenticating with `api_key` if set.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            backoff,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Sets the maximum number of retry attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Fetch total copied-trade profit for a group over a period.
    pub async fn get_group_profit(
        &self,
        group_id: &str,
        period: &SettlementPeriod,
    ) -> Result<ProfitResponse> {
        let url = format!("{}/groups/{}/profit", self.base_url, group_id);
        let from = period.start().to_rfc3339();
        let to = period.end().to_rfc3339();

        debug!(url = %url, from = %from, to = %to, "Fetching group profit");

        let response = self
            .send_with_retry(|| {
                self.client
                    .get(&url)
                    .query(&[("from", from.as_str()), ("to", to.as_str())])
            })
            .await
            .context("Failed to fetch group profit")?;

        if !response.status().is_success() {
            return Err(CopierRejected::from_response(response, "Group", group_id)
                .await
                .into());
        }

        response
            .json()
            .await
            .context("Failed to parse profit response")
    }

    /// Enable or disable trade copying for a member account.
    pub async fn toggle_account(&self, account_id: &str, enabled: bool) -> Result<()> {
        let url = format!("{}/control/toggle/{}", self.base_url, account_id);
        let body = ToggleRequest { enabled };

        debug!(url = %url, enabled, "Toggling copy account");

        let response = self
            .send_with_retry(|| self.client.put(&url).json(&body))
            .await
            .context("Failed to toggle copy account")?;

        if !response.status().is_success() {
            return Err(CopierRejected::from_response(response, "Copy account", account_id)
                .await
                .into());
        }

        let text = response
            .text()
            .await
            .context("Failed to read toggle response")?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let reply: ToggleResponse =
            serde_json::from_str(&text).context("Failed to parse toggle response")?;
        if !reply.success {
            anyhow::bail!(
                "Copy engine refused toggle: {}",
                reply.message.unwrap_or_default()
            );
        }

        Ok(())
    }

    /// Send a request, retrying transport errors and 5xx responses with
    /// exponential backoff.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut backoff = self.backoff.clone();
        let mut attempts = 0;

        loop {
            let mut request = build();
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let failure = match request.send().await {
                Ok(response) if !is_retryable_status(response.status()) => return Ok(response),
                Ok(response) => format!("server returned {}", response.status()),
                Err(e) => e.to_string(),
            };

            attempts += 1;
            if attempts > self.max_retries {
                warn!(attempts, error = %failure, "Copy engine request failed, giving up");
                anyhow::bail!("copy engine request failed after {} attempts: {}", attempts, failure);
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(attempt = attempts, delay = ?delay, error = %failure, "Retrying copy engine request");
                    tokio::time::sleep(delay).await;
                }
                None => anyhow::bail!("copy engine retry window elapsed: {}", failure),
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Map a client failure onto the lifecycle taxonomy. Only transport
/// failures, exhausted retries and malformed replies stay retryable.
fn classify(err: anyhow::Error) -> LifecycleError {
    let Some(rejected) = err.downcast_ref::<CopierRejected>() else {
        return LifecycleError::CollaboratorUnavailable {
            collaborator: "copy engine",
            message: format!("{:#}", err),
        };
    };

    match rejected.status {
        StatusCode::NOT_FOUND => LifecycleError::NotFound {
            entity: rejected.resource,
            id: rejected.id.clone(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            LifecycleError::Internal(format!("copy engine credentials refused: {}", rejected))
        }
        status if status.is_client_error() => LifecycleError::Validation(rejected.to_string()),
        _ => LifecycleError::CollaboratorUnavailable {
            collaborator: "copy engine",
            message: rejected.to_string(),
        },
    }
}

#[async_trait]
impl CopyEngine for CopierClient {
    async fn gross_profit(
        &self,
        group_id: &str,
        period: &SettlementPeriod,
    ) -> crate::error::Result<Decimal> {
        let response = self
            .get_group_profit(group_id, period)
            .await
            .map_err(classify)?;
        Ok(response.total_profit)
    }

    async fn set_copying(&self, account_id: &str, enabled: bool) -> crate::error::Result<()> {
        self.toggle_account(account_id, enabled)
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rejected(status: StatusCode) -> anyhow::Error {
        CopierRejected {
            status,
            resource: "Group",
            id: "g1".to_string(),
            body: String::new(),
        }
        .into()
    }

    fn week() -> SettlementPeriod {
        let end = Utc::now();
        SettlementPeriod::new(end - ChronoDuration::days(7), end).unwrap()
    }

    async fn engine(server: &MockServer) -> CopierClient {
        CopierClient::new(&server.uri(), None)
            .unwrap()
            .with_max_retries(0)
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn test_base_url_normalized() {
        let client = CopierClient::new("http://copier.local/api/", None).unwrap();
        assert_eq!(client.base_url, "http://copier.local/api");
        assert_eq!(client.with_max_retries(0).max_retries, 0);
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_unavailable() {
        let client = CopierClient::new("http://127.0.0.1:9", None)
            .unwrap()
            .with_max_retries(0);

        let err = client.set_copying("acct-1", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorUnavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = classify(rejected(StatusCode::NOT_FOUND));
        assert!(matches!(err, LifecycleError::NotFound { entity: "Group", .. }));
        assert!(!err.is_retryable());

        let err = classify(rejected(StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = classify(rejected(StatusCode::FORBIDDEN));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_retryable());

        let err = classify(anyhow::anyhow!("connection reset"));
        assert_eq!(err.kind(), ErrorKind::CollaboratorUnavailable);
    }

    #[tokio::test]
    async fn test_unknown_group_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/g-missing/profit"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such group"))
            .expect(1)
            .mount(&server)
            .await;

        let err = engine(&server)
            .await
            .gross_profit("g-missing", &week())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_profit_parsed_from_engine() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/g1/profit"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "group_id": "g1",
                    "total_profit": "1250.50"
                })),
            )
            .mount(&server)
            .await;

        let profit = engine(&server).await.gross_profit("g1", &week()).await.unwrap();
        assert_eq!(profit, dec!(1250.50));
    }

    #[tokio::test]
    async fn test_malformed_toggle_reply_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/control/toggle/acct-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/control/toggle/acct-2"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = engine(&server).await;
        let err = client.toggle_account("acct-1", false).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse toggle response"));

        client.toggle_account("acct-2", true).await.unwrap();
    }
}

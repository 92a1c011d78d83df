use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::DeliveryFailure;

/// The processing API events are relayed to.
///
/// Implementations are stateless and shared between every ingress request
/// and every drain worker. A call never outlives `timeout` and reports
/// failures as values, never by panicking.
#[async_trait]
pub trait DownstreamApi: Send + Sync {
    async fn deliver(&self, payload: &[u8], timeout: Duration) -> Result<(), DeliveryFailure>;
}

/// HTTP implementation: `POST <url>` with the raw payload as JSON body.
///
/// Only `200 OK` counts as success. Any other status, including other
/// 2xx codes, is a failure.
#[derive(Debug, Clone)]
pub struct HttpDownstream {
    client: reqwest::Client,
    url: String,
}

impl HttpDownstream {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DownstreamApi for HttpDownstream {
    async fn deliver(&self, payload: &[u8], timeout: Duration) -> Result<(), DeliveryFailure> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status() == StatusCode::OK => Ok(()),
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), url = %self.url, "downstream rejected event");
                Err(DeliveryFailure::Status(resp.status().as_u16()))
            }
            Err(err) => {
                debug!(error = %err, url = %self.url, "downstream unreachable");
                if err.is_timeout() {
                    Err(DeliveryFailure::Timeout)
                } else {
                    Err(DeliveryFailure::Network)
                }
            }
        }
    }
}

//! Response producers. A device with a reachable gateway answers requests; otherwise it relays.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("no gateway configured")]
    Unavailable,
    #[error("gateway returned {0}")]
    Status(reqwest::StatusCode),
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Answers completed requests. Queried for capability once per completed request.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    fn has_response_capability(&self) -> bool;
    async fn produce_response(&self, request: &str) -> Result<String, ResponderError>;
}

/// Relay-only device.
pub struct NoGateway;

#[async_trait]
impl Responder for NoGateway {
    fn has_response_capability(&self) -> bool {
        false
    }

    async fn produce_response(&self, _request: &str) -> Result<String, ResponderError> {
        Err(ResponderError::Unavailable)
    }
}

/// Posts the request text to an HTTP endpoint and returns the body as the response.
pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
    online: AtomicBool,
}

impl HttpGateway {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ResponderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            online: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Any HTTP answer, even an error status, means the gateway is reachable.
    pub async fn probe(&self) -> bool {
        let reachable = self.client.head(&self.url).send().await.is_ok();
        self.set_online(reachable);
        reachable
    }

    fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(url = %self.url, online, "gateway reachability changed");
        }
    }

    /// Probe forever at `interval`.
    pub async fn run_probe_loop(self: Arc<Self>, interval: Duration) {
        loop {
            let reachable = self.probe().await;
            debug!(reachable, "gateway probe");
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl Responder for HttpGateway {
    fn has_response_capability(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn produce_response(&self, request: &str) -> Result<String, ResponderError> {
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.to_string())
            .send()
            .await
            .inspect_err(|_| self.set_online(false))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ResponderError::Status(status));
        }
        Ok(resp.text().await?)
    }
}

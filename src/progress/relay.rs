//! Outbound progress relay
//!
//! Forwards every broadcast event to a configured downstream endpoint
//! through the [`TransportManager`], so external dashboards get pushes
//! without holding a listener connection against this process. The
//! relay stops once both channels are exhausted; delivery resumes on
//! the next process start.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::broadcaster::ProgressEvent;
use super::transport::{
    ChannelState, FallbackStream, PushChannel, TransportError, TransportManager,
};

/// JSON-over-HTTP delivery for relayed progress events. Used for both
/// the push endpoint and the fallback endpoint; only the URL differs.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    async fn check(&self) -> Result<(), TransportError> {
        self.client
            .head(&self.url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    async fn post(&self, event: &ProgressEvent) -> Result<(), TransportError> {
        let body =
            serde_json::to_vec(event).map_err(|e| TransportError::Send(e.to_string()))?;
        self.client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl PushChannel for WebhookChannel {
    async fn connect(&self) -> Result<(), TransportError> {
        self.check().await
    }
    async fn send(&self, event: &ProgressEvent) -> Result<(), TransportError> {
        self.post(event).await
    }
}

#[async_trait]
impl FallbackStream for WebhookChannel {
    async fn connect(&self) -> Result<(), TransportError> {
        self.check().await
    }
    async fn send(&self, event: &ProgressEvent) -> Result<(), TransportError> {
        self.post(event).await
    }
}

/// Drain a broadcaster subscription into the transport manager.
///
/// Connects lazily on the first event and reconnects after send
/// failures; once the manager reports `Error` (both channels spent)
/// the relay gives up rather than retry forever.
pub async fn relay_events(
    manager: Arc<TransportManager>,
    mut events: UnboundedReceiver<ProgressEvent>,
) {
    while let Some(event) = events.recv().await {
        match manager.state() {
            ChannelState::Error => {
                warn!("Progress relay channels exhausted, stopping");
                return;
            }
            ChannelState::Disconnected => {
                if manager.connect().await.is_err() {
                    warn!("Progress relay could not establish a channel, stopping");
                    return;
                }
            }
            ChannelState::Push | ChannelState::Fallback => {}
        }

        if let Err(e) = manager.send(&event).await {
            warn!(error = %e, job_id = %event.job_id(), "Progress relay send failed");
        }
    }
    debug!("Progress relay source closed");
}

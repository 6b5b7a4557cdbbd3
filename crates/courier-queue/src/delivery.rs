//! Posting pending activities to remote inboxes.

use crate::error::{DeliveryFailure, JobError, PersistenceError};
use crate::tracker::DeliveryTargetTracker;
use async_trait::async_trait;
use courier_config::DeliveryConfig;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Content type of posted activities.
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Sends one serialized activity to one inbox.
///
/// Returns the status code when the activity counts as delivered (2xx, or
/// 410 for a deleted recipient).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, inbox: &str, payload: &str) -> Result<u16, DeliveryFailure>;
}

/// Map a response status to a delivery outcome.
pub fn classify_status(status: StatusCode) -> Result<u16, DeliveryFailure> {
    let code = status.as_u16();
    if status.is_success() || status == StatusCode::GONE {
        Ok(code)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        Err(DeliveryFailure::Throttled(code))
    } else if status.is_client_error() {
        Err(DeliveryFailure::ClientError(code))
    } else if status.is_server_error() {
        Err(DeliveryFailure::ServerError(code))
    } else {
        Err(DeliveryFailure::Transport(format!("unexpected status {}", code)))
    }
}

/// HTTP transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    user_agent: String,
}

impl HttpTransport {
    /// Create a transport with the configured timeout and user agent.
    pub fn new(config: &DeliveryConfig) -> Result<Self, JobError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| JobError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, inbox: &str, payload: &str) -> Result<u16, DeliveryFailure> {
        let url = Url::parse(inbox)
            .map_err(|e| DeliveryFailure::Transport(format!("invalid inbox {:?}: {}", inbox, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DeliveryFailure::Transport(format!("unsupported scheme {:?}", url.scheme())));
        }

        let response = self
            .client
            .post(url)
            .header("User-Agent", &self.user_agent)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Accept", "application/activity+json, application/ld+json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryFailure::Timeout
                } else {
                    DeliveryFailure::Transport(e.to_string())
                }
            })?;

        classify_status(response.status())
    }
}

/// Result of one delivery run for an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    pub inbox: String,
    /// No server failure stopped the run.
    pub success: bool,
    /// Last status code received.
    pub status_code: Option<u16>,
    /// Activities accepted by the remote.
    pub delivered: usize,
    /// Activities permanently rejected and dropped.
    pub dropped: usize,
    /// The failure that stopped the run.
    pub failure: Option<DeliveryFailure>,
}

impl DeliveryReport {
    /// The remote accepted at least one activity and nothing failed.
    pub fn reached_remote(&self) -> bool {
        self.success && self.delivered > 0
    }
}

/// Delivers everything pending for an inbox.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboxDelivery: Send + Sync {
    async fn deliver(&self, inbox: &str) -> Result<DeliveryReport, PersistenceError>;
}

/// Posts stored activities oldest first through a [`Transport`].
///
/// Delivered and rejected activities are removed from the store; a server
/// failure or throttling stops the run and leaves the rest pending. Failure
/// counters are left to the caller, see
/// [`DeliveryTargetTracker::record_report`].
pub struct ActivityDeliverer {
    tracker: Arc<DeliveryTargetTracker>,
    transport: Arc<dyn Transport>,
}

impl ActivityDeliverer {
    pub fn new(tracker: Arc<DeliveryTargetTracker>, transport: Arc<dyn Transport>) -> Self {
        Self { tracker, transport }
    }
}

#[async_trait]
impl InboxDelivery for ActivityDeliverer {
    async fn deliver(&self, inbox: &str) -> Result<DeliveryReport, PersistenceError> {
        let pending = self.tracker.pending_for_inbox(inbox).await?;
        let mut report = DeliveryReport {
            inbox: inbox.to_string(),
            ..DeliveryReport::default()
        };

        for activity in pending {
            match self.transport.post(inbox, &activity.payload).await {
                Ok(code) => {
                    report.status_code = Some(code);
                    report.delivered += 1;
                    self.tracker.mark_delivered(inbox, &activity.activity_id).await?;
                    debug!(inbox = %inbox, activity_id = %activity.activity_id, status = code, "Activity delivered");
                }
                Err(DeliveryFailure::ClientError(code)) => {
                    report.status_code = Some(code);
                    report.dropped += 1;
                    self.tracker.mark_delivered(inbox, &activity.activity_id).await?;
                    warn!(inbox = %inbox, activity_id = %activity.activity_id, status = code, "Activity rejected, dropping");
                }
                Err(failure) => {
                    report.status_code = failure.status_code();
                    warn!(inbox = %inbox, error = %failure, "Delivery failed");
                    report.failure = Some(failure);
                    break;
                }
            }
        }

        report.success = report.failure.is_none();
        if report.delivered + report.dropped > 0 {
            info!(
                inbox = %inbox,
                delivered = report.delivered,
                dropped = report.dropped,
                success = report.success,
                "Delivery run finished"
            );
        }
        Ok(report)
    }
}

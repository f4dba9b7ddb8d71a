use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use super::AlertEvent;
use super::rules::ChannelKind;
use crate::config::AlertConfig;
use crate::error::DeliveryError;

/// A delivery target for alert events.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn send(&self, event: &AlertEvent) -> Result<(), DeliveryError>;
}

/// Outcome of delivering one event to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub event_id: String,
    pub channel: ChannelKind,
    pub success: bool,
    pub error_detail: Option<String>,
    pub attempts: u32,
}

/// Fans alert events out to channels. Each channel is independent and bounded by a timeout.
#[derive(Clone)]
pub struct Dispatcher {
    channels: Arc<HashMap<ChannelKind, Arc<dyn Channel>>>,
    timeout: Duration,
    retry_count: u32,
}

impl Dispatcher {
    pub fn new(channels: Vec<Arc<dyn Channel>>, timeout: Duration, retry_count: u32) -> Self {
        Self {
            channels: Arc::new(channels.into_iter().map(|c| (c.kind(), c)).collect()),
            timeout,
            retry_count,
        }
    }

    pub fn from_config(channels: Vec<Arc<dyn Channel>>, config: &AlertConfig) -> Self {
        Self::new(
            channels,
            Duration::from_millis(config.dispatch_timeout_ms),
            config.retry_count,
        )
    }

    /// Channels that can actually deliver, in a stable order.
    pub fn registered(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<_> = self.channels.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Deliver to a single channel with timeout and retries.
    pub async fn send(&self, event: &AlertEvent, kind: ChannelKind) -> DeliveryResult {
        deliver(
            self.channels.get(&kind).cloned(),
            kind,
            event,
            self.timeout,
            self.retry_count,
        )
        .await
    }

    /// Fire-and-forget: deliveries run on their own tasks and results are sent
    /// as they complete. Never blocks the caller.
    pub fn spawn(
        &self,
        event: AlertEvent,
        results: mpsc::UnboundedSender<DeliveryResult>,
    ) -> JoinHandle<()> {
        let mut set = self.fan_out(Arc::new(event));
        tokio::spawn(async move {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(result) => {
                        if results.send(result).is_err() {
                            tracing::debug!("Delivery result receiver dropped");
                        }
                    }
                    Err(e) => tracing::error!("Delivery task failed: {e}"),
                }
            }
        })
    }

    fn fan_out(&self, event: Arc<AlertEvent>) -> JoinSet<DeliveryResult> {
        let mut set = JoinSet::new();
        for &kind in &event.channels {
            let dispatcher = self.clone();
            let event = Arc::clone(&event);
            set.spawn(async move { dispatcher.send(&event, kind).await });
        }
        set
    }
}

async fn deliver(
    channel: Option<Arc<dyn Channel>>,
    kind: ChannelKind,
    event: &AlertEvent,
    timeout: Duration,
    retries: u32,
) -> DeliveryResult {
    let Some(channel) = channel else {
        tracing::warn!(channel = kind.as_str(), event = %event.id, "Alert channel not configured");
        return failed(event, kind, DeliveryError::NotConfigured, 0);
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome = match tokio::time::timeout(timeout, channel.send(event)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeliveryError::Timeout(timeout.as_millis() as u64)),
        };
        match outcome {
            Ok(()) => {
                tracing::debug!(channel = kind.as_str(), event = %event.id, attempts, "Alert delivered");
                return DeliveryResult {
                    event_id: event.id.clone(),
                    channel: kind,
                    success: true,
                    error_detail: None,
                    attempts,
                };
            }
            Err(e) if attempts <= retries && retryable(&e) => {
                tracing::debug!(channel = kind.as_str(), event = %event.id, attempts, "Retrying delivery: {e}");
            }
            Err(e) => {
                tracing::warn!(channel = kind.as_str(), event = %event.id, attempts, "Alert delivery failed: {e}");
                return failed(event, kind, e, attempts);
            }
        }
    }
}

fn retryable(err: &DeliveryError) -> bool {
    !matches!(
        err,
        DeliveryError::NotConfigured | DeliveryError::Auth(_) | DeliveryError::Partial { .. }
    )
}

fn failed(event: &AlertEvent, kind: ChannelKind, err: DeliveryError, attempts: u32) -> DeliveryResult {
    DeliveryResult {
        event_id: event.id.clone(),
        channel: kind,
        success: false,
        error_detail: Some(err.to_string()),
        attempts,
    }
}

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::broker::DurableLog;
use crate::downstream::DownstreamApi;
use crate::error::{IngressError, IngressOutcome};
use crate::routing::extract_sender;
use crate::telemetry::metric_inc;
use crate::types::Event;

/// Decides, per inbound event, between direct delivery and durable queuing.
///
/// Exactly one downstream attempt is made. If it fails the raw bytes are
/// appended to the log under the sender's routing key. Retrying is left
/// to the drain. The router holds no state of its own and is shared by
/// all concurrent requests.
pub struct IngressRouter {
    downstream: Arc<dyn DownstreamApi>,
    log: Arc<dyn DurableLog>,
    timeout: Duration,
}

impl IngressRouter {
    pub fn new(downstream: Arc<dyn DownstreamApi>, log: Arc<dyn DurableLog>, timeout: Duration) -> Self {
        Self {
            downstream,
            log,
            timeout,
        }
    }

    /// Handle one raw webhook body.
    pub async fn handle(&self, raw: &[u8]) -> Result<IngressOutcome, IngressError> {
        let sender = extract_sender(raw);
        info!(
            key = %sender.key,
            name = sender.name.as_deref().unwrap_or("unknown"),
            bytes = raw.len(),
            "incoming webhook"
        );
        self.route(&Event::new(sender.key, raw)).await
    }

    /// Deliver or enqueue an event whose routing key is already known.
    pub async fn route(&self, event: &Event) -> Result<IngressOutcome, IngressError> {
        let delivery = match self.downstream.deliver(&event.payload, self.timeout).await {
            Ok(()) => {
                metric_inc("relay.ingress.delivered");
                info!(key = %event.routing_key, "delivered directly");
                return Ok(IngressOutcome::Delivered);
            }
            Err(failure) => failure,
        };

        warn!(key = %event.routing_key, failure = %delivery, "direct delivery failed, queuing");

        match self.log.append(&event.routing_key, &event.payload).await {
            Ok(position) => {
                metric_inc("relay.ingress.queued");
                info!(
                    key = %event.routing_key,
                    partition = %position.partition,
                    offset = %position.offset,
                    "event queued"
                );
                Ok(IngressOutcome::Queued(position))
            }
            Err(source) => {
                metric_inc("relay.ingress.enqueue_failed");
                error!(key = %event.routing_key, error = %source, "enqueue failed, event not accepted");
                Err(IngressError::EnqueueFailed {
                    key: event.routing_key.clone(),
                    delivery,
                    source,
                })
            }
        }
    }
}

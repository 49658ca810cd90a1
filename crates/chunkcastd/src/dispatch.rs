//! Routes inbound messages to the services whose filters match the topic,
//! and publishes whatever they reply.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use chunkcast_core::wire::topic_matches;
use chunkcast_core::QoS;
use chunkcast_services::{InboundMessage, OutboundMessage, TopicService, Transport};

/// Filter list per registered service, in registration order.
pub struct ServiceDispatcher {
    services: Vec<(Vec<String>, Arc<dyn TopicService>)>,
}

impl ServiceDispatcher {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
        }
    }

    pub fn register(&mut self, service: Arc<dyn TopicService>) {
        let filters = service.subscriptions();
        tracing::info!(service = service.name(), ?filters, "service registered");
        self.services.push((filters, service));
    }

    /// Every filter to subscribe, deduplicated.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .services
            .iter()
            .flat_map(|(filters, _)| filters.iter().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|(_, s)| s.name()).collect()
    }

    /// Hand `msg` to every matching service and collect their replies.
    /// Returns `None` if no service matched.
    pub fn dispatch(&self, msg: &InboundMessage) -> Option<Vec<OutboundMessage>> {
        let mut matched = false;
        let mut replies = Vec::new();
        for (filters, service) in &self.services {
            if !filters.iter().any(|f| topic_matches(f, &msg.topic)) {
                continue;
            }
            matched = true;
            match service.handle_message(msg) {
                Ok(mut out) => replies.append(&mut out),
                Err(e) => tracing::warn!(
                    service = service.name(),
                    topic = %msg.topic,
                    error = %e,
                    "service message handling failed"
                ),
            }
        }
        matched.then_some(replies)
    }
}

/// Subscribe every service filter on `transport`.
pub async fn subscribe_all<T: Transport>(
    transport: &T,
    dispatcher: &ServiceDispatcher,
) -> anyhow::Result<()> {
    for filter in dispatcher.subscriptions() {
        transport.subscribe(&filter, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

/// Drain inbound messages through the dispatcher until shutdown or until the
/// transport closes the inbound channel.
pub async fn route_loop<T: Transport>(
    transport: Arc<T>,
    dispatcher: Arc<ServiceDispatcher>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("router shutting down");
                return Ok(());
            }

            msg = inbound.recv() => {
                let Some(msg) = msg else {
                    tracing::warn!("inbound channel closed");
                    return Ok(());
                };
                let Some(replies) = dispatcher.dispatch(&msg) else {
                    tracing::debug!(topic = %msg.topic, "no service for topic");
                    continue;
                };
                for reply in replies {
                    if let Err(e) = transport.publish(&reply.topic, reply.payload, reply.qos).await {
                        tracing::warn!(topic = %reply.topic, error = %e, "reply publish failed");
                    }
                }
            }
        }
    }
}

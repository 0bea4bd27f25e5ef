use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FleetError, FleetResult, TransportError};
use crate::messages::{Command, CANCEL_TOPIC, REPLY_FILTER};
use crate::router::ResponseRouter;
use crate::types::DeviceId;

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

pub async fn send_command(
    transport: &dyn Transport,
    device: &DeviceId,
    command: &Command,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(command)?;
    transport.publish(&command.topic_for(device), payload).await
}

pub async fn broadcast_command(
    transport: &dyn Transport,
    command: &Command,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(command)?;
    transport.publish(&command.broadcast_topic(), payload).await
}

/// Ask every device to drop whatever it is working on.
pub async fn broadcast_cancel(transport: &dyn Transport) {
    match transport.publish(CANCEL_TOPIC, Vec::new()).await {
        Ok(()) => info!("cancel broadcast sent"),
        Err(e) => warn!(error = %e, "failed to broadcast cancel"),
    }
}

pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Create the client and its event loop. The event loop must be driven by
    /// [`run_event_loop`] for publishes to leave the process.
    pub fn connect(broker_url: &str, client_id: &str) -> FleetResult<(Self, EventLoop)> {
        let (host, port) = parse_broker_url(broker_url)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 256);
        Ok((Self { client }, eventloop))
    }

    pub async fn subscribe_replies(&self) -> Result<(), TransportError> {
        self.client
            .subscribe(REPLY_FILTER, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

/// Drive the MQTT connection and hand every inbound publish to the router.
///
/// rumqttc reconnects on the next poll after an error, so errors only pause
/// the loop for `retry_delay`.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    router: Arc<ResponseRouter>,
    retry_delay: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("MQTT event loop shutting down");
                break;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        router.handle_message(&publish.topic, &publish.payload).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("reply subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "MQTT event loop error");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(retry_delay) => {}
                        }
                    }
                }
            }
        }
    }
}

fn parse_broker_url(url: &str) -> FleetResult<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match parts.len() {
        1 => Ok((parts[0], 1883)),
        2 => {
            let port = parts[1].parse::<u16>().map_err(|_| {
                FleetError::Config(format!("invalid port in broker URL: {}", parts[1]))
            })?;
            Ok((parts[0], port))
        }
        _ => Err(FleetError::Config(format!(
            "invalid broker URL format: {}",
            url
        ))),
    }
}

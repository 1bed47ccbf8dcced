use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{config::MqttConfig, log_error, log_info, log_warn, stage::StageSnapshot};

use super::MessageRouter;

const ENABLE_LOGS: bool = true;
const REQUEST_CAPACITY: usize = 32;

struct Inbound {
    topic: String,
    payload: Vec<u8>,
}

/// MQTT client plus the two tasks behind it: the event loop, which keeps the
/// connection alive and resubscribes on every connect, and the handler, which
/// feeds messages to the router one at a time in arrival order.
pub struct Ingestion {
    client: AsyncClient,
    qos: QoS,
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Ingestion {
    pub fn start(config: &MqttConfig, router: Arc<MessageRouter>) -> Result<Self> {
        let qos = qos_from_level(config.qos)?;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("uroguardian-{}", &Uuid::new_v4().simple().to_string()[..8]));

        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(5)));

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let topics: Vec<String> = router.topics().map(str::to_string).collect();
        let cancel_token = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let event_task = tokio::spawn(event_loop_task(
            event_loop,
            client.clone(),
            topics,
            qos,
            Duration::from_millis(config.reconnect_delay_ms),
            inbound_tx,
            cancel_token.clone(),
        ));
        let handler_task = tokio::spawn(handler_task(router, inbound_rx, cancel_token.clone()));

        log_info!(
            "MQTT client {client_id} connecting to {}:{}",
            config.host,
            config.port
        );

        Ok(Self {
            client,
            qos,
            cancel_token,
            handles: vec![event_task, handler_task],
        })
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .with_context(|| format!("failed to publish to {topic}"))
    }

    /// Republishes every stage change, retained, on `topic` until disconnect.
    pub fn publish_stages(&mut self, updates: broadcast::Receiver<StageSnapshot>, topic: String) {
        let client = self.client.clone();
        let qos = self.qos;
        log_info!("Publishing stage changes on {topic}");

        let publish = move |payload: Vec<u8>| {
            client
                .try_publish(topic.as_str(), qos, true, payload)
                .map_err(anyhow::Error::from)
        };
        self.handles.push(tokio::spawn(forward_stages(
            updates,
            publish,
            self.cancel_token.clone(),
        )));
    }

    /// Disconnects and waits for every task. Messages already queued are
    /// dropped.
    pub async fn disconnect(self) {
        if let Err(err) = self.client.disconnect().await {
            log_warn!("MQTT disconnect failed: {err}");
        }
        self.cancel_token.cancel();

        for handle in self.handles {
            if let Err(err) = handle.await {
                log_error!("MQTT task failed to join: {err}");
            }
        }
        log_info!("MQTT client stopped");
    }
}

fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(anyhow!("invalid MQTT QoS level {other}")),
    }
}

async fn event_loop_task(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topics: Vec<String>,
    qos: QoS,
    reconnect_delay: Duration,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = event_loop.poll() => event,
            _ = cancel_token.cancelled() => break,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log_info!("MQTT connected; subscribing to {} topics", topics.len());
                for topic in &topics {
                    // The request queue is drained by this loop, so never await here.
                    if let Err(err) = client.try_subscribe(topic.as_str(), qos) {
                        log_error!("Failed to subscribe to {topic}: {err}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Inbound {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                log_warn!(
                    "MQTT connection error: {err}; retrying in {}ms",
                    reconnect_delay.as_millis()
                );
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay) => {}
                    _ = cancel_token.cancelled() => break,
                }
            }
        }
    }
}

async fn handler_task(
    router: Arc<MessageRouter>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    cancel_token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = inbound.recv() => message,
            _ = cancel_token.cancelled() => break,
        };

        let Some(message) = message else {
            break;
        };
        router.handle_message(&message.topic, &message.payload).await;
    }
}

/// Never waits on the client's request queue; a full queue drops the update
/// and the next change carries the whole snapshot anyway.
async fn forward_stages<P>(
    mut updates: broadcast::Receiver<StageSnapshot>,
    mut publish: P,
    cancel_token: CancellationToken,
) where
    P: FnMut(Vec<u8>) -> Result<()>,
{
    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = cancel_token.cancelled() => break,
        };

        match update {
            Ok(snapshot) => match serde_json::to_vec(&snapshot) {
                Ok(payload) => {
                    if let Err(err) = publish(payload) {
                        log_warn!("Failed to publish stage {}: {err:#}", snapshot.stage);
                    }
                }
                Err(err) => log_error!("Failed to encode stage {}: {err}", snapshot.stage),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log_warn!("Stage publisher fell behind; skipped {skipped} updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::MqttConfig;
use super::message_manager::{MQTTMessage, TransportEvent};
use super::{DeliveryHint, PublishError, Transport, TransportError};

/// Number of recent transport errors kept for the health surface.
const MAX_ERROR_HISTORY: usize = 10;
/// How long shutdown waits for the DISCONNECT packet to be written.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub error_messages: VecDeque<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

impl MQTTStatus {
    fn push_error(&mut self, message: String) {
        if self.error_messages.len() >= MAX_ERROR_HISTORY {
            self.error_messages.pop_front();
        }
        self.error_messages.push_back(message);
    }
}

/// Owns the broker connection and drives the `rumqttc` event loop.
///
/// Created together with an [`MqttHandle`]; the handler is moved into its own task
/// with [`MqttHandler::run`] while the handle is shared with the command router and
/// the health surface.
pub struct MqttHandler {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
    subscriptions: Vec<String>,
    events: mpsc::Sender<TransportEvent>,
    status: Arc<watch::Sender<MQTTStatus>>,
}

impl MqttHandler {
    /// Builds the client without touching the network; the first connect happens on
    /// the first poll inside [`MqttHandler::run`].
    pub fn new(
        config: MqttConfig,
        subscriptions: Vec<String>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(Self, MqttHandle), TransportError> {
        let (host, port) = config.endpoint()?;
        let client_id = config.client_id();
        info!(client_id = %client_id, host = %host, port, "Creating MQTT client");

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)))
            .set_clean_session(true);
        if config.server.has_credentials() {
            mqtt_options.set_credentials(config.server.user.clone(), config.server.pw.clone());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, config.request_capacity.max(1));
        let (status_tx, _) = watch::channel(MQTTStatus::default());
        let status = Arc::new(status_tx);

        let handle = MqttHandle {
            client: client.clone(),
            status: status.clone(),
        };

        Ok((
            MqttHandler {
                client,
                eventloop,
                config,
                subscriptions,
                events,
                status,
            },
            handle,
        ))
    }

    /// Polls the broker until cancelled or until the event consumer goes away.
    ///
    /// Connection errors never end the loop: the state moves to `Reconnecting`, the
    /// loop sleeps according to the backoff policy and the next poll reconnects.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            broker = %self.config.server,
            subscriptions = ?self.subscriptions,
            "Starting MQTT transport"
        );
        self.set_state(ConnectionState::Connecting);

        let mut attempt: u32 = 0;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    attempt = 0;
                    info!(code = ?ack.code, "Connected to MQTT broker");
                    self.resubscribe();
                    self.set_state(ConnectionState::Connected);
                    if !emit(&self.events, TransportEvent::Connected).await {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(
                        topic = %publish.topic,
                        length = publish.payload.len(),
                        "MQTT message received"
                    );
                    self.status.send_modify(|status| {
                        status.messages_received += 1;
                        status.last_activity = Some(Utc::now());
                    });
                    let message = MQTTMessage::from_topic(publish.topic, publish.payload.to_vec());
                    if !emit(&self.events, TransportEvent::Message(message)).await {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(pkid = ack.pkid, return_codes = ?ack.return_codes, "Subscription acknowledged");
                }
                Ok(other) => trace!(event = ?other, "MQTT event"),
                Err(e) => {
                    let was_connected = self.status.borrow().connection_state == ConnectionState::Connected;
                    let cause = e.to_string();
                    self.status.send_modify(|status| {
                        status.connection_state = ConnectionState::Reconnecting;
                        status.push_error(cause.clone());
                    });

                    if was_connected {
                        warn!(error = %cause, "MQTT connection lost");
                        if !emit(&self.events, TransportEvent::Disconnected).await {
                            break;
                        }
                    } else {
                        error!(error = %cause, "MQTT connection error");
                    }
                    if !emit(&self.events, TransportEvent::Error(cause)).await {
                        break;
                    }

                    let delay = self.config.reconnect.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let connected = self.status.borrow().connection_state == ConnectionState::Connected;
        if connected {
            self.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT transport stopped");
    }

    /// Queues a DISCONNECT and keeps the event loop turning until it is on the wire.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request not queued");
            return;
        }
        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "MQTT connection ended during disconnect");
                        return false;
                    }
                }
            }
        })
        .await;
        match flushed {
            Ok(true) => info!("Disconnected from MQTT broker"),
            Ok(false) => {}
            Err(_) => warn!("Timed out sending MQTT disconnect"),
        }
    }

    fn resubscribe(&self) {
        for pattern in &self.subscriptions {
            match self.client.try_subscribe(pattern.as_str(), QoS::AtMostOnce) {
                Ok(()) => info!(topic = %pattern, "Subscribed to MQTT topic"),
                Err(e) => error!(topic = %pattern, error = %e, "MQTT subscribe error"),
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.connection_state = state);
    }
}

/// Returns false once nobody listens any more.
async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    if events.send(event).await.is_err() {
        warn!("Transport event channel closed, stopping MQTT transport");
        return false;
    }
    true
}

/// Cloneable publish/status handle onto a running [`MqttHandler`].
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    status: Arc<watch::Sender<MQTTStatus>>,
}

impl Transport for MqttHandle {
    fn connection_state(&self) -> ConnectionState {
        self.status.borrow().connection_state
    }

    fn status(&self) -> MQTTStatus {
        self.status.borrow().clone()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        hint: DeliveryHint,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client.publish(topic, hint.into(), false, payload).await?;
        self.status.send_modify(|status| {
            status.messages_sent += 1;
            status.last_activity = Some(Utc::now());
        });
        debug!(topic = %topic, "Published MQTT message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{BackoffPolicy, MqttServer};
    use std::collections::BTreeSet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 1;
    const SUBSCRIBE: u8 = 8;
    const DISCONNECT: u8 = 14;
    const WAIT: Duration = Duration::from_secs(5);

    fn local_config(port: u16) -> MqttConfig {
        MqttConfig {
            server: MqttServer {
                url: format!("mqtt://127.0.0.1:{port}"),
                ..MqttServer::default()
            },
            reconnect: BackoffPolicy {
                base_ms: 10,
                max_ms: 20,
            },
            ..MqttConfig::default()
        }
    }

    /// Reads one MQTT control packet as (packet type, body).
    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.ok()?;
        Some((header >> 4, body))
    }

    /// Accepts a client, reads its CONNECT and answers with a CONNACK.
    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (kind, _) = read_packet(&mut stream).await.expect("connect packet");
        assert_eq!(kind, CONNECT);
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        stream
    }

    fn subscribe_topic(body: &[u8]) -> (u16, String) {
        let pkid = u16::from_be_bytes([body[0], body[1]]);
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let topic = String::from_utf8(body[4..4 + len].to_vec()).unwrap();
        (pkid, topic)
    }

    /// Acknowledges SUBSCRIBE packets until `count` distinct topics were seen.
    async fn ack_subscriptions(stream: &mut TcpStream, count: usize) -> BTreeSet<String> {
        let mut topics = BTreeSet::new();
        while topics.len() < count {
            let (kind, body) = read_packet(stream).await.expect("client hung up");
            if kind != SUBSCRIBE {
                continue;
            }
            let (pkid, topic) = subscribe_topic(&body);
            let [hi, lo] = pkid.to_be_bytes();
            stream.write_all(&[0x90, 0x03, hi, lo, 0x00]).await.unwrap();
            topics.insert(topic);
        }
        topics
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("transport produced no event")
            .expect("event channel closed")
    }

    fn assert_send<T: Send>(_: &T) {}

    fn unreachable_config() -> MqttConfig {
        MqttConfig {
            server: MqttServer {
                url: "mqtt://127.0.0.1:1".to_string(),
                ..MqttServer::default()
            },
            reconnect: BackoffPolicy {
                base_ms: 10,
                max_ms: 20,
            },
            ..MqttConfig::default()
        }
    }

    #[test]
    fn new_rejects_tls_endpoint() {
        let (tx, _rx) = mpsc::channel(1);
        let config = MqttConfig {
            server: MqttServer {
                url: "mqtts://broker:8883".to_string(),
                ..MqttServer::default()
            },
            ..MqttConfig::default()
        };
        assert!(MqttHandler::new(config, Vec::new(), tx).is_err());
    }

    #[test]
    fn status_error_history_is_bounded() {
        let mut status = MQTTStatus::default();
        for i in 0..25 {
            status.push_error(format!("error {i}"));
        }
        assert_eq!(status.error_messages.len(), MAX_ERROR_HISTORY);
        assert_eq!(status.error_messages[0], "error 15");
    }

    #[tokio::test]
    async fn publish_is_refused_before_connect() {
        let (tx, _rx) = mpsc::channel(1);
        let (_handler, handle) = MqttHandler::new(unreachable_config(), Vec::new(), tx).unwrap();

        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
        let result = handle
            .publish("iot/control/fan", b"on".to_vec(), DeliveryHint::AtMostOnce)
            .await;
        assert!(matches!(result, Err(PublishError::NotConnected)));
        assert_eq!(handle.status().messages_sent, 0);
    }

    #[tokio::test]
    async fn connect_failure_reports_error_and_keeps_retrying() {
        let (tx, mut rx) = mpsc::channel(16);
        let (handler, handle) =
            MqttHandler::new(unreachable_config(), vec!["iot/#".to_string()], tx).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run(cancel.clone()));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("transport produced no event");
        // Never connected, so no Disconnected precedes the error.
        assert!(matches!(first, Some(TransportEvent::Error(_))));
        assert_eq!(handle.connection_state(), ConnectionState::Reconnecting);

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("transport stopped retrying");
        assert!(matches!(second, Some(TransportEvent::Error(_))));
        assert!(!handle.status().error_messages.is_empty());

        drop(rx);
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn run_future_can_be_spawned() {
        let (tx, _rx) = mpsc::channel(1);
        let (handler, _handle) = MqttHandler::new(unreachable_config(), Vec::new(), tx).unwrap();
        let run = handler.run(CancellationToken::new());
        assert_send(&run);
    }

    #[tokio::test]
    async fn shutdown_sends_disconnect_to_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            ack_subscriptions(&mut stream, 2).await;
            while let Some((kind, _)) = read_packet(&mut stream).await {
                if kind == DISCONNECT {
                    return true;
                }
            }
            false
        });

        let (tx, mut rx) = mpsc::channel(16);
        let subscriptions = vec!["iot/a".to_string(), "iot/b".to_string()];
        let (handler, handle) = MqttHandler::new(local_config(port), subscriptions, tx).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run(cancel.clone()));

        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        assert_eq!(handle.connection_state(), ConnectionState::Connected);

        cancel.cancel();
        let saw_disconnect = tokio::time::timeout(WAIT, broker)
            .await
            .expect("broker never saw the client leave")
            .unwrap();
        assert!(saw_disconnect, "connection closed without DISCONNECT");

        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn resubscribes_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut first = accept_session(&listener).await;
            let before = ack_subscriptions(&mut first, 2).await;
            drop(first);

            let mut second = accept_session(&listener).await;
            let after = ack_subscriptions(&mut second, 2).await;
            (before, after, second)
        });

        let (tx, mut rx) = mpsc::channel(16);
        let subscriptions = vec!["iot/a".to_string(), "iot/b".to_string()];
        let (handler, handle) = MqttHandler::new(local_config(port), subscriptions, tx).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run(cancel.clone()));

        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);
        assert_eq!(next_event(&mut rx).await, TransportEvent::Disconnected);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error(_)));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Connected);

        let (before, after, _open) = tokio::time::timeout(WAIT, broker)
            .await
            .expect("broker saw no resubscribe")
            .unwrap();
        let expected: BTreeSet<String> = ["iot/a", "iot/b"].iter().map(|t| t.to_string()).collect();
        assert_eq!(before, expected);
        assert_eq!(after, expected);
        assert_eq!(handle.status().error_messages.len(), 1);

        drop(rx);
        cancel.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }
}

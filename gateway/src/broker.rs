//! Broker-facing MQTT client.
//!
//! One [`MqttBroker`] owns a single session. A background task drives the
//! `rumqttc` event loop: it reconnects forever with capped exponential
//! backoff, re-issues subscriptions when the broker did not keep the session,
//! queues inbound publishes to one worker per subscription, and reports
//! acknowledgements back to the caller blocked in [`Broker::publish`].

use crate::config::MqttConfig;
use crate::errors::{Error, Result};
use crate::metrics::BROKER_RECONNECTS_TOTAL;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use rumqttc::QoS;

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Callback for messages delivered on a subscribed topic filter.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage);
}

/// Publish/subscribe session as seen by the rest of the gateway.
#[async_trait]
pub trait Broker: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Registers `handler` for every message matching `filter`. Delivery is
    /// at-least-once; handlers must tolerate duplicates.
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Returns once the broker has acknowledged the message at `qos`.
    /// Fails immediately with [`Error::NotConnected`] when there is no session.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Exponential backoff capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Subscription {
    qos: QoS,
    queue: mpsc::UnboundedSender<InboundMessage>,
}

/// The one publish currently waiting on the broker.
enum AckWait {
    Queued {
        qos: QoS,
        done: oneshot::Sender<()>,
    },
    Sent {
        pkid: u16,
        qos: QoS,
        done: oneshot::Sender<()>,
    },
}

/// Ack bookkeeping. Publishes given up on by their caller can still be
/// written or replayed by the event loop later; their packet ids must not be
/// credited to whoever is waiting now.
#[derive(Default)]
struct AckState {
    current: Option<AckWait>,
    /// Packet ids of abandoned publishes that may still be acknowledged.
    abandoned: HashSet<u16>,
    /// Abandoned publishes that were queued but not yet written, in write order.
    unwritten: VecDeque<QoS>,
}

struct Shared {
    connected: AtomicBool,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    acks: Mutex<AckState>,
}

impl Shared {
    fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            subscriptions: RwLock::new(HashMap::new()),
            acks: Mutex::new(AckState::default()),
        }
    }

    async fn queue(&self, qos: QoS, done: oneshot::Sender<()>) {
        self.acks.lock().await.current = Some(AckWait::Queued { qos, done });
    }

    /// Called for every outbound PUBLISH the event loop writes.
    async fn mark_sent(&self, pkid: u16) {
        let mut acks = self.acks.lock().await;
        if acks.abandoned.contains(&pkid) {
            debug!(pkid, "replay of an abandoned publish");
            return;
        }
        if let Some(qos) = acks.unwritten.pop_front() {
            if qos != QoS::AtMostOnce {
                acks.abandoned.insert(pkid);
            }
            return;
        }

        match acks.current.take() {
            Some(AckWait::Queued { qos, done }) if qos == QoS::AtMostOnce => {
                let _ = done.send(());
            }
            Some(AckWait::Queued { qos, done }) => {
                acks.current = Some(AckWait::Sent { pkid, qos, done });
            }
            other => acks.current = other,
        }
    }

    async fn complete(&self, acked: u16, level: QoS) {
        let mut acks = self.acks.lock().await;
        if acks.abandoned.remove(&acked) {
            debug!(pkid = acked, "late ack for an abandoned publish");
            return;
        }

        let matches = matches!(
            acks.current.as_ref(),
            Some(AckWait::Sent { pkid, qos, .. }) if *pkid == acked && *qos == level
        );
        if matches {
            if let Some(AckWait::Sent { done, .. }) = acks.current.take() {
                let _ = done.send(());
            }
        }
    }

    /// Gives up on the current publish after a timeout.
    async fn abandon(&self) {
        let mut acks = self.acks.lock().await;
        match acks.current.take() {
            Some(AckWait::Sent { pkid, .. }) => {
                acks.abandoned.insert(pkid);
            }
            Some(AckWait::Queued { qos, .. }) => acks.unwritten.push_back(qos),
            None => {}
        }
    }

    /// Drops the current publish without tracking it; used when it never
    /// reached the request queue.
    async fn clear_current(&self) {
        self.acks.lock().await.current.take();
    }

    /// Registers `handler` behind a queue drained by one worker task, so
    /// messages for a filter are handled in arrival order. Replacing a filter
    /// lets the old worker finish what it already received.
    async fn add_subscription(&self, filter: &str, qos: QoS, handler: Arc<dyn MessageHandler>) {
        let (queue, mut inbox) = mpsc::unbounded_channel::<InboundMessage>();
        let worker_filter = filter.to_string();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                handler.handle(message).await;
            }
            debug!(topic = %worker_filter, "subscription worker stopped");
        });

        self.subscriptions
            .write()
            .await
            .insert(filter.to_string(), Subscription { qos, queue });
    }

    async fn dispatch(&self, message: InboundMessage) {
        let subscriptions = self.subscriptions.read().await;
        let mut delivered = false;
        for (filter, subscription) in subscriptions.iter() {
            if !topic_matches(filter, &message.topic) {
                continue;
            }
            delivered = true;
            if subscription.queue.send(message.clone()).is_err() {
                warn!(topic = %filter, "subscription worker is gone; message dropped");
            }
        }

        if !delivered {
            debug!(topic = %message.topic, "no handler for inbound message");
        }
    }

    /// Marks the session up. Returns the filters to subscribe again when the
    /// broker did not keep the session.
    async fn on_connack(&self, session_present: bool) -> Vec<(String, QoS)> {
        self.connected.store(true, Ordering::SeqCst);
        if session_present {
            return Vec::new();
        }
        self.subscriptions
            .read()
            .await
            .iter()
            .map(|(filter, subscription)| (filter.clone(), subscription.qos))
            .collect()
    }

    /// Marks the session down. Returns true only for the first error after a
    /// live session, which is what counts as a reconnect.
    fn on_connection_lost(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            BROKER_RECONNECTS_TOTAL.inc();
        }
        was_connected
    }

    async fn shut_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.acks.lock().await.current.take();
        // dropping the senders ends the workers once their queues drain
        self.subscriptions.write().await.clear();
    }
}

pub struct MqttBroker {
    client: AsyncClient,
    shared: Arc<Shared>,
    publish_lock: Mutex<()>,
    publish_timeout: Duration,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// Opens the session, retrying a bounded number of times with a fixed
    /// delay. Once connected, later losses are retried forever in the background.
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        info!("Connecting to MQTT broker at {}:{}", config.host, config.port);

        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(false);
        if let Some(username) = &config.username {
            mqtt_options.set_credentials(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let attempts = config.connect_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match wait_for_connack(&mut eventloop).await {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    warn!(
                        "MQTT connection attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, attempts, e, config.connect_retry_delay
                    );
                    tokio::time::sleep(config.connect_retry_delay).await;
                }
                Err(e) => {
                    return Err(Error::Startup(format!(
                        "MQTT broker unreachable after {} attempts: {}",
                        attempts, e
                    )));
                }
            }
        }
        info!("MQTT connected");

        let shared = Arc::new(Shared::new(true));
        let shutdown = CancellationToken::new();
        let backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            shared.clone(),
            backoff,
            shutdown.clone(),
        ));

        Ok(Self {
            client,
            shared,
            publish_lock: Mutex::new(()),
            publish_timeout: config.publish_timeout,
            shutdown,
            driver: Mutex::new(Some(driver)),
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                backoff.reset();
                info!(session_present = ack.session_present, "MQTT reconnected");
                for (filter, qos) in shared.on_connack(ack.session_present).await {
                    // try_ variant: this task is the one that drains the request queue
                    match client.try_subscribe(filter.as_str(), qos) {
                        Ok(()) => info!(topic = %filter, "re-subscribed after reconnect"),
                        Err(e) => error!(topic = %filter, error = %e, "failed to re-subscribe"),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                shared
                    .dispatch(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    })
                    .await;
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                shared.complete(ack.pkid, QoS::AtLeastOnce).await;
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                shared.complete(comp.pkid, QoS::ExactlyOnce).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!("Broker closed the session");
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.mark_sent(pkid).await;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Sent DISCONNECT to broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.on_connection_lost();
                let delay = backoff.next_delay();
                warn!(error = %e, "MQTT connection lost; reconnecting in {:?}", delay);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.shut_down().await;
    info!("MQTT event loop stopped");
}

#[async_trait]
impl Broker for MqttBroker {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.shared.add_subscription(filter, qos, handler).await;

        self.client.subscribe(filter, qos).await?;
        info!("Subscribed to {} with {:?}", filter, qos);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        // pkids are only learned from the event loop, so one publish waits at a time
        let _guard = self.publish_lock.lock().await;
        let (done, acked) = oneshot::channel();
        self.shared.queue(qos, done).await;

        if let Err(e) = self.client.publish(topic, qos, false, payload).await {
            self.shared.clear_current().await;
            return Err(e.into());
        }

        match tokio::time::timeout(self.publish_timeout, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.shared.abandon().await;
                warn!(%topic, "publish not acknowledged in time");
                Err(Error::PublishTimeout(self.publish_timeout))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        let sent = self.client.disconnect().await;

        if let Some(mut driver) = self.driver.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
                .await
                .is_err()
            {
                self.shutdown.cancel();
                let _ = driver.await;
            }
        }
        self.shutdown.cancel();

        sent?;
        info!("MQTT disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_topic() {
        assert!(topic_matches("armdetector/sensor/data", "armdetector/sensor/data"));
        assert!(!topic_matches("armdetector/sensor/data", "armdetector/sensor"));
        assert!(!topic_matches("armdetector/sensor", "armdetector/sensor/data"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let filter = "armdetector/device/+/response";
        assert!(topic_matches(filter, "armdetector/device/esp32-01/response"));
        assert!(!topic_matches(filter, "armdetector/device/esp32-01/command"));
        assert!(!topic_matches(filter, "armdetector/device/a/b/response"));
        assert!(topic_matches(filter, "armdetector/device//response"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("telemetry/#", "telemetry/dev-1"));
        assert!(topic_matches("telemetry/#", "telemetry/dev-1/extra"));
        assert!(topic_matches("telemetry/#", "telemetry"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    struct Recorder {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: InboundMessage) {
            let text = String::from_utf8_lossy(&message.payload).to_string();
            if text == "first" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.seen.lock().unwrap().push(text);
        }
    }

    fn message(topic: &str, payload: &'static str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    #[test]
    fn test_ack_requires_matching_packet_id() {
        tokio_test::block_on(async {
            let shared = Shared::new(true);
            let (done, mut acked) = oneshot::channel();
            shared.queue(QoS::AtLeastOnce, done).await;

            shared.mark_sent(7).await;
            shared.complete(8, QoS::AtLeastOnce).await;
            assert!(acked.try_recv().is_err());

            shared.complete(7, QoS::AtLeastOnce).await;
            assert!(acked.try_recv().is_ok());
        });
    }

    #[test]
    fn test_qos0_completes_on_write() {
        tokio_test::block_on(async {
            let shared = Shared::new(true);
            let (done, mut acked) = oneshot::channel();
            shared.queue(QoS::AtMostOnce, done).await;

            shared.mark_sent(0).await;
            assert!(acked.try_recv().is_ok());
        });
    }

    #[test]
    fn test_replayed_abandoned_publish_does_not_ack_the_next_one() {
        tokio_test::block_on(async {
            let shared = Shared::new(true);

            // A is written as pkid 3 and times out
            let (done_a, _acked_a) = oneshot::channel();
            shared.queue(QoS::AtLeastOnce, done_a).await;
            shared.mark_sent(3).await;
            shared.abandon().await;

            // B is queued; the reconnect replays A before B is written
            let (done_b, mut acked_b) = oneshot::channel();
            shared.queue(QoS::AtLeastOnce, done_b).await;
            shared.mark_sent(3).await;
            shared.complete(3, QoS::AtLeastOnce).await;
            assert!(acked_b.try_recv().is_err());

            shared.mark_sent(4).await;
            shared.complete(4, QoS::AtLeastOnce).await;
            assert!(acked_b.try_recv().is_ok());
        });
    }

    #[test]
    fn test_abandoned_unwritten_publish_is_skipped_when_written() {
        tokio_test::block_on(async {
            let shared = Shared::new(true);

            // A times out before the event loop even writes it
            let (done_a, _acked_a) = oneshot::channel();
            shared.queue(QoS::AtLeastOnce, done_a).await;
            shared.abandon().await;

            let (done_b, mut acked_b) = oneshot::channel();
            shared.queue(QoS::AtLeastOnce, done_b).await;
            shared.mark_sent(5).await; // A
            shared.mark_sent(6).await; // B
            shared.complete(5, QoS::AtLeastOnce).await;
            assert!(acked_b.try_recv().is_err());

            shared.complete(6, QoS::AtLeastOnce).await;
            assert!(acked_b.try_recv().is_ok());
            assert!(shared.acks.lock().await.abandoned.is_empty());
        });
    }

    #[test]
    fn test_messages_on_one_subscription_keep_arrival_order() {
        tokio_test::block_on(async {
            let shared = Shared::new(true);
            let recorder = Arc::new(Recorder {
                seen: std::sync::Mutex::new(Vec::new()),
            });
            shared
                .add_subscription("t", QoS::AtLeastOnce, recorder.clone())
                .await;

            shared.dispatch(message("t", "first")).await;
            shared.dispatch(message("t", "second")).await;

            for _ in 0..100 {
                if recorder.seen.lock().unwrap().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(*recorder.seen.lock().unwrap(), vec!["first", "second"]);
        });
    }

    #[test]
    fn test_connack_restores_subscriptions_only_without_session() {
        tokio_test::block_on(async {
            let shared = Shared::new(false);
            let recorder = Arc::new(Recorder {
                seen: std::sync::Mutex::new(Vec::new()),
            });
            shared
                .add_subscription("armdetector/sensor/data", QoS::AtLeastOnce, recorder.clone())
                .await;
            shared
                .add_subscription("armdetector/device/+/response", QoS::ExactlyOnce, recorder)
                .await;

            assert!(shared.on_connack(true).await.is_empty());
            assert!(shared.connected.load(Ordering::SeqCst));

            let mut restored = shared.on_connack(false).await;
            restored.sort_by(|a, b| a.0.cmp(&b.0));
            assert_eq!(
                restored,
                vec![
                    ("armdetector/device/+/response".to_string(), QoS::ExactlyOnce),
                    ("armdetector/sensor/data".to_string(), QoS::AtLeastOnce),
                ]
            );
        });
    }

    #[test]
    fn test_connection_loss_counts_once_per_session() {
        let shared = Shared::new(true);
        let before = BROKER_RECONNECTS_TOTAL.get();

        assert!(shared.on_connection_lost());
        assert!(!shared.connected.load(Ordering::SeqCst));
        // further errors while still reconnecting are not new losses
        assert!(!shared.on_connection_lost());
        assert_eq!(BROKER_RECONNECTS_TOTAL.get() - before, 1.0);
    }
}

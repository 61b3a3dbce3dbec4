#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gateway::broker::{topic_matches, Broker, InboundMessage, MessageHandler, QoS};
use gateway::config::{Config, MqttConfig};
use gateway::errors::{Error, Result};
use gateway::memory::MemoryRepository;
use gateway::model::{
    CommandRecord, CommandStatus, NewCommand, NewTelemetry, ResolveOutcome, TelemetryRecord,
};
use gateway::query::{PageWindow, TelemetryFilter};
use gateway::store::{Repository, TelemetrySlice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub fn mqtt_config() -> MqttConfig {
    Config::from_lookup(|_| None).unwrap().mqtt
}

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Records every publish and lets tests push inbound messages to handlers.
#[derive(Default)]
pub struct MockBroker {
    connected: AtomicBool,
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<(String, Arc<dyn MessageHandler>)>>,
}

impl MockBroker {
    pub fn connected() -> Arc<Self> {
        let broker = Self::default();
        broker.connected.store(true, Ordering::SeqCst);
        Arc::new(broker)
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    /// Runs every matching handler to completion.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        let message = InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from(payload.into()),
        };
        for handler in handlers {
            handler.handle(message.clone()).await;
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), handler));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }
}

/// Memory store whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyRepository {
    pub inner: MemoryRepository,
    pub fail_writes: AtomicBool,
}

impl FlakyRepository {
    pub fn failing() -> Arc<Self> {
        let repo = Self::default();
        repo.fail_writes.store(true, Ordering::SeqCst);
        Arc::new(repo)
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn save_telemetry(&self, telemetry: NewTelemetry) -> Result<TelemetryRecord> {
        self.check()?;
        self.inner.save_telemetry(telemetry).await
    }

    async fn get_telemetry(&self, id: i64) -> Result<Option<TelemetryRecord>> {
        self.inner.get_telemetry(id).await
    }

    async fn query_telemetry(
        &self,
        filter: &TelemetryFilter,
        window: &PageWindow,
    ) -> Result<TelemetrySlice> {
        self.inner.query_telemetry(filter, window).await
    }

    async fn save_command(&self, command: NewCommand) -> Result<CommandRecord> {
        self.check()?;
        self.inner.save_command(command).await
    }

    async fn resolve_command(
        &self,
        correlation_id: &str,
        status: CommandStatus,
        response: &str,
    ) -> Result<ResolveOutcome> {
        self.check()?;
        self.inner
            .resolve_command(correlation_id, status, response)
            .await
    }

    async fn get_command(&self, correlation_id: &str) -> Result<Option<CommandRecord>> {
        self.inner.get_command(correlation_id).await
    }
}

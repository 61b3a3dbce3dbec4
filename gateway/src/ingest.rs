use crate::broker::{InboundMessage, MessageHandler};
use crate::errors::{Error, Result};
use crate::metrics::{
    DB_FAILURES_TOTAL, INGEST_LATENCY_SECONDS, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL,
    STORED_RECORDS_TOTAL,
};
use crate::model::{RawTelemetry, TelemetryRecord};
use crate::normalize::normalize;
use crate::store::Repository;
use crate::validate::validate;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Persists telemetry from the broker. Holds no state besides the store
/// handle, so concurrent deliveries never contend on anything in-process.
#[derive(Clone)]
pub struct TelemetryIngestor {
    repo: Arc<dyn Repository>,
}

impl TelemetryIngestor {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Decode, normalize and store a single message.
    pub async fn ingest(&self, payload: &[u8]) -> Result<TelemetryRecord> {
        let raw = serde_json::from_slice::<RawTelemetry>(payload)?;
        validate(&raw)?;

        let telemetry = normalize(raw, Utc::now());
        let record = self.repo.save_telemetry(telemetry).await?;
        Ok(record)
    }
}

#[async_trait]
impl MessageHandler for TelemetryIngestor {
    async fn handle(&self, message: InboundMessage) {
        MESSAGES_TOTAL.inc();
        let start = Instant::now();

        match self.ingest(&message.payload).await {
            Ok(record) => {
                STORED_RECORDS_TOTAL.inc();
                INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                debug!(
                    id = record.id,
                    device_id = %record.device_id,
                    temperature = record.temperature,
                    humidity = record.humidity,
                    "telemetry stored"
                );
            }
            Err(e @ (Error::Json(_) | Error::Validation(_))) => {
                INVALID_MESSAGES_TOTAL.inc();
                warn!(topic = %message.topic, error = %e, "dropping malformed telemetry");
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!(topic = %message.topic, error = %e, "failed to store telemetry; message dropped");
            }
        }
    }
}

use crate::broker::{Broker, InboundMessage, MessageHandler, QoS};
use crate::config::{command_topic, MqttConfig};
use crate::errors::{Error, Result};
use crate::metrics::{
    COMMAND_RESPONSES_TOTAL, COMMANDS_SENT_TOTAL, DB_FAILURES_TOTAL, INVALID_MESSAGES_TOTAL,
    ORPHANED_RESPONSES_TOTAL,
};
use crate::model::{
    CommandAck, CommandEnvelope, CommandName, CommandRecord, CommandRequest, CommandResponse,
    CommandStatus, NewCommand, ResolveOutcome,
};
use crate::store::Repository;
use crate::validate::validate_device_id;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const ACK_MESSAGE: &str = "Command sent successfully";

/// Turns a fire-and-forget publish into a request the caller can poll.
///
/// A command is published first and recorded as `pending` second; there is no
/// transaction spanning the two. Commands that never get a response stay
/// `pending`: nothing expires them.
pub struct CommandCorrelator {
    broker: Arc<dyn Broker>,
    repo: Arc<dyn Repository>,
    command_topic_template: String,
}

impl CommandCorrelator {
    pub fn new(config: &MqttConfig, broker: Arc<dyn Broker>, repo: Arc<dyn Repository>) -> Self {
        Self {
            broker,
            repo,
            command_topic_template: config.command_topic_template.clone(),
        }
    }

    pub async fn send_command(&self, device_id: &str, request: CommandRequest) -> Result<CommandAck> {
        let command: CommandName = request.command.parse()?;
        validate_device_id(device_id)?;

        if !self.broker.is_connected() {
            return Err(Error::NotConnected);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let sent_at = Utc::now();
        let envelope = CommandEnvelope {
            command,
            parameters: request.parameters,
            correlation_id: correlation_id.clone(),
            timestamp: sent_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let payload = serde_json::to_vec(&envelope)?;
        let topic = command_topic(&self.command_topic_template, device_id);

        self.broker.publish(&topic, payload, QoS::AtLeastOnce).await?;
        COMMANDS_SENT_TOTAL.inc();
        info!(%device_id, %command, request_id = %correlation_id, "command published");

        let pending = NewCommand {
            device_id: device_id.to_string(),
            command,
            correlation_id: correlation_id.clone(),
            sent_at,
        };
        if let Err(e) = self.repo.save_command(pending).await {
            DB_FAILURES_TOTAL.inc();
            error!(
                %device_id,
                request_id = %correlation_id,
                error = %e,
                "command was delivered but its pending record could not be stored"
            );
            return Err(e);
        }

        Ok(CommandAck {
            message: ACK_MESSAGE.to_string(),
            request_id: correlation_id,
        })
    }

    /// Applies a device response to the command it names.
    pub async fn on_response(&self, payload: &[u8]) -> Result<ResolveOutcome> {
        let response = serde_json::from_slice::<CommandResponse>(payload)?;
        if response.status == CommandStatus::Pending {
            return Err(Error::Validation(
                "response status must be success or error".to_string(),
            ));
        }

        let stored = serde_json::to_string(&response)?;
        self.repo
            .resolve_command(&response.correlation_id, response.status, &stored)
            .await
    }

    pub async fn get_status(&self, correlation_id: &str) -> Result<CommandRecord> {
        self.repo
            .get_command(correlation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("command {}", correlation_id)))
    }
}

#[async_trait]
impl MessageHandler for CommandCorrelator {
    async fn handle(&self, message: InboundMessage) {
        match self.on_response(&message.payload).await {
            Ok(ResolveOutcome::Resolved) => {
                COMMAND_RESPONSES_TOTAL.inc();
                debug!(topic = %message.topic, "command resolved");
            }
            Ok(ResolveOutcome::AlreadyResolved) => {
                debug!(topic = %message.topic, "duplicate response for an already resolved command");
            }
            Ok(ResolveOutcome::NotFound) => {
                ORPHANED_RESPONSES_TOTAL.inc();
                warn!(topic = %message.topic, "response matches no known command; dropping");
            }
            Err(e @ (Error::Json(_) | Error::Validation(_))) => {
                INVALID_MESSAGES_TOTAL.inc();
                warn!(topic = %message.topic, error = %e, "dropping malformed command response");
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!(topic = %message.topic, error = %e, "failed to update command status");
            }
        }
    }
}

use crate::errors::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Persisted sensor reading. Both timestamps are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetryRecord {
    pub id: i64,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub co_ppm: f64,
    pub dust_density: f64,
    pub alarm_status: String,
    pub received_at: DateTime<Utc>,
}

/// A normalized reading that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTelemetry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub co_ppm: f64,
    pub dust_density: f64,
    pub alarm_status: String,
    pub received_at: DateTime<Utc>,
}

impl NewTelemetry {
    pub fn into_record(self, id: i64) -> TelemetryRecord {
        TelemetryRecord {
            id,
            device_id: self.device_id,
            timestamp: self.timestamp,
            temperature: self.temperature,
            humidity: self.humidity,
            co_ppm: self.co_ppm,
            dust_density: self.dust_density,
            alarm_status: self.alarm_status,
            received_at: self.received_at,
        }
    }
}

/// Telemetry exactly as a device publishes it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTelemetry {
    #[serde(alias = "deviceID", alias = "deviceId")]
    pub device_id: String,
    #[serde(default)]
    pub timestamp: RawTimestamp,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub humidity: f64,
    #[serde(default, alias = "coPPM", alias = "coPpm")]
    pub co_ppm: f64,
    #[serde(default, alias = "dustDensity")]
    pub dust_density: f64,
    #[serde(default, alias = "alarmStatus")]
    pub alarm_status: String,
}

/// Devices disagree on how to encode time; this captures every shape seen on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Text(String),
    Number(f64),
    Other(Value),
}

impl Default for RawTimestamp {
    fn default() -> Self {
        RawTimestamp::Other(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    RenameDevice,
    TakePhoto,
    RestartDevice,
}

impl CommandName {
    pub const ALL: [CommandName; 3] = [
        CommandName::RenameDevice,
        CommandName::TakePhoto,
        CommandName::RestartDevice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::RenameDevice => "rename_device",
            CommandName::TakePhoto => "take_photo",
            CommandName::RestartDevice => "restart_device",
        }
    }
}

impl FromStr for CommandName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::UnknownCommand(s.to_string()))
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Success,
    Error,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Success => "success",
            CommandStatus::Error => "error",
        }
    }
}

impl FromStr for CommandStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "success" => Ok(CommandStatus::Success),
            "error" => Ok(CommandStatus::Error),
            other => Err(Error::Validation(format!("unknown command status '{}'", other))),
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command submission as received from an API caller. The name stays a plain
/// string so unsupported commands surface as a validation error.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Message published to a device's command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: CommandName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(rename = "request_id", alias = "correlation_id", alias = "correlationID")]
    pub correlation_id: String,
    pub timestamp: String,
}

/// Message a device publishes on its response topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(rename = "request_id", alias = "correlation_id", alias = "correlationID")]
    pub correlation_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub id: i64,
    pub device_id: String,
    pub command: CommandName,
    #[serde(rename = "request_id")]
    pub correlation_id: String,
    pub status: CommandStatus,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    pub device_id: String,
    pub command: CommandName,
    pub correlation_id: String,
    pub sent_at: DateTime<Utc>,
}

impl NewCommand {
    pub fn into_record(self, id: i64) -> CommandRecord {
        CommandRecord {
            id,
            device_id: self.device_id,
            command: self.command,
            correlation_id: self.correlation_id,
            status: CommandStatus::Pending,
            sent_at: self.sent_at,
            response: None,
        }
    }
}

/// What a response did to the pending record it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    AlreadyResolved,
    NotFound,
}

/// Returned to the caller once a command has been handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandAck {
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub current_page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u64,
}

/// REST API response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPage {
    pub data: Vec<TelemetryRecord>,
    pub pagination: Pagination,
}

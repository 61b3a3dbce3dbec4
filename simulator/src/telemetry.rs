use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reading as a sensor board publishes it. `timestamp` is left loosely typed
/// because real boards send RFC 3339 strings, epoch-ms strings and epoch-ms numbers.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub device_id: String,
    pub timestamp: Value,
    pub temperature: f64,
    pub humidity: f64,
    pub co_ppm: f64,
    pub dust_density: f64,
    pub alarm_status: String,
}

#[derive(Debug, Clone, Copy)]
pub enum TimestampEncoding {
    Rfc3339,
    MillisString,
    MillisNumber,
}

impl TimestampEncoding {
    pub fn for_sequence(n: u64) -> Self {
        match n % 3 {
            0 => TimestampEncoding::Rfc3339,
            1 => TimestampEncoding::MillisString,
            _ => TimestampEncoding::MillisNumber,
        }
    }

    pub fn now(self) -> Value {
        let now = Utc::now();
        match self {
            TimestampEncoding::Rfc3339 => {
                Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            TimestampEncoding::MillisString => Value::String(now.timestamp_millis().to_string()),
            TimestampEncoding::MillisNumber => Value::from(now.timestamp_millis()),
        }
    }
}

pub fn generate_telemetry(
    rng: &mut impl Rng,
    device_id: String,
    encoding: TimestampEncoding,
) -> Telemetry {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(40.0..70.0) // 5% overheating
    } else {
        rng.gen_range(15.0..35.0)
    };

    let co_ppm = if rng.gen_bool(0.02) {
        rng.gen_range(50.0..200.0) // 2% gas leak
    } else {
        rng.gen_range(0.0..10.0)
    };

    let dust_density = rng.gen_range(0.0..0.3);
    let alarm_status = if temperature > 50.0 || co_ppm > 50.0 {
        "alarm"
    } else {
        "normal"
    };

    Telemetry {
        device_id,
        timestamp: encoding.now(),
        temperature,
        humidity: rng.gen_range(30.0..80.0),
        co_ppm,
        dust_density,
        alarm_status: alarm_status.to_string(),
    }
}

/// Command as delivered by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub request_id: String,
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: String,
}

const KNOWN_COMMANDS: [&str; 3] = ["rename_device", "take_photo", "restart_device"];

pub fn respond(device_id: &str, command: &Command) -> CommandResponse {
    let known = KNOWN_COMMANDS.contains(&command.command.as_str());
    let (status, message, data) = if known {
        (
            "success",
            format!("{} executed", command.command),
            Some(serde_json::json!({
                "device_id": device_id,
                "parameters": command.parameters,
            })),
        )
    } else {
        ("error", format!("unknown command {}", command.command), None)
    };

    CommandResponse {
        request_id: command.request_id.clone(),
        status,
        message,
        data,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

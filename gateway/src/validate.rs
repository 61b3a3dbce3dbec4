use crate::errors::{Error, Result};
use crate::model::RawTelemetry;

const MAX_DEVICE_ID_LEN: usize = 128;

/// Validates telemetry data
pub fn validate(telemetry: &RawTelemetry) -> Result<()> {
    if telemetry.device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    let metrics = [
        ("temperature", telemetry.temperature),
        ("humidity", telemetry.humidity),
        ("co_ppm", telemetry.co_ppm),
        ("dust_density", telemetry.dust_density),
    ];
    for (name, value) in metrics {
        if !value.is_finite() {
            return Err(Error::Validation(format!("{} is not a finite number", name)));
        }
    }

    Ok(())
}

/// Device ids end up inside an MQTT topic, so they must form exactly one level.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(Error::Validation(format!(
            "Device ID longer than {} bytes",
            MAX_DEVICE_ID_LEN
        )));
    }

    if device_id.contains(['+', '#', '/']) {
        return Err(Error::Validation(format!(
            "Device ID '{}' contains a topic separator or wildcard",
            device_id
        )));
    }

    Ok(())
}

mod telemetry;

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use telemetry::{generate_telemetry, respond, Command, TimestampEncoding};
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "simulator", about = "Simulated sensor boards for the gateway")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Telemetry messages per second across all devices
    #[arg(long, env = "RATE", default_value_t = 10)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    #[arg(long, env = "MQTT_TOPIC_TELEMETRY", default_value = "armdetector/sensor/data")]
    telemetry_topic: String,

    #[arg(
        long,
        env = "SIM_COMMAND_FILTER",
        default_value = "armdetector/device/+/command"
    )]
    command_filter: String,

    #[arg(
        long,
        env = "SIM_RESPONSE_TEMPLATE",
        default_value = "armdetector/device/{device_id}/response"
    )]
    response_template: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting sensor simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.rate, args.devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    if let Err(e) = client.subscribe(&args.command_filter, QoS::AtLeastOnce).await {
        error!("Failed to subscribe to {}: {}", args.command_filter, e);
        return;
    }

    // Answer commands from the event loop task
    let responder = client.clone();
    let command_filter = args.command_filter.clone();
    let response_template = args.response_template.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // clean session: the subscription has to be sent again
                    if let Err(e) = responder.try_subscribe(&command_filter, QoS::AtLeastOnce) {
                        warn!("Failed to re-subscribe: {}", e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(device_id) = device_from_topic(&command_filter, &publish.topic)
                    else {
                        continue;
                    };
                    let command: Command = match serde_json::from_slice(&publish.payload) {
                        Ok(command) => command,
                        Err(e) => {
                            warn!("Ignoring undecodable command on {}: {}", publish.topic, e);
                            continue;
                        }
                    };
                    info!("{} received {} ({})", device_id, command.command, command.request_id);

                    let response = respond(&device_id, &command);
                    let topic = response_template.replace("{device_id}", &device_id);
                    match serde_json::to_vec(&response) {
                        Ok(payload) => {
                            if let Err(e) =
                                responder.try_publish(topic, QoS::AtLeastOnce, false, payload)
                            {
                                warn!("Failed to publish response: {}", e);
                            }
                        }
                        Err(e) => error!("Failed to serialize response: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish telemetry");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1));
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let device_id = format!("esp32-{:02}", counter % args.devices.max(1) as u64);
        let telemetry = generate_telemetry(
            &mut rng,
            device_id,
            TimestampEncoding::for_sequence(counter),
        );

        let payload = match serde_json::to_string(&telemetry) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize telemetry: {}", e);
                continue;
            }
        };

        match client
            .publish(&args.telemetry_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(_) => {
                counter += 1;
                debug!("Published reading for {}", telemetry.device_id);
            }
            Err(e) => {
                warn!("Failed to publish: {}", e);
            }
        }

        // Log progress periodically
        if counter > 0 && counter % 1000 == 0 {
            info!("Published {} messages", counter);
        }
    }
}

/// Picks the level matched by the `+` in `filter`.
fn device_from_topic(filter: &str, topic: &str) -> Option<String> {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();
    if filter_levels.len() != topic_levels.len() {
        return None;
    }

    let mut device = None;
    for (f, t) in filter_levels.iter().zip(topic_levels.iter()) {
        match *f {
            "+" => device = Some(t.to_string()),
            _ if f != t => return None,
            _ => {}
        }
    }
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_topic() {
        let filter = "armdetector/device/+/command";
        assert_eq!(
            device_from_topic(filter, "armdetector/device/esp32-01/command"),
            Some("esp32-01".to_string())
        );
        assert_eq!(device_from_topic(filter, "armdetector/device/esp32-01/response"), None);
        assert_eq!(device_from_topic(filter, "armdetector/device/command"), None);
    }

    #[test]
    fn test_unknown_command_gets_error_response() {
        let command = Command {
            command: "self_destruct".to_string(),
            parameters: None,
            request_id: "r-1".to_string(),
        };
        let response = respond("esp32-01", &command);
        assert_eq!(response.status, "error");
        assert_eq!(response.request_id, "r-1");

        let command = Command {
            command: "take_photo".to_string(),
            ..command
        };
        assert_eq!(respond("esp32-01", &command).status, "success");
    }
}

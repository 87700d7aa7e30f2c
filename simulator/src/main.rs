mod reading;

use anyhow::Context;
use clap::Parser;
use reading::{serial_number, Reading};
use rumqttc::{AsyncClient, MqttOptions, QoS, Transport};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes readings for a fleet of simulated peripherals
#[derive(Debug, Parser)]
#[command(name = "device-simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    port: u16,

    #[arg(long, env = "MQTT_CA_PATH", default_value = "certs/ca.crt")]
    ca_path: PathBuf,

    /// Client certificate presented to the gateway
    #[arg(long, env = "MQTT_CLIENT_CERT_PATH", default_value = "certs/client.crt")]
    cert_path: PathBuf,

    #[arg(long, env = "MQTT_CLIENT_KEY_PATH", default_value = "certs/client.key")]
    key_path: PathBuf,

    /// Messages per second across the whole fleet
    #[arg(long, env = "RATE", default_value_t = 10)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: u64,

    #[arg(long, env = "DATA_TOPIC_PREFIX", default_value = "/peripherals/readings/")]
    topic_prefix: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    anyhow::ensure!(
        (1..=1_000_000).contains(&args.rate),
        "rate must be between 1 and 1000000 msg/s"
    );
    anyhow::ensure!(args.devices > 0, "at least one device is required");

    info!("Starting device simulator");
    info!(
        "Gateway: {}:{}, Rate: {} msg/s, Devices: {}",
        args.host, args.port, args.rate, args.devices
    );

    let ca = std::fs::read(&args.ca_path)
        .with_context(|| format!("failed to read CA certificate {}", args.ca_path.display()))?;
    let cert = std::fs::read(&args.cert_path)
        .with_context(|| format!("failed to read client certificate {}", args.cert_path.display()))?;
    let key = std::fs::read(&args.key_path)
        .with_context(|| format!("failed to read client key {}", args.key_path.display()))?;

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.host, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_transport(Transport::tls(ca, Some((cert, key)), None));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / args.rate));

    info!("Publishing as {}", client_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping after {} messages", counter);
                break;
            }
            _ = ticker.tick() => {}
        }

        let serial_number = serial_number(counter % args.devices);
        let topic = format!("{}{}", args.topic_prefix, serial_number);
        let payload = match serde_json::to_string(&Reading::generate(&mut rng, serial_number)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize reading: {}", e);
                continue;
            }
        };

        match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => counter += 1,
            Err(e) => warn!("Failed to publish: {}", e),
        }

        if counter > 0 && counter % 1000 == 0 {
            info!("Published {} messages", counter);
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("Failed to disconnect cleanly: {}", e);
    }

    Ok(())
}

use crate::errors::{Error, Result};
use crate::mqtt::broker::BrokerConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at start-up from flags and environment.
#[derive(Clone, Parser)]
#[command(name = "telemetry-gateway", version, about = "Telemetry ingestion gateway")]
pub struct Config {
    /// Verbose logging and request/response body capture
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Secret expected in the X-API-Key header
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "MAX_REQUESTS_PER_SECOND", default_value_t = 5)]
    pub max_requests_per_second: u32,

    /// Seconds the HTTP server may spend draining requests on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "MQTT_ADDRESS", default_value = "0.0.0.0")]
    pub mqtt_address: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_CERT_PATH", default_value = "certs/server.crt")]
    pub cert_path: PathBuf,

    #[arg(long, env = "MQTT_KEY_PATH", default_value = "certs/server.key")]
    pub key_path: PathBuf,

    #[arg(long, env = "MQTT_CA_PATH", default_value = "certs/ca.crt")]
    pub ca_path: PathBuf,

    /// Topics starting with this prefix carry readings
    #[arg(long, env = "DATA_TOPIC_PREFIX", default_value = "/peripherals/readings/")]
    pub data_topic_prefix: String,

    #[arg(long, env = "MQTT_MAX_PACKET_SIZE", default_value_t = 256 * 1024)]
    pub max_packet_size: usize,

    /// SQLite database file, or `:memory:`
    #[arg(long, env = "DATABASE_PATH", default_value = ":memory:")]
    pub database_path: String,
}

/// Settings the HTTP side needs
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub addr: SocketAddr,
    pub max_requests_per_second: u32,
    pub shutdown_grace: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("debug", &self.debug)
            .field("http_port", &self.http_port)
            .field("api_key", &"<redacted>")
            .field("max_requests_per_second", &self.max_requests_per_second)
            .field("shutdown_grace_secs", &self.shutdown_grace_secs)
            .field("mqtt_address", &self.mqtt_address)
            .field("mqtt_port", &self.mqtt_port)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("ca_path", &self.ca_path)
            .field("data_topic_prefix", &self.data_topic_prefix)
            .field("max_packet_size", &self.max_packet_size)
            .field("database_path", &self.database_path)
            .finish()
    }
}

impl Config {
    /// Rejects values that would leave a component unable to start.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::Configuration("API key must not be empty".to_string()));
        }

        if self.max_requests_per_second == 0 {
            return Err(Error::Configuration(
                "max_requests_per_second must be at least 1".to_string(),
            ));
        }

        for (label, path) in [
            ("certificate", &self.cert_path),
            ("private key", &self.key_path),
            ("CA bundle", &self.ca_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(Error::Configuration(format!("{} path must not be empty", label)));
            }
        }

        if self.data_topic_prefix.is_empty() {
            return Err(Error::Configuration(
                "data topic prefix must not be empty".to_string(),
            ));
        }

        if self.max_packet_size == 0 {
            return Err(Error::Configuration(
                "max_packet_size must be greater than 0".to_string(),
            ));
        }

        if self.database_path.is_empty() {
            return Err(Error::Configuration("database path must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn http(&self) -> HttpConfig {
        HttpConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], self.http_port)),
            max_requests_per_second: self.max_requests_per_second,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            address: self.mqtt_address.clone(),
            port: self.mqtt_port,
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
            ca_path: self.ca_path.clone(),
            max_packet_size: self.max_packet_size,
        }
    }
}

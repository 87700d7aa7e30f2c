use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("MQTT protocol error: {0}")]
    Protocol(String),

    #[error("MQTT packet error: {0}")]
    Packet(#[from] rumqttc::mqttbytes::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures of the storage engine itself, as opposed to bad input.
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Migration(_) | Error::UnknownPeripheral(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use crate::db::Store;
use crate::errors::{Error, Result};
use crate::metrics::{
    DB_FAILURES_TOTAL, INGEST_LATENCY_SECONDS, PERIPHERALS_REGISTERED_TOTAL,
    READINGS_INGESTED_TOTAL, READINGS_REJECTED_TOTAL,
};
use crate::mqtt::hooks::{ClientInfo, Hook, HookKind};
use crate::validate::parse_reading;
use async_trait::async_trait;
use rumqttc::mqttbytes::v4::Publish;
use chrono::Utc;
use prometheus::Histogram;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Only topics starting with this prefix are treated as readings
    pub topic_prefix: String,
    pub store: Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// Topic outside the data prefix; storage untouched
    Ignored,
    Stored { reading_id: i64, registered: bool },
}

/// Turns messages published on data topics into stored readings, registering
/// unseen peripherals on the way.
#[derive(Debug, Clone)]
pub struct IngestHook {
    topic_prefix: String,
    store: Store,
    /// Observes accepted readings only
    latency: Histogram,
}

impl IngestHook {
    pub fn new(config: IngestConfig) -> Result<Self> {
        if config.topic_prefix.is_empty() {
            return Err(Error::Configuration(
                "ingest topic prefix must not be empty".to_string(),
            ));
        }

        Ok(Self {
            topic_prefix: config.topic_prefix,
            store: config.store,
            latency: INGEST_LATENCY_SECONDS.clone(),
        })
    }

    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> Result<IngestStatus> {
        let Some(suffix) = topic.strip_prefix(self.topic_prefix.as_str()) else {
            debug!(topic, "Ignoring message outside the data topic prefix");
            return Ok(IngestStatus::Ignored);
        };

        let timer = self.latency.start_timer();

        let reading = match parse_reading(payload) {
            Ok(reading) => reading,
            Err(e) => {
                timer.stop_and_discard();
                READINGS_REJECTED_TOTAL.inc();
                return Err(e);
            }
        };

        let outcome = match self.store.record_reading(&reading, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                timer.stop_and_discard();
                if e.is_storage_fault() {
                    DB_FAILURES_TOTAL.inc();
                }
                return Err(e);
            }
        };

        timer.observe_duration();
        READINGS_INGESTED_TOTAL.inc();
        if outcome.registered {
            PERIPHERALS_REGISTERED_TOTAL.inc();
            info!(serial_number = %reading.serial_number, "Registered new peripheral");
        }

        info!(
            serial_number = %reading.serial_number,
            reading_id = outcome.reading_id,
            topic_suffix = suffix,
            "Reading stored"
        );

        Ok(IngestStatus::Stored {
            reading_id: outcome.reading_id,
            registered: outcome.registered,
        })
    }
}

#[async_trait]
impl Hook for IngestHook {
    fn id(&self) -> &str {
        "ingest"
    }

    fn provides(&self) -> &'static [HookKind] {
        &[HookKind::OnPublished]
    }

    async fn on_published(&self, client: &ClientInfo, publish: &Publish) -> Result<()> {
        match self.ingest(&publish.topic, &publish.payload).await {
            Ok(_) => Ok(()),
            Err(e @ Error::Validation(_)) => {
                warn!(client = %client.id, topic = %publish.topic, "Dropping reading: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

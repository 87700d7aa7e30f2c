use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// A reading as a peripheral publishes it
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub serial_number: String,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl Reading {
    /// Plausible values with occasional outliers and low batteries
    pub fn generate(rng: &mut impl Rng, serial_number: String) -> Self {
        let temperature = if rng.gen_bool(0.05) {
            rng.gen_range(-50.0..100.0)
        } else {
            rng.gen_range(15.0..35.0)
        };

        let humidity = if rng.gen_bool(0.05) {
            rng.gen_range(0.0..100.0)
        } else {
            rng.gen_range(30.0..80.0)
        };

        let battery = if rng.gen_bool(0.02) {
            rng.gen_range(0.0..20.0)
        } else {
            rng.gen_range(20.0..100.0)
        };

        let mut data = Map::new();
        data.insert("temperature".to_string(), json!(temperature));
        data.insert("humidity".to_string(), json!(humidity));
        data.insert("battery".to_string(), json!(battery));

        Self {
            serial_number,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Serial numbers of the simulated fleet: `SIM00000`, `SIM00001`, ...
pub fn serial_number(index: u64) -> String {
    format!("SIM{:05}", index)
}

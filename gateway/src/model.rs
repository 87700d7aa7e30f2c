use crate::errors::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of field device. Serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PeripheralType {
    #[default]
    Unknown,
    Sensor,
    Actuator,
    Controller,
}

impl TryFrom<u8> for PeripheralType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PeripheralType::Unknown),
            1 => Ok(PeripheralType::Sensor),
            2 => Ok(PeripheralType::Actuator),
            3 => Ok(PeripheralType::Controller),
            other => Err(Error::Validation(format!(
                "Peripheral type {} is not one of 0 (Unknown), 1 (Sensor), 2 (Actuator), 3 (Controller)",
                other
            ))),
        }
    }
}

impl From<PeripheralType> for u8 {
    fn from(value: PeripheralType) -> Self {
        match value {
            PeripheralType::Unknown => 0,
            PeripheralType::Sensor => 1,
            PeripheralType::Actuator => 2,
            PeripheralType::Controller => 3,
        }
    }
}

impl fmt::Display for PeripheralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeripheralType::Unknown => "Unknown",
            PeripheralType::Sensor => "Sensor",
            PeripheralType::Actuator => "Actuator",
            PeripheralType::Controller => "Controller",
        };
        f.write_str(name)
    }
}

/// A registered field device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peripheral {
    pub serial_number: String,
    #[serde(rename = "type")]
    pub peripheral_type: PeripheralType,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: i64,
    pub serial_number: String,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

/// A measurement as published by a device, before it is stored.
///
/// Missing fields deserialize to their empty value so that validation, not
/// the JSON parser, decides what is acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    #[serde(default)]
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Body of `POST /peripherals`
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurePeripheralRequest {
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub peripheral_type: Option<PeripheralType>,
}

/// Body of `POST /readings`
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingsRequest {
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub num_readings: u32,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PeripheralsResponse {
    pub peripherals: Vec<Peripheral>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub readings: Vec<Reading>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

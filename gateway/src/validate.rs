use crate::errors::{Error, Result};
use crate::model::{ConfigurePeripheralRequest, NewReading, ReadingsRequest};

/// Upper bound on `num_readings` for a single query
pub const MAX_READINGS_PER_QUERY: u32 = 1000;

const MAX_SERIAL_NUMBER_LEN: usize = 128;

/// Parses a published payload into a reading and validates it
pub fn parse_reading(payload: &[u8]) -> Result<NewReading> {
    let reading = serde_json::from_slice::<NewReading>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    validate_reading(&reading)?;

    Ok(reading)
}

/// Validates a reading before it may reach storage
pub fn validate_reading(reading: &NewReading) -> Result<()> {
    validate_serial_number(&reading.serial_number)?;

    if reading.data.is_empty() {
        return Err(Error::Validation(
            "JSON key 'data' is required and cannot be empty".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_configure_request(request: &ConfigurePeripheralRequest) -> Result<()> {
    validate_serial_number(&request.serial_number)?;

    if request.name.trim().is_empty() {
        return Err(Error::Validation("Name is required".to_string()));
    }

    Ok(())
}

pub fn validate_readings_request(request: &ReadingsRequest) -> Result<()> {
    validate_serial_number(&request.serial_number)?;

    if request.num_readings == 0 {
        return Err(Error::Validation(
            "Number of readings must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_serial_number(serial_number: &str) -> Result<()> {
    if serial_number.is_empty() {
        return Err(Error::Validation(
            "JSON key 'serial_number' is required".to_string(),
        ));
    }

    if serial_number.len() > MAX_SERIAL_NUMBER_LEN {
        return Err(Error::Validation(format!(
            "Serial number longer than {} bytes",
            MAX_SERIAL_NUMBER_LEN
        )));
    }

    Ok(())
}

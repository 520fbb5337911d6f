//! Request-boundary validation rules (§4.1). Single-pass: the first rule
//! violated is the error returned.

use uuid::Uuid;

use crate::error::BrokerError;

/// Numeric ceilings and ranges referenced by the validation rules. Populated
/// from configuration at startup.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_message_size: usize,
    pub max_messages_per_page: usize,
    pub max_project_id_length: usize,
    pub message_ttl: std::ops::RangeInclusive<i64>,
    pub claim_ttl: std::ops::RangeInclusive<i64>,
    pub claim_grace: std::ops::RangeInclusive<i64>,
    pub max_bulk_get_ids: usize,
    pub max_bulk_delete_ids: usize,
    pub min_list_limit: usize,
    pub max_list_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_size: 256 * 1024,
            max_messages_per_page: 20,
            max_project_id_length: 256,
            message_ttl: 60..=1_209_600,
            claim_ttl: 60..=43_200,
            claim_grace: 60..=43_200,
            max_bulk_get_ids: 20,
            max_bulk_delete_ids: 20,
            min_list_limit: 1,
            max_list_limit: 20,
        }
    }
}

pub fn validate_queue_name(name: &str) -> Result<(), BrokerError> {
    let len = name.chars().count();
    if len == 0 || len > 64 {
        return Err(BrokerError::invalid_argument(format!(
            "queue name must be 1 to 64 characters, got {len}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BrokerError::invalid_argument(
            "queue name may only contain ASCII letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

pub fn validate_project_id(project: &str, limits: &Limits) -> Result<(), BrokerError> {
    if project.is_empty() {
        return Err(BrokerError::invalid_argument("X-Project-ID must not be empty"));
    }
    if project.chars().count() > limits.max_project_id_length {
        return Err(BrokerError::invalid_argument("X-Project-ID exceeds the configured length limit"));
    }
    if !project.chars().all(|c| !c.is_control()) {
        return Err(BrokerError::invalid_argument("X-Project-ID must be printable"));
    }
    Ok(())
}

pub fn validate_client_id(client_id: &str) -> Result<Uuid, BrokerError> {
    Uuid::parse_str(client_id)
        .map_err(|_| BrokerError::invalid_argument("Client-ID must be an RFC-4122 UUID"))
}

pub fn validate_message_ttl(ttl: i64, limits: &Limits) -> Result<(), BrokerError> {
    if !limits.message_ttl.contains(&ttl) {
        return Err(BrokerError::invalid_argument(format!(
            "message ttl must be between {} and {}, got {ttl}",
            limits.message_ttl.start(),
            limits.message_ttl.end()
        )));
    }
    Ok(())
}

pub fn validate_claim_ttl(ttl: i64, limits: &Limits) -> Result<(), BrokerError> {
    if !limits.claim_ttl.contains(&ttl) {
        return Err(BrokerError::invalid_argument(format!(
            "claim ttl must be between {} and {}, got {ttl}",
            limits.claim_ttl.start(),
            limits.claim_ttl.end()
        )));
    }
    Ok(())
}

pub fn validate_claim_grace(grace: i64, limits: &Limits) -> Result<(), BrokerError> {
    if !limits.claim_grace.contains(&grace) {
        return Err(BrokerError::invalid_argument(format!(
            "claim grace must be between {} and {}, got {grace}",
            limits.claim_grace.start(),
            limits.claim_grace.end()
        )));
    }
    Ok(())
}

pub fn validate_post_body_size(raw_len: usize, limits: &Limits) -> Result<(), BrokerError> {
    if raw_len > limits.max_message_size {
        return Err(BrokerError::PayloadTooLarge {
            size: raw_len,
            limit: limits.max_message_size,
        });
    }
    Ok(())
}

pub fn validate_post_batch_len(count: usize, limits: &Limits) -> Result<(), BrokerError> {
    if count > limits.max_messages_per_page {
        return Err(BrokerError::invalid_argument(format!(
            "batch of {count} messages exceeds the {} message limit",
            limits.max_messages_per_page
        )));
    }
    Ok(())
}

pub fn validate_bulk_get_ids(ids: &[String], limits: &Limits) -> Result<(), BrokerError> {
    if ids.len() > limits.max_bulk_get_ids {
        return Err(BrokerError::invalid_argument(format!(
            "bulk get of {} ids exceeds the {} id limit",
            ids.len(),
            limits.max_bulk_get_ids
        )));
    }
    Ok(())
}

pub fn validate_bulk_delete_ids(ids: &[String], limits: &Limits) -> Result<(), BrokerError> {
    if ids.len() > limits.max_bulk_delete_ids {
        return Err(BrokerError::invalid_argument(format!(
            "bulk delete of {} ids exceeds the {} id limit",
            ids.len(),
            limits.max_bulk_delete_ids
        )));
    }
    Ok(())
}

pub fn validate_list_limit(limit: usize, limits: &Limits) -> Result<(), BrokerError> {
    if limit < limits.min_list_limit || limit > limits.max_list_limit {
        return Err(BrokerError::invalid_argument(format!(
            "list limit must be between {} and {}, got {limit}",
            limits.min_list_limit, limits.max_list_limit
        )));
    }
    Ok(())
}

/// JSON numeric values must fit a signed 64-bit integer. `serde_json`
/// stores an integer literal too large for `i64` as `u64`, and one too
/// large for either as a lossily-converted `f64`; both cases are rejected
/// here so a wire overflow surfaces as `400` instead of silently wrapping.
pub fn validate_json_number_fits_i64(number: &serde_json::Number) -> Result<(), BrokerError> {
    if number.is_i64() {
        return Ok(());
    }
    if let Some(value) = number.as_u64() {
        if value <= i64::MAX as u64 {
            return Ok(());
        }
    } else if let Some(value) = number.as_f64() {
        let out_of_range = value.fract() == 0.0 && (value < i64::MIN as f64 || value > i64::MAX as f64);
        if !out_of_range {
            return Ok(());
        }
    }
    Err(BrokerError::invalid_argument("numeric value does not fit a signed 64-bit integer"))
}

/// Recursively validates every number nested anywhere in a decoded JSON
/// document against [`validate_json_number_fits_i64`] (§4.1's "JSON
/// numeric" rule applies over the whole decoded document, not just its
/// top-level fields).
pub fn validate_json_numbers(value: &serde_json::Value) -> Result<(), BrokerError> {
    match value {
        serde_json::Value::Number(number) => validate_json_number_fits_i64(number),
        serde_json::Value::Array(items) => items.iter().try_for_each(validate_json_numbers),
        serde_json::Value::Object(map) => map.values().try_for_each(validate_json_numbers),
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::String(_) => Ok(()),
    }
}

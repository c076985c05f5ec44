//! Field validation helpers for handler `validate` implementations.

use rtm_protocol::{Fault, ReceivedMessage};

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// A required, non-empty string field.
pub fn require_str<'a>(message: &'a ReceivedMessage, name: &str) -> Result<&'a str, Fault> {
    match message.field(name) {
        None => Err(Fault::validation(format!("Missing required field '{name}'"))),
        Some(value) => match value.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(s),
            Some(_) => Err(Fault::validation(format!("Field '{name}' must not be empty"))),
            None => Err(Fault::validation(format!("Field '{name}' must be a string"))),
        },
    }
}

/// Validate that a string field does not exceed `max_len` bytes.
pub fn validate_string_param(value: &str, name: &str, max_len: usize) -> Result<(), Fault> {
    if value.len() > max_len {
        return Err(Fault::validation(format!(
            "Field '{name}' exceeds maximum length ({} > {max_len})",
            value.len()
        )));
    }
    Ok(())
}

/// A required topic name within [`MAX_TOPIC_LENGTH`].
pub fn require_topic(message: &ReceivedMessage) -> Result<&str, Fault> {
    let topic = require_str(message, "topic")?;
    validate_string_param(topic, "topic", MAX_TOPIC_LENGTH)?;
    Ok(topic)
}

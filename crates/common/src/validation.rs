//! Input validation for stream descriptors and control-plane parameters
//!
//! Everything that ends up on a capture tool's command line or in a log line
//! passes through here first, so that malformed descriptors are rejected at
//! creation time instead of surfacing inside a running worker.

use anyhow::{anyhow, Result};

use crate::streams::SourceKind;

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for stream identifiers
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for source locators (URLs and file paths)
pub const MAX_LOCATOR_LENGTH: usize = 4096;

/// Maximum number of models a single stream may run per frame
pub const MAX_MODELS_PER_STREAM: usize = 16;

/// Highest capture device index accepted
pub const MAX_DEVICE_INDEX: u32 = 63;

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate a stream identifier
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }

    if id.chars().any(|c| c.is_control()) {
        return Err(anyhow!("{} contains control characters", field_name));
    }

    Ok(())
}

/// Validate a source locator for the given kind.
///
/// Device locators must be a small integer index; network locators must carry
/// a URL scheme; file locators are any non-empty path.
pub fn validate_locator(kind: SourceKind, locator: &str, field_name: &str) -> Result<()> {
    validate_non_empty(locator, field_name)?;
    validate_length(locator, MAX_LOCATOR_LENGTH, field_name)?;

    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r', '\0'];
    if locator.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains dangerous shell metacharacters",
            field_name
        ));
    }

    match kind {
        SourceKind::LiveDevice => {
            parse_device_index(locator, field_name)?;
        }
        SourceKind::NetworkStream => {
            if !locator.contains("://") {
                return Err(anyhow!(
                    "{} must be a URL with a scheme (e.g. rtsp://host/path)",
                    field_name
                ));
            }
        }
        SourceKind::File => {}
    }

    Ok(())
}

/// Parse a capture device index
pub fn parse_device_index(locator: &str, field_name: &str) -> Result<u32> {
    let index: u32 = locator
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a device index, got '{}'", field_name, locator))?;
    validate_range(index, 0, MAX_DEVICE_INDEX, field_name)?;
    Ok(index)
}

/// Validate value is within range
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ApiResult, AppError};

pub const MAX_NAME_LEN: usize = 255;

/// Batch sizes the operator surface accepts. The engine itself only needs
/// `>= 1`; the allow-list keeps dashboards and muscle memory consistent.
pub const ALLOWED_BATCH_SIZES: [u32; 4] = [5, 10, 25, 100];

static DEVICE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]+$").expect("device prefix regex"));

static FIRMWARE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z0-9]+_R_\d+\.\d+\.\d+\.\d+$").expect("firmware version regex")
});

pub fn validate_ip_address(raw: &str) -> ApiResult<String> {
    let trimmed = raw.trim();
    let parsed: Ipv4Addr = trimmed
        .parse()
        .map_err(|_| AppError::bad_request("ip_address must be a dotted-quad IPv4 address"))?;
    Ok(parsed.to_string())
}

pub fn validate_device_name(raw: &str) -> ApiResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request("device_name cannot be empty"));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(AppError::bad_request("device_name is too long"));
    }
    Ok(trimmed.to_string())
}

pub fn validate_batch_size(batch_size: u32) -> ApiResult<u32> {
    if ALLOWED_BATCH_SIZES.contains(&batch_size) {
        Ok(batch_size)
    } else {
        Err(AppError::bad_request(
            "batch_size must be one of 5, 10, 25, 100",
        ))
    }
}

pub fn validate_device_prefix(raw: &str) -> ApiResult<String> {
    let trimmed = raw.trim();
    if !DEVICE_PREFIX.is_match(trimmed) {
        return Err(AppError::bad_request(
            "device_prefix must be uppercase alphanumerics",
        ));
    }
    Ok(trimmed.to_string())
}

pub fn validate_firmware_version(prefix: &str, raw: &str) -> ApiResult<String> {
    let trimmed = raw.trim();
    if !FIRMWARE_VERSION.is_match(trimmed) {
        return Err(AppError::bad_request(
            "latest_version must match PREFIX_R_dd.dd.dd.dd",
        ));
    }
    if !trimmed.starts_with(&format!("{prefix}_R_")) {
        return Err(AppError::bad_request(
            "latest_version must belong to the device family prefix",
        ));
    }
    Ok(trimmed.to_string())
}

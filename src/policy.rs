//! Operator-maintained latest-version policy.
//!
//! Firmware strings look like `RUT9_R_00.07.06.20`: a device-family prefix,
//! an `_R_` marker, and a four-part numeric tail. The operator table maps a
//! family prefix to the latest version known for that family.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;

use crate::persistence::FirmwareVersionRecord;

static DEVICE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z0-9]+)_").expect("device prefix regex"));

static NUMERIC_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)\.(\d+)$").expect("numeric tail regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub available: bool,
    pub latest_version: Option<String>,
}

impl PolicyDecision {
    fn none() -> Self {
        Self {
            available: false,
            latest_version: None,
        }
    }
}

/// Leading alphanumeric token before the first underscore, e.g. `RUT9`.
pub fn device_prefix(firmware: &str) -> Option<&str> {
    DEVICE_PREFIX
        .captures(firmware)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn numeric_tail(version: &str) -> Option<[u32; 4]> {
    let caps = NUMERIC_TAIL.captures(version)?;
    let mut parts = [0u32; 4];
    for (i, part) in parts.iter_mut().enumerate() {
        *part = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    Some(parts)
}

/// Compare two firmware strings by their four-part numeric tails, component
/// by component; the first unequal component decides. When either side has
/// no parseable tail the comparison falls back to plain string ordering.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (numeric_tail(a), numeric_tail(b)) {
        (Some(left), Some(right)) => left.cmp(&right),
        _ => a.cmp(b),
    }
}

/// Evaluate the table against a device's current firmware.
pub fn evaluate(current: &str, table: &[FirmwareVersionRecord]) -> PolicyDecision {
    let Some(prefix) = device_prefix(current) else {
        return PolicyDecision::none();
    };
    let Some(entry) = table.iter().find(|row| row.device_prefix == prefix) else {
        return PolicyDecision::none();
    };

    let available = match (numeric_tail(&entry.latest_version), numeric_tail(current)) {
        (Some(latest), Some(device)) => latest > device,
        // No parseable tail on one side: any difference counts as an update.
        _ => entry.latest_version != current,
    };

    PolicyDecision {
        available,
        latest_version: Some(entry.latest_version.clone()),
    }
}

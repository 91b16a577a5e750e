//! Firmware state probing and update commands against the on-device FOTA
//! agent.
//!
//! [`FirmwareProbe`] is the seam between the engines and the devices; the
//! production implementation drives the vendor command vocabulary over the
//! remote shell, tests substitute a scripted probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SshConfig;
use crate::ssh::{ShellError, ShellTarget, SshClient};

const CMD_CURRENT_VERSION: &str = "cat /etc/version";
const CMD_FOTA_INFO: &str = "ubus call rut_fota get_info";
const CMD_DOWNLOAD_FIRMWARE: &str = "rut_fota --download_fw";
const CMD_IMAGE_PRESENT: &str = "ls -la /tmp/firmware.img";
const CMD_VERIFY_IMAGE: &str = "sysupgrade -T /tmp/firmware.img";
// -c keeps the device configuration across the flash.
const CMD_APPLY_IMAGE: &str = "sysupgrade -c /tmp/firmware.img";
const CMD_PING: &str = "echo ok";

/// Sentinel the FOTA agent reports when it has no newer image on offer.
const FW_NEWEST: &str = "Fw_newest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub current: Option<String>,
    pub available: Option<String>,
    pub update_available: bool,
}

impl FirmwareInfo {
    pub fn derive(current: Option<String>, available: Option<String>) -> Self {
        let update_available = match (&current, &available) {
            (_, None) => false,
            (current, Some(available)) => current.as_deref() != Some(available.as_str()),
        };
        Self {
            current,
            available,
            update_available,
        }
    }
}

#[async_trait]
pub trait FirmwareProbe: Send + Sync {
    /// Cheap reachability probe; true only on a clean round trip.
    async fn ping(&self, target: &ShellTarget) -> bool;
    async fn current_version(&self, target: &ShellTarget) -> Result<Option<String>, ShellError>;
    async fn firmware_info(&self, target: &ShellTarget) -> Result<FirmwareInfo, ShellError>;
    async fn image_present(&self, target: &ShellTarget) -> Result<bool, ShellError>;
    async fn download_image(&self, target: &ShellTarget) -> Result<bool, ShellError>;
    async fn verify_image(&self, target: &ShellTarget) -> Result<bool, ShellError>;
    /// Submit the flash. The command reboots the device and reliably severs
    /// its own session, so a closed connection during or right after
    /// submission counts as success; any other failure is real.
    async fn apply_image(&self, target: &ShellTarget) -> Result<(), ShellError>;
}

pub type DynFirmwareProbe = Arc<dyn FirmwareProbe>;

pub struct SshFirmwareProbe {
    client: SshClient,
    timeouts: SshConfig,
}

impl SshFirmwareProbe {
    pub fn new(timeouts: SshConfig) -> Self {
        let client = SshClient::new(Duration::from_secs(timeouts.connect_timeout_secs));
        Self { client, timeouts }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_timeout_secs)
    }
}

#[async_trait]
impl FirmwareProbe for SshFirmwareProbe {
    async fn ping(&self, target: &ShellTarget) -> bool {
        let timeout = Duration::from_secs(self.timeouts.ping_timeout_secs);
        self.client
            .exec_strict(target, CMD_PING, timeout)
            .await
            .is_ok()
    }

    async fn current_version(&self, target: &ShellTarget) -> Result<Option<String>, ShellError> {
        let raw = self
            .client
            .exec(target, CMD_CURRENT_VERSION, self.command_timeout())
            .await?;
        Ok(normalize_version(&raw))
    }

    async fn firmware_info(&self, target: &ShellTarget) -> Result<FirmwareInfo, ShellError> {
        let current = self.current_version(target).await?;
        // rut_fota exits non-zero on some firmware lines while still
        // printing the info envelope; the lenient exec keeps that output.
        let raw = self
            .client
            .exec(target, CMD_FOTA_INFO, self.command_timeout())
            .await?;
        let available = parse_fota_info(&raw);
        Ok(FirmwareInfo::derive(current, available))
    }

    async fn image_present(&self, target: &ShellTarget) -> Result<bool, ShellError> {
        match self
            .client
            .exec_strict(target, CMD_IMAGE_PRESENT, self.command_timeout())
            .await
        {
            Ok(_) => Ok(true),
            Err(ShellError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn download_image(&self, target: &ShellTarget) -> Result<bool, ShellError> {
        let timeout = Duration::from_secs(self.timeouts.download_timeout_secs);
        // Lenient exec: the downloader reports progress on stdout and its
        // exit code is unreliable across firmware lines. The image check
        // below is the authoritative outcome.
        self.client.exec(target, CMD_DOWNLOAD_FIRMWARE, timeout).await?;
        self.image_present(target).await
    }

    async fn verify_image(&self, target: &ShellTarget) -> Result<bool, ShellError> {
        match self
            .client
            .exec_strict(target, CMD_VERIFY_IMAGE, self.command_timeout())
            .await
        {
            Ok(_) => Ok(true),
            Err(ShellError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn apply_image(&self, target: &ShellTarget) -> Result<(), ShellError> {
        let timeout = Duration::from_secs(self.timeouts.apply_timeout_secs);
        match self.client.exec(target, CMD_APPLY_IMAGE, timeout).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_connection_closed() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn normalize_version(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Extract the offered firmware from the agent's JSON envelope. A missing
/// `fw` field, an unparsable envelope, or the `Fw_newest` sentinel all mean
/// the device reports no update.
fn parse_fota_info(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    let fw = value.get("fw")?.as_str()?.trim();
    if fw.is_empty() || fw == FW_NEWEST {
        None
    } else {
        Some(fw.to_string())
    }
}

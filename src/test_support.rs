//! Scripted device fleet for engine tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::app_state::AppState;
use crate::config::RolloutConfig;
use crate::events::{EventBus, Subscription, UpdateEvent};
use crate::fota::{FirmwareInfo, FirmwareProbe};
use crate::persistence::migrations;
use crate::services::rollout::RolloutRegistry;
use crate::ssh::{ShellError, ShellTarget};

/// Scripted behavior of one simulated device, keyed by its IP.
#[derive(Debug, Clone)]
pub(crate) struct DeviceSim {
    pub reachable: bool,
    pub current: Option<String>,
    pub offered: Option<String>,
    pub info_error: bool,
    pub image_present: bool,
    pub download_ok: bool,
    pub verify_ok: bool,
    pub apply_ok: bool,
    pub post_flash_version: Option<String>,
    /// How many reboot polls fail before the device answers again.
    pub reboot_delay_polls: u32,
}

impl DeviceSim {
    pub fn reachable(current: &str) -> Self {
        Self {
            reachable: true,
            current: Some(current.to_string()),
            offered: None,
            info_error: false,
            image_present: false,
            download_ok: true,
            verify_ok: true,
            apply_ok: true,
            post_flash_version: None,
            reboot_delay_polls: 0,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::reachable("")
        }
    }

    pub fn offering(mut self, version: &str) -> Self {
        self.offered = Some(version.to_string());
        self
    }

    pub fn with_info_error(mut self) -> Self {
        self.info_error = true;
        self
    }

    pub fn flashing_to(mut self, version: &str) -> Self {
        self.post_flash_version = Some(version.to_string());
        self
    }

    pub fn with_reboot_delay(mut self, polls: u32) -> Self {
        self.reboot_delay_polls = polls;
        self
    }

    pub fn failing_download(mut self) -> Self {
        self.download_ok = false;
        self
    }

    pub fn failing_verify(mut self) -> Self {
        self.verify_ok = false;
        self
    }

    pub fn failing_apply(mut self) -> Self {
        self.apply_ok = false;
        self
    }
}

#[derive(Debug)]
struct DeviceState {
    sim: DeviceSim,
    applied: bool,
    polls_after_apply: u32,
    calls: u32,
}

#[derive(Debug, Default)]
pub(crate) struct MockProbe {
    devices: Mutex<HashMap<String, DeviceState>>,
}

impl MockProbe {
    pub fn script(&self, host: &str, sim: DeviceSim) {
        self.devices.lock().expect("mock probe lock").insert(
            host.to_string(),
            DeviceState {
                sim,
                applied: false,
                polls_after_apply: 0,
                calls: 0,
            },
        );
    }

    pub fn call_count(&self, host: &str) -> u32 {
        self.devices
            .lock()
            .expect("mock probe lock")
            .get(host)
            .map(|device| device.calls)
            .unwrap_or(0)
    }

    pub fn applied(&self, host: &str) -> bool {
        self.devices
            .lock()
            .expect("mock probe lock")
            .get(host)
            .map(|device| device.applied)
            .unwrap_or(false)
    }

    fn with_device<R>(&self, host: &str, op: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut devices = self.devices.lock().expect("mock probe lock");
        let device = devices.entry(host.to_string()).or_insert_with(|| DeviceState {
            sim: DeviceSim::unreachable(),
            applied: false,
            polls_after_apply: 0,
            calls: 0,
        });
        device.calls += 1;
        op(device)
    }
}

#[async_trait]
impl FirmwareProbe for MockProbe {
    async fn ping(&self, target: &ShellTarget) -> bool {
        self.with_device(&target.host, |device| device.sim.reachable)
    }

    async fn current_version(&self, target: &ShellTarget) -> Result<Option<String>, ShellError> {
        self.with_device(&target.host, |device| {
            if device.applied {
                device.polls_after_apply += 1;
                if device.polls_after_apply > device.sim.reboot_delay_polls {
                    Ok(device.sim.post_flash_version.clone())
                } else {
                    Err(ShellError::ConnectRefused)
                }
            } else {
                Ok(device.sim.current.clone())
            }
        })
    }

    async fn firmware_info(&self, target: &ShellTarget) -> Result<FirmwareInfo, ShellError> {
        self.with_device(&target.host, |device| {
            if device.sim.info_error {
                Err(ShellError::Unknown("fota agent returned garbage".into()))
            } else {
                Ok(FirmwareInfo::derive(
                    device.sim.current.clone(),
                    device.sim.offered.clone(),
                ))
            }
        })
    }

    async fn image_present(&self, target: &ShellTarget) -> Result<bool, ShellError> {
        self.with_device(&target.host, |device| Ok(device.sim.image_present))
    }

    async fn download_image(&self, target: &ShellTarget) -> Result<bool, ShellError> {
        self.with_device(&target.host, |device| {
            if device.sim.download_ok {
                device.sim.image_present = true;
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    async fn verify_image(&self, target: &ShellTarget) -> Result<bool, ShellError> {
        self.with_device(&target.host, |device| Ok(device.sim.verify_ok))
    }

    async fn apply_image(&self, target: &ShellTarget) -> Result<(), ShellError> {
        self.with_device(&target.host, |device| {
            if device.sim.apply_ok {
                device.applied = true;
                Ok(())
            } else {
                Err(ShellError::CommandFailed {
                    stderr: "Invalid image".into(),
                    exit_code: 1,
                })
            }
        })
    }
}

pub(crate) async fn test_state(probe: Arc<MockProbe>) -> AppState {
    test_state_with(
        probe,
        RolloutConfig {
            reboot_poll_attempts: 20,
            reboot_poll_interval_secs: 0,
            pause_tick_secs: 0,
        },
    )
    .await
}

pub(crate) async fn test_state_with(probe: Arc<MockProbe>, rollout: RolloutConfig) -> AppState {
    let db = migrations::init_pool("sqlite::memory:").await.expect("pool");
    migrations::run_migrations(&db).await.expect("migrations");
    AppState {
        db,
        events: EventBus::new(),
        rollouts: RolloutRegistry::default(),
        probe,
        rollout,
        metrics_handle: crate::metrics::init_metrics_recorder(),
    }
}

/// Collect everything a subscription has buffered so far.
pub(crate) fn drain(subscription: &mut Subscription) -> Vec<UpdateEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

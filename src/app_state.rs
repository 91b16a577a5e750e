use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::RolloutConfig;
use crate::events::EventBus;
use crate::fota::DynFirmwareProbe;
use crate::persistence;
use crate::services::rollout::RolloutRegistry;

/// Shared application state passed into handlers and engines.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    /// Process-wide event hub (one per process; survives for its lifetime).
    pub events: EventBus,
    /// Abort flags of in-flight rollout jobs.
    pub rollouts: RolloutRegistry,
    pub probe: DynFirmwareProbe,
    pub rollout: RolloutConfig,
    pub metrics_handle: PrometheusHandle,
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}

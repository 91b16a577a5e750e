//! Concurrent firmware-state scan over the inventory.
//!
//! The fleet is probed in chunks of ten: each chunk runs fully in parallel
//! and the next one starts only once the whole chunk settled. Results are
//! persisted per router and streamed on the event bus under the reserved
//! job id `check`.

use futures_util::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::events::{UpdateEvent, UpdateEventType, SCAN_JOB_ID};
use crate::persistence::{self as db, routers, versions, FirmwareVersionRecord, RouterRecord,
    RouterStatus};
use crate::policy;
use crate::telemetry;
use crate::Result;

pub const SCAN_CHUNK_SIZE: usize = 10;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub updates_available: usize,
    pub up_to_date: usize,
    pub unreachable: usize,
    pub failed: usize,
}

enum ScanOutcome {
    UpdateAvailable,
    UpToDate,
    Unreachable,
    Failed,
}

/// Scan the selected routers (all of them when `router_ids` is `None`).
pub async fn run_scan(state: &AppState, router_ids: Option<Vec<Uuid>>) -> Result<ScanReport> {
    let mut selected = match router_ids {
        Some(ids) => {
            let mut found = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(router) = routers::get_router(&state.db, id).await? {
                    found.push(router);
                }
            }
            found
        }
        None => routers::list_routers(&state.db).await?,
    };
    // A router mid-update belongs to the rollout engine; scanning it would
    // race the pipeline's own status writes.
    selected.retain(|router| router.status != RouterStatus::Updating);

    let version_table = versions::list_versions(&state.db).await?;

    let total = selected.len();
    state.events.emit(
        UpdateEvent::new(UpdateEventType::JobStarted, SCAN_JOB_ID)
            .with_total(total as u32)
            .with_message(format!("Checking firmware on {total} routers")),
    );

    let mut report = ScanReport::default();
    let total_batches = selected.chunks(SCAN_CHUNK_SIZE).count() as u32;
    let mut done = 0usize;

    for (idx, chunk) in selected.chunks(SCAN_CHUNK_SIZE).enumerate() {
        state.events.emit(
            UpdateEvent::new(UpdateEventType::BatchStarted, SCAN_JOB_ID)
                .with_batch(idx as u32 + 1, total_batches),
        );

        let outcomes = join_all(
            chunk
                .iter()
                .map(|router| scan_router(state, &version_table, router)),
        )
        .await;

        for outcome in outcomes {
            report.scanned += 1;
            match outcome {
                ScanOutcome::UpdateAvailable => report.updates_available += 1,
                ScanOutcome::UpToDate => report.up_to_date += 1,
                ScanOutcome::Unreachable => report.unreachable += 1,
                ScanOutcome::Failed => report.failed += 1,
            }
        }

        done += chunk.len();
        state.events.emit(
            UpdateEvent::new(UpdateEventType::JobProgress, SCAN_JOB_ID)
                .with_progress(super::percent_complete(done, total))
                .with_total(total as u32)
                .with_counts(
                    (report.updates_available + report.up_to_date) as u32,
                    (report.unreachable + report.failed) as u32,
                ),
        );
    }

    state.events.emit(
        UpdateEvent::new(UpdateEventType::JobCompleted, SCAN_JOB_ID)
            .with_total(total as u32)
            .with_counts(
                (report.updates_available + report.up_to_date) as u32,
                (report.unreachable + report.failed) as u32,
            )
            .with_message("Firmware check finished"),
    );
    info!(
        scanned = report.scanned,
        updates_available = report.updates_available,
        unreachable = report.unreachable,
        failed = report.failed,
        "inventory scan finished"
    );

    Ok(report)
}

async fn scan_router(
    state: &AppState,
    version_table: &[FirmwareVersionRecord],
    router: &RouterRecord,
) -> ScanOutcome {
    match scan_router_inner(state, version_table, router).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(router_id = %router.id, ?err, "scan failed to persist router state");
            emit_router_failed(state, router, "internal error while scanning");
            ScanOutcome::Failed
        }
    }
}

async fn scan_router_inner(
    state: &AppState,
    version_table: &[FirmwareVersionRecord],
    router: &RouterRecord,
) -> Result<ScanOutcome> {
    let pool = &state.db;

    let Some(target) = super::resolve_target(pool, router).await? else {
        persist(pool, router, None, RouterStatus::Error).await?;
        emit_router_failed(state, router, "No credentials configured for router");
        telemetry::record_router_outcome("scan", "no_credentials");
        return Ok(ScanOutcome::Failed);
    };

    if !state.probe.ping(&target).await {
        persist(pool, router, None, RouterStatus::Unreachable).await?;
        emit_router_failed(state, router, "Device unreachable");
        telemetry::record_router_outcome("scan", "unreachable");
        return Ok(ScanOutcome::Unreachable);
    }

    let info = match state.probe.firmware_info(&target).await {
        Ok(info) => info,
        Err(err) => {
            persist(pool, router, None, RouterStatus::Error).await?;
            emit_router_failed(state, router, &err.to_string());
            telemetry::record_router_outcome("scan", "error");
            return Ok(ScanOutcome::Failed);
        }
    };

    // The agent's own offer wins; the operator table fills in for devices
    // whose agent reports nothing newer.
    let mut available = if info.update_available {
        info.available.clone()
    } else {
        None
    };
    if available.is_none() {
        if let Some(current) = info.current.as_deref() {
            let decision = policy::evaluate(current, version_table);
            if decision.available {
                available = decision.latest_version;
            }
        }
    }

    if let Some(available_version) = available {
        routers::update_firmware_info(
            pool,
            router.id,
            info.current.as_deref(),
            Some(&available_version),
            RouterStatus::UpdateAvailable,
        )
        .await?;
        state.events.emit(
            UpdateEvent::new(UpdateEventType::RouterProgress, SCAN_JOB_ID)
                .with_router(router.id, &router.device_name, &router.ip_address)
                .with_status("update_available")
                .with_firmware(info.current.clone(), Some(available_version)),
        );
        telemetry::record_router_outcome("scan", "update_available");
        Ok(ScanOutcome::UpdateAvailable)
    } else {
        routers::update_firmware_info(
            pool,
            router.id,
            info.current.as_deref(),
            None,
            RouterStatus::UpToDate,
        )
        .await?;
        state.events.emit(
            UpdateEvent::new(UpdateEventType::RouterCompleted, SCAN_JOB_ID)
                .with_router(router.id, &router.device_name, &router.ip_address)
                .with_status("up_to_date")
                .with_firmware(info.current.clone(), None),
        );
        telemetry::record_router_outcome("scan", "up_to_date");
        Ok(ScanOutcome::UpToDate)
    }
}

async fn persist(
    pool: &db::Db,
    router: &RouterRecord,
    available: Option<&str>,
    status: RouterStatus,
) -> Result<()> {
    routers::update_firmware_info(
        pool,
        router.id,
        router.current_firmware.as_deref(),
        available.or(router.available_firmware.as_deref()),
        status,
    )
    .await?;
    Ok(())
}

fn emit_router_failed(state: &AppState, router: &RouterRecord, error: &str) {
    state.events.emit(
        UpdateEvent::new(UpdateEventType::RouterFailed, SCAN_JOB_ID)
            .with_router(router.id, &router.device_name, &router.ip_address)
            .with_error(error),
    );
}

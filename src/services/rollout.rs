//! Batched firmware rollout engine.
//!
//! At most one rollout runs at a time. The engine splits the candidate set
//! into windows of `batch_size`, drives every router of a window through
//! the update pipeline in parallel, persists counters per window, and
//! pauses a configurable number of minutes between windows so the access
//! network can reconverge after a wave of reboots.
//!
//! Cancellation is cooperative and batch-granular: the abort flag is
//! checked at the top of each window and once per minute of the pause,
//! never mid-flash — tearing down a flash in progress can brick a device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::events::{UpdateEvent, UpdateEventType};
use crate::persistence::{
    history, jobs, routers, settings, JobRecord, JobStatus, NewHistoryRecord, RouterRecord,
    RouterStatus,
};
use crate::ssh::ShellTarget;
use crate::telemetry;
use crate::Result;

const ERR_NO_CREDENTIALS: &str = "No credentials configured for router";
const ERR_DOWNLOAD: &str = "Firmware download failed";
const ERR_VERIFY: &str = "Firmware image verification failed";
const ERR_REBOOT_TIMEOUT: &str = "Router did not come back online after update";

/// Abort flags of running jobs, keyed by job id. The flags are in-process
/// state; a restart loses them, which is why startup recovery cancels any
/// job still marked active in the store.
#[derive(Clone, Default)]
pub struct RolloutRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl RolloutRegistry {
    pub fn register(&self, job_id: Uuid) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.inner
            .lock()
            .expect("rollout registry lock poisoned")
            .insert(job_id, flag.clone());
        flag
    }

    pub fn flag(&self, job_id: Uuid) -> Option<Arc<AtomicBool>> {
        self.inner
            .lock()
            .expect("rollout registry lock poisoned")
            .get(&job_id)
            .cloned()
    }

    /// Request cancellation. Returns false when the job is not registered
    /// (already finished, or lost to a restart).
    pub fn request_abort(&self, job_id: Uuid) -> bool {
        match self.flag(job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: Uuid) {
        self.inner
            .lock()
            .expect("rollout registry lock poisoned")
            .remove(&job_id);
    }
}

#[derive(Debug, Clone)]
pub struct StartRollout {
    pub router_ids: Option<Vec<Uuid>>,
    pub batch_size: u32,
    pub include_errors: bool,
}

/// Validate preconditions, create the job, and resolve the candidate set.
/// The job is `running` and its abort flag registered when this returns.
pub async fn prepare_rollout(
    state: &AppState,
    request: StartRollout,
) -> ApiResult<(JobRecord, Vec<RouterRecord>)> {
    if request.batch_size == 0 {
        return Err(AppError::bad_request("batch_size must be at least 1"));
    }

    if let Some(active) = jobs::get_active_job(&state.db).await? {
        return Err(AppError::conflict(format!(
            "a rollout is already active: {}",
            active.id
        )));
    }

    let candidates = match &request.router_ids {
        Some(ids) => {
            let mut found = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(router) = routers::get_router(&state.db, *id).await? {
                    found.push(router);
                }
            }
            found
        }
        None => {
            let mut set =
                routers::list_routers_by_status(&state.db, RouterStatus::UpdateAvailable).await?;
            if request.include_errors {
                set.extend(
                    routers::list_routers_by_status(&state.db, RouterStatus::Error).await?,
                );
                set.extend(
                    routers::list_routers_by_status(&state.db, RouterStatus::Unreachable).await?,
                );
            }
            set
        }
    };

    if candidates.is_empty() {
        return Err(AppError::bad_request("no routers eligible for update"));
    }

    let job = jobs::insert_job(
        &state.db,
        jobs::NewJob {
            id: Uuid::new_v4(),
            batch_size: request.batch_size,
            total_routers: candidates.len() as u32,
        },
    )
    .await?;
    jobs::mark_running(&state.db, job.id).await?;
    let job = jobs::get_job(&state.db, job.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job vanished after insert"))?;

    state.rollouts.register(job.id);

    info!(
        job_id = %job.id,
        total = candidates.len(),
        batch_size = request.batch_size,
        include_errors = request.include_errors,
        "rollout starting"
    );

    Ok((job, candidates))
}

/// Start a rollout in the background and return the job immediately.
pub async fn start_rollout(state: &AppState, request: StartRollout) -> ApiResult<JobRecord> {
    let (job, candidates) = prepare_rollout(state, request).await?;
    let task_state = state.clone();
    let task_job = job.clone();
    tokio::spawn(async move {
        run_rollout(task_state, task_job, candidates).await;
    });
    Ok(job)
}

/// Request cancellation of a job. In-flight router pipelines finish
/// naturally; the batch loop stops before the next window.
pub async fn cancel_rollout(state: &AppState, job_id: Uuid) -> ApiResult<JobRecord> {
    let job = jobs::get_job(&state.db, job_id)
        .await?
        .ok_or_else(|| AppError::not_found("rollout not found"))?;

    match job.status {
        JobStatus::Pending | JobStatus::Running => {
            if !state.rollouts.request_abort(job_id) {
                // Active in the store but not in memory: the owning process
                // state is gone, finish the record directly.
                jobs::finish_job(&state.db, job_id, JobStatus::Cancelled).await?;
            }
            let job = jobs::get_job(&state.db, job_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job vanished during cancel"))?;
            Ok(job)
        }
        JobStatus::Completed | JobStatus::Cancelled => {
            Err(AppError::conflict("rollout has already finished"))
        }
    }
}

/// Drive a prepared rollout to completion. Runs as its own task; every
/// error is absorbed into the job record and the event stream.
pub async fn run_rollout(state: AppState, job: JobRecord, routers: Vec<RouterRecord>) {
    let job_id = job.id;
    if let Err(err) = run_rollout_inner(&state, &job, &routers).await {
        error!(job_id = %job_id, ?err, "rollout aborted on internal error");
        if let Err(err) = jobs::finish_job(&state.db, job_id, JobStatus::Cancelled).await {
            error!(job_id = %job_id, ?err, "failed to finalize aborted rollout");
        }
    }
    state.events.cleanup(&job_id.to_string());
    state.rollouts.remove(job_id);
}

async fn run_rollout_inner(
    state: &AppState,
    job: &JobRecord,
    routers: &[RouterRecord],
) -> Result<()> {
    let job_id = job.id;
    let job_key = job_id.to_string();
    let flag = state
        .rollouts
        .flag(job_id)
        .unwrap_or_else(|| state.rollouts.register(job_id));

    let total = routers.len();
    let batch_size = job.batch_size.max(1) as usize;
    let total_batches = routers.chunks(batch_size).count() as u32;

    state.events.emit(
        UpdateEvent::new(UpdateEventType::JobStarted, &job_key)
            .with_total(total as u32)
            .with_message(format!("Updating {total} routers")),
    );

    let mut completed = 0u32;
    let mut failed = 0u32;

    for (idx, batch) in routers.chunks(batch_size).enumerate() {
        if flag.load(Ordering::SeqCst) {
            break;
        }
        let batch_number = idx as u32 + 1;

        state.events.emit(
            UpdateEvent::new(UpdateEventType::BatchStarted, &job_key)
                .with_batch(batch_number, total_batches)
                .with_message(format!("Starting batch {batch_number} of {total_batches}")),
        );

        let results = join_all(
            batch
                .iter()
                .map(|router| update_router(state, &job_key, router)),
        )
        .await;
        for success in results {
            if success {
                completed += 1;
            } else {
                failed += 1;
            }
        }

        jobs::update_progress(&state.db, job_id, completed, failed).await?;

        state.events.emit(
            UpdateEvent::new(UpdateEventType::BatchCompleted, &job_key)
                .with_batch(batch_number, total_batches)
                .with_counts(completed, failed),
        );
        state.events.emit(
            UpdateEvent::new(UpdateEventType::JobProgress, &job_key)
                .with_progress(super::percent_complete((completed + failed) as usize, total))
                .with_total(total as u32)
                .with_counts(completed, failed),
        );

        let more_batches = batch_number < total_batches;
        if more_batches && !flag.load(Ordering::SeqCst) {
            pause_between_batches(state, &job_key, &flag).await;
        }
    }

    let cancelled = flag.load(Ordering::SeqCst);
    let final_status = if cancelled {
        JobStatus::Cancelled
    } else {
        JobStatus::Completed
    };
    jobs::finish_job(&state.db, job_id, final_status).await?;

    state.events.emit(
        UpdateEvent::new(UpdateEventType::JobCompleted, &job_key)
            .with_status(if cancelled { "cancelled" } else { "completed" })
            .with_total(total as u32)
            .with_counts(completed, failed),
    );
    info!(
        job_id = %job_id,
        completed,
        failed,
        cancelled,
        "rollout finished"
    );

    Ok(())
}

/// Minute-granular pause between batches. Emits one `batch_waiting` per
/// remaining minute so dashboards can show a live countdown, and re-checks
/// the abort flag each minute so a cancel becomes visible within one tick.
async fn pause_between_batches(state: &AppState, job_key: &str, flag: &AtomicBool) {
    let minutes = match settings::batch_wait_minutes(&state.db).await {
        Ok(minutes) => minutes,
        Err(err) => {
            warn!(?err, "failed to read batch_wait_minutes; using default");
            settings::DEFAULT_BATCH_WAIT_MINUTES
        }
    };
    if minutes == 0 {
        return;
    }

    let tick = Duration::from_secs(state.rollout.pause_tick_secs);
    for remaining in (1..=minutes).rev() {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        state.events.emit(
            UpdateEvent::new(UpdateEventType::BatchWaiting, job_key)
                .with_wait_remaining(remaining)
                .with_message(format!("Waiting {remaining} min before next batch")),
        );
        tokio::time::sleep(tick).await;
    }
}

/// Drive one router through the update pipeline. Never propagates errors:
/// the outcome lands in the history row, the router status, and the event
/// stream, and the batch simply counts it.
async fn update_router(state: &AppState, job_key: &str, router: &RouterRecord) -> bool {
    match update_router_inner(state, job_key, router).await {
        Ok(success) => success,
        Err(err) => {
            // Store writes failed; the attempt state is unknown. Count it
            // failed and leave the router in error for the next scan.
            error!(router_id = %router.id, ?err, "update pipeline lost persistence");
            let _ = routers::update_status(&state.db, router.id, RouterStatus::Error).await;
            emit_router_failed(state, job_key, router, "internal error during update");
            false
        }
    }
}

async fn update_router_inner(
    state: &AppState,
    job_key: &str,
    router: &RouterRecord,
) -> Result<bool> {
    let pool = &state.db;

    let record = history::insert_history(
        pool,
        NewHistoryRecord::started(router.id, router.current_firmware.clone()),
    )
    .await?;
    routers::update_status(pool, router.id, RouterStatus::Updating).await?;
    state.events.emit(
        UpdateEvent::new(UpdateEventType::RouterStarted, job_key)
            .with_router(router.id, &router.device_name, &router.ip_address)
            .with_firmware(router.current_firmware.clone(), None)
            .with_message("Starting firmware update"),
    );

    state.events.emit(
        UpdateEvent::new(UpdateEventType::RouterProgress, job_key)
            .with_router(router.id, &router.device_name, &router.ip_address)
            .with_status("downloading")
            .with_message("Downloading firmware image"),
    );

    let Some(target) = super::resolve_target(pool, router).await? else {
        return fail_router(state, job_key, router, record.id, ERR_NO_CREDENTIALS).await;
    };

    let already_present = state.probe.image_present(&target).await.unwrap_or(false);
    if !already_present {
        match state.probe.download_image(&target).await {
            Ok(true) => {}
            Ok(false) => {
                return fail_router(state, job_key, router, record.id, ERR_DOWNLOAD).await;
            }
            Err(err) => {
                warn!(router_id = %router.id, %err, "firmware download failed");
                return fail_router(state, job_key, router, record.id, ERR_DOWNLOAD).await;
            }
        }
    }

    match state.probe.verify_image(&target).await {
        Ok(true) => {}
        Ok(false) => {
            return fail_router(state, job_key, router, record.id, ERR_VERIFY).await;
        }
        Err(err) => {
            warn!(router_id = %router.id, %err, "firmware verification failed");
            return fail_router(state, job_key, router, record.id, ERR_VERIFY).await;
        }
    }

    // The flash severs its own session; the probe already re-reads a closed
    // connection as a successful submission.
    if let Err(err) = state.probe.apply_image(&target).await {
        let message = format!("Firmware flash failed: {err}");
        return fail_router(state, job_key, router, record.id, &message).await;
    }

    state.events.emit(
        UpdateEvent::new(UpdateEventType::RouterProgress, job_key)
            .with_router(router.id, &router.device_name, &router.ip_address)
            .with_status("rebooting")
            .with_message("Device is rebooting"),
    );

    let Some(new_version) = await_reboot(state, &target, router).await else {
        return fail_router(state, job_key, router, record.id, ERR_REBOOT_TIMEOUT).await;
    };

    history::finish_success(pool, record.id, &new_version).await?;
    routers::update_firmware_info(
        pool,
        router.id,
        Some(&new_version),
        None,
        RouterStatus::UpToDate,
    )
    .await?;
    state.events.emit(
        UpdateEvent::new(UpdateEventType::RouterCompleted, job_key)
            .with_router(router.id, &router.device_name, &router.ip_address)
            .with_firmware(router.current_firmware.clone(), Some(new_version))
            .with_message("Firmware update complete"),
    );
    telemetry::record_router_outcome("rollout", "success");
    Ok(true)
}

/// Wait for the device to come back after the flash. A poll counts as
/// success when it reads a non-null version; when the rollout recorded a
/// target version the reading must match it (an old version means the
/// device is still booting the previous image).
async fn await_reboot(
    state: &AppState,
    target: &ShellTarget,
    router: &RouterRecord,
) -> Option<String> {
    let interval = Duration::from_secs(state.rollout.reboot_poll_interval_secs);
    for _attempt in 0..state.rollout.reboot_poll_attempts {
        tokio::time::sleep(interval).await;
        if let Ok(Some(version)) = state.probe.current_version(target).await {
            match router.available_firmware.as_deref() {
                Some(expected) if version != expected => continue,
                _ => return Some(version),
            }
        }
    }
    None
}

async fn fail_router(
    state: &AppState,
    job_key: &str,
    router: &RouterRecord,
    history_id: Uuid,
    message: &str,
) -> Result<bool> {
    history::finish_failed(&state.db, history_id, message).await?;
    routers::update_status(&state.db, router.id, RouterStatus::Error).await?;
    emit_router_failed(state, job_key, router, message);
    telemetry::record_router_outcome("rollout", "failed");
    Ok(false)
}

fn emit_router_failed(state: &AppState, job_key: &str, router: &RouterRecord, error: &str) {
    state.events.emit(
        UpdateEvent::new(UpdateEventType::RouterFailed, job_key)
            .with_router(router.id, &router.device_name, &router.ip_address)
            .with_error(error),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RolloutConfig;
    use crate::persistence::{routers::NewRouter, HistoryStatus};
    use crate::test_support::{drain, test_state, test_state_with, DeviceSim, MockProbe};
    use std::time::Duration as StdDuration;

    const OLD_FW: &str = "RUT9_R_00.07.06.11";
    const NEW_FW: &str = "RUT9_R_00.07.06.20";

    async fn seed_update_candidate(state: &AppState, name: &str, ip: &str) -> RouterRecord {
        let new = NewRouter::new(name, ip);
        routers::insert_router(&state.db, new.clone())
            .await
            .expect("insert router");
        routers::update_firmware_info(
            &state.db,
            new.id,
            Some(OLD_FW),
            Some(NEW_FW),
            RouterStatus::UpdateAvailable,
        )
        .await
        .expect("firmware info");
        routers::get_router(&state.db, new.id)
            .await
            .expect("get")
            .expect("some")
    }

    fn request(router_ids: Option<Vec<Uuid>>, batch_size: u32) -> StartRollout {
        StartRollout {
            router_ids,
            batch_size,
            include_errors: false,
        }
    }

    #[tokio::test]
    async fn single_router_happy_path_emits_ordered_events() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        settings::set_global_credentials(&state.db, "admin", "secret")
            .await
            .expect("credentials");
        settings::set_batch_wait_minutes(&state.db, 0)
            .await
            .expect("wait");

        let router = seed_update_candidate(&state, "r1", "10.0.0.1").await;
        probe.script("10.0.0.1", DeviceSim::reachable(OLD_FW).flashing_to(NEW_FW));

        let mut sub = state.events.subscribe_all();
        let (job, candidates) = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect("prepare");
        run_rollout(state.clone(), job.clone(), candidates).await;

        let kinds: Vec<UpdateEventType> =
            drain(&mut sub).into_iter().map(|ev| ev.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                UpdateEventType::JobStarted,
                UpdateEventType::BatchStarted,
                UpdateEventType::RouterStarted,
                UpdateEventType::RouterProgress,
                UpdateEventType::RouterProgress,
                UpdateEventType::RouterCompleted,
                UpdateEventType::BatchCompleted,
                UpdateEventType::JobProgress,
                UpdateEventType::JobCompleted,
            ]
        );

        let after = routers::get_router(&state.db, router.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(after.status, RouterStatus::UpToDate);
        assert_eq!(after.current_firmware.as_deref(), Some(NEW_FW));
        assert!(after.available_firmware.is_none());

        let attempts = history::list_for_router(&state.db, router.id)
            .await
            .expect("history");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, HistoryStatus::Success);
        assert_eq!(attempts[0].firmware_before.as_deref(), Some(OLD_FW));
        assert_eq!(attempts[0].firmware_after.as_deref(), Some(NEW_FW));

        let finished = jobs::get_job(&state.db, job.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.completed_routers, 1);
        assert_eq!(finished.failed_routers, 0);
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn batches_pause_with_a_minute_countdown() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        settings::set_global_credentials(&state.db, "admin", "secret")
            .await
            .expect("credentials");
        settings::set_batch_wait_minutes(&state.db, 2)
            .await
            .expect("wait");

        let mut ids = Vec::new();
        for i in 0..5 {
            let ip = format!("10.0.1.{i}");
            let router = seed_update_candidate(&state, &format!("r{i}"), &ip).await;
            probe.script(&ip, DeviceSim::reachable(OLD_FW).flashing_to(NEW_FW));
            ids.push(router.id);
        }

        let mut sub = state.events.subscribe_all();
        let (job, candidates) = prepare_rollout(&state, request(Some(ids), 2))
            .await
            .expect("prepare");
        run_rollout(state.clone(), job, candidates).await;

        let events = drain(&mut sub);
        let batch_started = events
            .iter()
            .filter(|ev| ev.event_type == UpdateEventType::BatchStarted)
            .count();
        let batch_completed = events
            .iter()
            .filter(|ev| ev.event_type == UpdateEventType::BatchCompleted)
            .count();
        assert_eq!(batch_started, 3);
        assert_eq!(batch_completed, 3);

        let countdown: Vec<u32> = events
            .iter()
            .filter(|ev| ev.event_type == UpdateEventType::BatchWaiting)
            .filter_map(|ev| ev.data.wait_time_remaining)
            .collect();
        // Two inter-batch pauses, each counting 2, 1. No pause after the
        // final batch.
        assert_eq!(countdown, vec![2, 1, 2, 1]);
    }

    #[tokio::test]
    async fn single_batch_rollout_never_waits() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        settings::set_global_credentials(&state.db, "admin", "secret")
            .await
            .expect("credentials");
        settings::set_batch_wait_minutes(&state.db, 2)
            .await
            .expect("wait");

        let mut ids = Vec::new();
        for i in 0..3 {
            let ip = format!("10.0.2.{i}");
            let router = seed_update_candidate(&state, &format!("s{i}"), &ip).await;
            probe.script(&ip, DeviceSim::reachable(OLD_FW).flashing_to(NEW_FW));
            ids.push(router.id);
        }

        let mut sub = state.events.subscribe_all();
        let (job, candidates) = prepare_rollout(&state, request(Some(ids), 10))
            .await
            .expect("prepare");
        run_rollout(state.clone(), job, candidates).await;

        let events = drain(&mut sub);
        assert_eq!(
            events
                .iter()
                .filter(|ev| ev.event_type == UpdateEventType::BatchStarted)
                .count(),
            1
        );
        assert!(events
            .iter()
            .all(|ev| ev.event_type != UpdateEventType::BatchWaiting));
    }

    #[tokio::test]
    async fn cancel_during_pause_skips_the_next_batch() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state_with(
            probe.clone(),
            RolloutConfig {
                reboot_poll_attempts: 20,
                reboot_poll_interval_secs: 0,
                pause_tick_secs: 1,
            },
        )
        .await;
        settings::set_global_credentials(&state.db, "admin", "secret")
            .await
            .expect("credentials");
        settings::set_batch_wait_minutes(&state.db, 2)
            .await
            .expect("wait");

        let mut ids = Vec::new();
        for i in 0..4 {
            let ip = format!("10.0.3.{i}");
            let router = seed_update_candidate(&state, &format!("c{i}"), &ip).await;
            probe.script(&ip, DeviceSim::reachable(OLD_FW).flashing_to(NEW_FW));
            ids.push(router.id);
        }

        let mut sub = state.events.subscribe_all();
        let (job, candidates) = prepare_rollout(&state, request(Some(ids), 2))
            .await
            .expect("prepare");
        let job_id = job.id;
        let task = tokio::spawn(run_rollout(state.clone(), job, candidates));

        // Cancel as soon as the countdown starts ticking.
        loop {
            let event = tokio::time::timeout(StdDuration::from_secs(10), sub.recv())
                .await
                .expect("event before timeout")
                .expect("bus open");
            if event.event_type == UpdateEventType::BatchWaiting {
                assert!(state.rollouts.request_abort(job_id));
                break;
            }
        }
        tokio::time::timeout(StdDuration::from_secs(10), task)
            .await
            .expect("rollout exits within a tick")
            .expect("task");

        let events = drain(&mut sub);
        assert!(events
            .iter()
            .all(|ev| ev.event_type != UpdateEventType::BatchStarted));

        let finished = jobs::get_job(&state.db, job_id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(finished.status, JobStatus::Cancelled);
        // Batch 1 ran to its natural end before the cancel took effect.
        assert_eq!(finished.completed_routers, 2);
        assert_eq!(finished.failed_routers, 0);
    }

    #[tokio::test]
    async fn reboot_answered_on_final_attempt_succeeds() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state_with(
            probe.clone(),
            RolloutConfig {
                reboot_poll_attempts: 3,
                reboot_poll_interval_secs: 0,
                pause_tick_secs: 0,
            },
        )
        .await;
        settings::set_global_credentials(&state.db, "admin", "secret")
            .await
            .expect("credentials");
        settings::set_batch_wait_minutes(&state.db, 0)
            .await
            .expect("wait");

        let router = seed_update_candidate(&state, "slow", "10.0.4.1").await;
        probe.script(
            "10.0.4.1",
            DeviceSim::reachable(OLD_FW)
                .flashing_to(NEW_FW)
                .with_reboot_delay(2),
        );

        let (job, candidates) = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect("prepare");
        run_rollout(state.clone(), job, candidates).await;

        let after = routers::get_router(&state.db, router.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(after.status, RouterStatus::UpToDate);
        assert_eq!(after.current_firmware.as_deref(), Some(NEW_FW));
    }

    #[tokio::test]
    async fn reboot_never_answering_times_out_as_failure() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state_with(
            probe.clone(),
            RolloutConfig {
                reboot_poll_attempts: 3,
                reboot_poll_interval_secs: 0,
                pause_tick_secs: 0,
            },
        )
        .await;
        settings::set_global_credentials(&state.db, "admin", "secret")
            .await
            .expect("credentials");
        settings::set_batch_wait_minutes(&state.db, 0)
            .await
            .expect("wait");

        let router = seed_update_candidate(&state, "bricked", "10.0.4.2").await;
        probe.script(
            "10.0.4.2",
            DeviceSim::reachable(OLD_FW)
                .flashing_to(NEW_FW)
                .with_reboot_delay(3),
        );

        let mut sub = state.events.subscribe_all();
        let (job, candidates) = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect("prepare");
        run_rollout(state.clone(), job.clone(), candidates).await;

        let after = routers::get_router(&state.db, router.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(after.status, RouterStatus::Error);

        let attempts = history::list_for_router(&state.db, router.id)
            .await
            .expect("history");
        assert_eq!(attempts[0].status, HistoryStatus::Failed);
        assert_eq!(attempts[0].error_message.as_deref(), Some(ERR_REBOOT_TIMEOUT));

        let failure = drain(&mut sub)
            .into_iter()
            .find(|ev| ev.event_type == UpdateEventType::RouterFailed)
            .expect("router_failed event");
        assert_eq!(failure.data.error.as_deref(), Some(ERR_REBOOT_TIMEOUT));

        let finished = jobs::get_job(&state.db, job.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(finished.failed_routers, 1);
        assert_eq!(finished.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_router_after_the_downloading_stage() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        settings::set_batch_wait_minutes(&state.db, 0)
            .await
            .expect("wait");

        // No per-router and no global credentials.
        let router = seed_update_candidate(&state, "orphan", "10.0.4.4").await;
        probe.script("10.0.4.4", DeviceSim::reachable(OLD_FW).flashing_to(NEW_FW));

        let mut sub = state.events.subscribe_all();
        let (job, candidates) = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect("prepare");
        run_rollout(state.clone(), job.clone(), candidates).await;

        // The pipeline still announces the downloading stage before the
        // credential check decides the outcome.
        let kinds: Vec<UpdateEventType> = drain(&mut sub)
            .into_iter()
            .filter_map(|ev| match ev.event_type {
                UpdateEventType::RouterStarted => Some(ev.event_type),
                UpdateEventType::RouterProgress => {
                    assert_eq!(ev.data.status.as_deref(), Some("downloading"));
                    Some(ev.event_type)
                }
                UpdateEventType::RouterFailed => {
                    assert_eq!(ev.data.error.as_deref(), Some(ERR_NO_CREDENTIALS));
                    Some(ev.event_type)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                UpdateEventType::RouterStarted,
                UpdateEventType::RouterProgress,
                UpdateEventType::RouterFailed,
            ]
        );

        let after = routers::get_router(&state.db, router.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(after.status, RouterStatus::Error);

        let attempts = history::list_for_router(&state.db, router.id)
            .await
            .expect("history");
        assert_eq!(attempts[0].status, HistoryStatus::Failed);
        assert_eq!(attempts[0].error_message.as_deref(), Some(ERR_NO_CREDENTIALS));

        let finished = jobs::get_job(&state.db, job.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(finished.failed_routers, 1);
        assert_eq!(finished.completed_routers, 0);
        // The device itself was never touched.
        assert_eq!(probe.call_count("10.0.4.4"), 0);
    }

    #[tokio::test]
    async fn verify_failure_is_recorded_and_never_flashes() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        settings::set_global_credentials(&state.db, "admin", "secret")
            .await
            .expect("credentials");
        settings::set_batch_wait_minutes(&state.db, 0)
            .await
            .expect("wait");

        let router = seed_update_candidate(&state, "corrupt", "10.0.4.3").await;
        probe.script("10.0.4.3", DeviceSim::reachable(OLD_FW).failing_verify());

        let (job, candidates) = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect("prepare");
        run_rollout(state.clone(), job, candidates).await;

        let attempts = history::list_for_router(&state.db, router.id)
            .await
            .expect("history");
        assert_eq!(attempts[0].error_message.as_deref(), Some(ERR_VERIFY));
        assert!(!probe.applied("10.0.4.3"));
    }

    #[tokio::test]
    async fn second_rollout_is_rejected_while_one_is_active() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        let router = seed_update_candidate(&state, "r1", "10.0.5.1").await;

        let (job, _candidates) = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect("prepare");

        let err = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect_err("conflict");
        assert_eq!(err.code, "conflict");
        assert!(err.message.contains(&job.id.to_string()));

        // No second job row was created.
        assert_eq!(jobs::list_jobs(&state.db).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn candidate_resolution_follows_statuses_and_skips_missing_ids() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;

        let eligible = seed_update_candidate(&state, "a", "10.0.6.1").await;
        let erring = NewRouter::new("b", "10.0.6.2");
        routers::insert_router(&state.db, erring.clone()).await.expect("insert");
        routers::update_status(&state.db, erring.id, RouterStatus::Error)
            .await
            .expect("status");
        let healthy = NewRouter::new("c", "10.0.6.3");
        routers::insert_router(&state.db, healthy.clone()).await.expect("insert");
        routers::update_status(&state.db, healthy.id, RouterStatus::UpToDate)
            .await
            .expect("status");

        let (job, candidates) = prepare_rollout(
            &state,
            StartRollout {
                router_ids: None,
                batch_size: 10,
                include_errors: true,
            },
        )
        .await
        .expect("prepare");
        assert_eq!(candidates.len(), 2);
        jobs::finish_job(&state.db, job.id, JobStatus::Cancelled)
            .await
            .expect("release lock");
        state.rollouts.remove(job.id);

        let (job, candidates) = prepare_rollout(
            &state,
            StartRollout {
                router_ids: None,
                batch_size: 10,
                include_errors: false,
            },
        )
        .await
        .expect("prepare");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, eligible.id);
        jobs::finish_job(&state.db, job.id, JobStatus::Cancelled)
            .await
            .expect("release lock");
        state.rollouts.remove(job.id);

        let (_job, candidates) = prepare_rollout(
            &state,
            request(Some(vec![eligible.id, Uuid::new_v4()]), 5),
        )
        .await
        .expect("prepare");
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn empty_candidate_set_is_a_validation_error() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        let err = prepare_rollout(&state, request(None, 10))
            .await
            .expect_err("empty");
        assert_eq!(err.code, "bad_request");
    }

    #[tokio::test]
    async fn cancel_endpoint_semantics() {
        let probe = std::sync::Arc::new(MockProbe::default());
        let state = test_state(probe.clone()).await;
        let router = seed_update_candidate(&state, "r1", "10.0.7.1").await;

        let missing = cancel_rollout(&state, Uuid::new_v4()).await.expect_err("404");
        assert_eq!(missing.code, "not_found");

        let (job, candidates) = prepare_rollout(&state, request(Some(vec![router.id]), 1))
            .await
            .expect("prepare");
        let cancelled = cancel_rollout(&state, job.id).await.expect("cancel");
        assert!(state
            .rollouts
            .flag(job.id)
            .expect("flag")
            .load(Ordering::SeqCst));

        probe.script("10.0.7.1", DeviceSim::reachable(OLD_FW).flashing_to(NEW_FW));
        run_rollout(state.clone(), cancelled, candidates).await;
        let finished = jobs::get_job(&state.db, job.id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(finished.status, JobStatus::Cancelled);

        let again = cancel_rollout(&state, job.id).await.expect_err("finished");
        assert_eq!(again.code, "conflict");
    }
}

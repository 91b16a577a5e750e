//! Startup reconciliation of state orphaned by a process crash or restart.
//!
//! Abort flags and running pipelines are in-process state. After a restart
//! any job still marked active cannot resume, any router still marked
//! `updating` has no lease holder, and any `running` history row records an
//! attempt nobody is driving.

use tracing::info;

use crate::persistence::{history, jobs, routers, Db};
use crate::Result;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub cancelled_jobs: u64,
    pub reset_routers: u64,
    pub failed_attempts: u64,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.cancelled_jobs == 0 && self.reset_routers == 0 && self.failed_attempts == 0
    }
}

pub async fn reconcile_on_startup(pool: &Db) -> Result<RecoveryReport> {
    let report = RecoveryReport {
        cancelled_jobs: jobs::cancel_active_jobs(pool).await?,
        reset_routers: routers::reset_updating_to_error(pool).await?,
        failed_attempts: history::fail_running(pool, "process restarted").await?,
    };

    if !report.is_clean() {
        info!(
            cancelled_jobs = report.cancelled_jobs,
            reset_routers = report.reset_routers,
            failed_attempts = report.failed_attempts,
            "reconciled state left over from a previous process"
        );
    }

    Ok(report)
}

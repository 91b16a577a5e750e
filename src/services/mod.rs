use crate::persistence::{self as db, settings, RouterRecord};
use crate::ssh::ShellTarget;
use crate::Result;

pub mod recovery;
pub mod rollout;
pub mod scan;

/// Resolve the credentials to reach one router: a complete per-device pair
/// wins, otherwise the global pair from settings, otherwise nothing.
pub(crate) async fn resolve_target(
    pool: &db::Db,
    router: &RouterRecord,
) -> Result<Option<ShellTarget>> {
    if let (Some(user), Some(pass)) = (&router.username, &router.password) {
        if !user.is_empty() && !pass.is_empty() {
            return Ok(Some(ShellTarget::new(
                router.ip_address.clone(),
                user.clone(),
                pass.clone(),
            )));
        }
    }
    match settings::global_credentials(pool).await? {
        Some((user, pass)) => Ok(Some(ShellTarget::new(router.ip_address.clone(), user, pass))),
        None => Ok(None),
    }
}

pub(crate) fn percent_complete(done: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round() as u32
}

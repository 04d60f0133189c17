//! Bulk unlock: one password swept across every volume that is still locked.

use crate::error::UnlockResult;
use crate::provider::{AttemptOutcome, VolumeProvider};
use log::{debug, info};

/// Apply `password` to every locked volume and return how many it opened.
///
/// Volumes already reported unlocked are never attempted. The sweep stops at
/// the first provider error; volumes opened before that stay open, since each
/// attempt is committed by the backend as it happens.
pub fn apply_password<P>(provider: &P, password: &str) -> UnlockResult<usize>
where
    P: VolumeProvider + ?Sized,
{
    let volumes = provider.list_volumes()?;
    let mut unlocked = 0;

    for (volume, state) in &volumes {
        if !state.is_locked() {
            continue;
        }

        match provider.attempt_password(volume, password)? {
            AttemptOutcome::Unlocked => {
                info!("unlocked volume {volume}");
                unlocked += 1;
            }
            AttemptOutcome::WrongPassword => debug!("password rejected by {volume}"),
            AttemptOutcome::AlreadyUnlocked => debug!("{volume} was unlocked concurrently"),
        }
    }

    Ok(unlocked)
}

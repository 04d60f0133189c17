use crate::error::UnlockResult;
use std::collections::BTreeMap;

/// Lock state of a single encrypted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

impl LockState {
    pub fn is_locked(self) -> bool {
        matches!(self, LockState::Locked)
    }
}

/// Snapshot of every protected volume, keyed (and therefore ordered) by name.
pub type VolumeSet = BTreeMap<String, LockState>;

/// What a single password attempt did to one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The password was accepted and the volume is now unlocked.
    Unlocked,
    /// The password was well-formed but does not open this volume.
    WrongPassword,
    /// The volume had already been unlocked by someone else; nothing changed.
    AlreadyUnlocked,
}

/// Backend that knows how to list, unlock and release encrypted volumes.
///
/// Implementations must tolerate concurrent calls from several sessions and
/// decide on their own which backend failures mean "wrong password".
pub trait VolumeProvider: Send + Sync {
    /// Current locked/unlocked state of every protected volume.
    fn list_volumes(&self) -> UnlockResult<VolumeSet>;

    /// Try `password` against `volume`. Errors are reserved for operational
    /// failures; a rejected password is `Ok(AttemptOutcome::WrongPassword)`
    /// and leaves the volume locked.
    fn attempt_password(&self, volume: &str, password: &str) -> UnlockResult<AttemptOutcome>;

    /// Let the host carry on booting. Called once, after every volume is unlocked.
    fn resume_boot(&self) -> UnlockResult<()>;
}

/// Number of locked volumes in a snapshot.
pub fn count_locked(volumes: &VolumeSet) -> usize {
    volumes.values().filter(|state| state.is_locked()).count()
}

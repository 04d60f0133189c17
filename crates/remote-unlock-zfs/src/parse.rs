//! Turns `zfs get -H` output into data the provider can reason about.

use remote_unlock_core::error::{UnlockError, UnlockResult};
use remote_unlock_core::provider::{LockState, VolumeSet};
use std::collections::BTreeSet;

/// Split one `-H -o name,value` line into its name and value.
fn parse_pair_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (name, value) = match trimmed.split_once('\t') {
        Some((left, right)) => (left.trim(), right.trim()),
        None => {
            let mut parts = trimmed.split_whitespace();
            (parts.next()?, parts.next()?)
        }
    };
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// Distinct encryption roots from `zfs get encryptionroot -H -o value`.
///
/// Unencrypted datasets report `-` and are skipped.
pub(crate) fn parse_encryption_roots(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "-")
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Map a `keystatus` value for an encryption root.
pub(crate) fn parse_keystatus(name: &str, value: &str) -> UnlockResult<LockState> {
    match value {
        "available" => Ok(LockState::Unlocked),
        "unavailable" => Ok(LockState::Locked),
        other => Err(UnlockError::Provider(format!(
            "zfs get keystatus returned unexpected value: {name} = {other}"
        ))),
    }
}

/// Build the volume set from `zfs get keystatus -H -o name,value` output.
pub(crate) fn parse_keystatuses(output: &str) -> UnlockResult<VolumeSet> {
    let mut volumes = VolumeSet::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let (name, value) = parse_pair_line(line).ok_or_else(|| {
            UnlockError::Provider(format!("malformed keystatus line: {line:?}"))
        })?;
        let state = parse_keystatus(&name, &value)?;
        volumes.insert(name, state);
    }
    Ok(volumes)
}

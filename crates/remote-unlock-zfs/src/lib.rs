//! ZFS-backed volume provider. `system` implements the provider trait on top
//! of the `zfs`, `zpool` and `killall` binaries; `command` and `parse` cover
//! the shell integration details.

mod command;
mod parse;
mod system;

pub use system::{SystemZfsProvider, DEFAULT_KILLALL_PATHS, DEFAULT_ZFS_PATHS, DEFAULT_ZPOOL_PATHS};

//! System-backed `VolumeProvider`. It shells out to the platform binaries,
//! treats every encryption root as one volume, and classifies `load-key`
//! failures into wrong passwords and real errors.

use crate::command::CommandRunner;
use crate::parse::{parse_encryption_roots, parse_keystatuses};
use log::{debug, info, warn};
use regex::Regex;
use remote_unlock_core::config::RemoteUnlockConfig;
use remote_unlock_core::error::{UnlockError, UnlockResult};
use remote_unlock_core::provider::{AttemptOutcome, VolumeProvider, VolumeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Default locations probed for a `zfs` binary.
pub const DEFAULT_ZFS_PATHS: &[&str] = &[
    "/sbin/zfs",
    "/usr/sbin/zfs",
    "/usr/local/sbin/zfs",
    "/bin/zfs",
];

/// Default locations probed for a `zpool` binary.
pub const DEFAULT_ZPOOL_PATHS: &[&str] = &[
    "/sbin/zpool",
    "/usr/sbin/zpool",
    "/usr/local/sbin/zpool",
    "/bin/zpool",
];

/// Default locations probed for a `killall` binary.
pub const DEFAULT_KILLALL_PATHS: &[&str] = &[
    "/usr/bin/killall",
    "/bin/killall",
    "/usr/sbin/killall",
    "/sbin/killall",
];

/// libzfs messages for a passphrase that does not open the key.
const WRONG_KEY_PATTERN: &str =
    r"^Key load error: (Passphrase too |Incorrect key provided for )";

const ALREADY_LOADED: &str = "Key already loaded";

/// `VolumeProvider` over the native `zfs`, `zpool` and `killall` CLIs.
#[derive(Debug, Clone)]
pub struct SystemZfsProvider {
    zfs: CommandRunner,
    zpool: CommandRunner,
    killall: CommandRunner,
    kill_processes: Vec<String>,
    wrong_key: Regex,
}

impl SystemZfsProvider {
    /// Build a provider from the configuration, discovering unset binaries.
    pub fn from_config(config: &RemoteUnlockConfig) -> UnlockResult<Self> {
        let timeout = config.zfs_timeout();
        let zfs = CommandRunner::resolve(
            "zfs",
            config.zfs.zfs_path.as_deref(),
            DEFAULT_ZFS_PATHS,
            timeout,
        )?;
        let zpool = CommandRunner::resolve(
            "zpool",
            config.zfs.zpool_path.as_deref(),
            DEFAULT_ZPOOL_PATHS,
            timeout,
        )?;
        let killall = CommandRunner::resolve(
            "killall",
            config.boot.killall_path.as_deref(),
            DEFAULT_KILLALL_PATHS,
            timeout,
        )?;
        Self::assemble(zfs, zpool, killall, config.boot.kill_processes.clone())
    }

    /// Construct a provider with explicit binaries.
    pub fn with_paths(
        zfs_path: PathBuf,
        zpool_path: PathBuf,
        killall_path: PathBuf,
        kill_processes: Vec<String>,
        timeout: Duration,
    ) -> UnlockResult<Self> {
        Self::assemble(
            CommandRunner::with_path(zfs_path, timeout)?,
            CommandRunner::with_path(zpool_path, timeout)?,
            CommandRunner::with_path(killall_path, timeout)?,
            kill_processes,
        )
    }

    fn assemble(
        zfs: CommandRunner,
        zpool: CommandRunner,
        killall: CommandRunner,
        kill_processes: Vec<String>,
    ) -> UnlockResult<Self> {
        if kill_processes.is_empty() {
            return Err(UnlockError::InvalidConfig(
                "at least one process to kill on resume is required".into(),
            ));
        }
        let wrong_key = Regex::new(WRONG_KEY_PATTERN)
            .map_err(|err| UnlockError::Provider(format!("invalid wrong-key pattern: {err}")))?;
        Ok(Self {
            zfs,
            zpool,
            killall,
            kill_processes,
            wrong_key,
        })
    }

    /// Check that `zfs version` and `zpool version` work, i.e. that the kernel
    /// module is loaded. Without it nothing else can succeed.
    pub fn probe(&self) -> UnlockResult<()> {
        for runner in [&self.zfs, &self.zpool] {
            let out = runner.run_checked(&["version"])?;
            debug!(
                "{} version: {}",
                runner.binary().display(),
                out.stdout.lines().next().unwrap_or_default()
            );
        }
        Ok(())
    }

    fn encryption_roots(&self) -> UnlockResult<Vec<String>> {
        let out = self
            .zfs
            .run_checked(&["get", "encryptionroot", "-H", "-o", "value"])?;
        Ok(parse_encryption_roots(&out.stdout))
    }

    fn is_wrong_key(&self, diagnostic: &str) -> bool {
        self.wrong_key.is_match(diagnostic)
    }
}

impl VolumeProvider for SystemZfsProvider {
    fn list_volumes(&self) -> UnlockResult<VolumeSet> {
        let roots = self.encryption_roots()?;
        if roots.is_empty() {
            return Ok(VolumeSet::new());
        }

        let mut args = vec!["get", "keystatus", "-H", "-o", "name,value"];
        args.extend(roots.iter().map(String::as_str));
        let out = self.zfs.run_checked(&args)?;
        parse_keystatuses(&out.stdout)
    }

    fn attempt_password(&self, volume: &str, password: &str) -> UnlockResult<AttemptOutcome> {
        let args = ["load-key", "-L", "prompt", volume];
        let out = self.zfs.run(&args, Some(password.as_bytes()))?;
        if out.success() {
            return Ok(AttemptOutcome::Unlocked);
        }

        let diagnostic = out.diagnostic();
        if self.is_wrong_key(diagnostic) {
            debug!("wrong password for {volume}");
            return Ok(AttemptOutcome::WrongPassword);
        }
        if diagnostic.contains(ALREADY_LOADED) {
            debug!("key for {volume} already loaded");
            return Ok(AttemptOutcome::AlreadyUnlocked);
        }
        warn!("load-key {volume} failed: {diagnostic}");
        Err(UnlockError::Provider(if diagnostic.is_empty() {
            format!("zfs load-key {volume} exited with code {}", out.status)
        } else {
            diagnostic.to_string()
        }))
    }

    fn resume_boot(&self) -> UnlockResult<()> {
        let args: Vec<&str> = self.kill_processes.iter().map(String::as_str).collect();
        info!("resuming boot: killall {}", args.join(" "));
        self.killall.run_checked(&args)?;
        Ok(())
    }
}

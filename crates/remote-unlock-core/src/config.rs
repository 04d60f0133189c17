use crate::error::{UnlockError, UnlockResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding the daemon's configuration and key material.
pub const CONFIG_DIR: &str = "/etc/remote-unlock";

/// Location of the configuration file when none is supplied.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/remote-unlock/config.toml";

/// Where the SSH session server listens and how it authenticates.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServerCfg {
    /// Socket address on the overlay network interface, e.g. `100.64.0.7:22`.
    pub listen: String,

    #[serde(default = "default_host_keys")]
    pub host_keys: Vec<PathBuf>,

    /// OpenSSH `authorized_keys` file. Without it any client that can reach
    /// the listener may open a session.
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,

    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
}

fn default_host_keys() -> Vec<PathBuf> {
    vec![
        Path::new(CONFIG_DIR).join("ssh_host_ed25519_key"),
        Path::new(CONFIG_DIR).join("ssh_host_rsa_key"),
    ]
}

fn default_inactivity_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ZfsCfg {
    #[serde(default)]
    pub zfs_path: Option<PathBuf>,

    #[serde(default)]
    pub zpool_path: Option<PathBuf>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ZfsCfg {
    fn default() -> Self {
        Self {
            zfs_path: None,
            zpool_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// How the host is told to carry on booting once every volume is unlocked.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BootCfg {
    #[serde(default)]
    pub killall_path: Option<PathBuf>,

    /// Processes blocking the boot on a passphrase prompt.
    #[serde(default = "default_kill_processes")]
    pub kill_processes: Vec<String>,
}

fn default_kill_processes() -> Vec<String> {
    vec!["systemd-ask-password".to_string(), "zfs".to_string()]
}

impl Default for BootCfg {
    fn default() -> Self {
        Self {
            killall_path: None,
            kill_processes: default_kill_processes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RemoteUnlockConfig {
    pub server: ServerCfg,

    #[serde(default)]
    pub zfs: ZfsCfg,

    #[serde(default)]
    pub boot: BootCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl RemoteUnlockConfig {
    /// Read a TOML (by extension) or YAML config file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> UnlockResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> UnlockResult<()> {
        self.listen_addr()?;

        if self.server.host_keys.is_empty() {
            return Err(UnlockError::InvalidConfig(
                "server.host_keys must list at least one key".to_string(),
            ));
        }

        if self.zfs.timeout_secs == 0 {
            return Err(UnlockError::InvalidConfig(
                "zfs.timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.boot.kill_processes.is_empty() {
            return Err(UnlockError::InvalidConfig(
                "boot.kill_processes must name at least one process".to_string(),
            ));
        }
        if self.boot.kill_processes.iter().any(|p| p.trim().is_empty()) {
            return Err(UnlockError::InvalidConfig(
                "boot.kill_processes must not contain blank names".to_string(),
            ));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> UnlockResult<SocketAddr> {
        self.server.listen.parse().map_err(|err| {
            UnlockError::InvalidConfig(format!(
                "server.listen `{}` is not a socket address: {}",
                self.server.listen, err
            ))
        })
    }

    pub fn zfs_timeout(&self) -> Duration {
        Duration::from_secs(self.zfs.timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        match self.server.inactivity_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

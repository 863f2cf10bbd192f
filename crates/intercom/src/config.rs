use crate::paths::IntercomPaths;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Argon2id cost parameters for new vaults. Existing vaults keep the parameters they were
/// created with (see the `vault_kdf` storage record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        // argon2 0.5 defaults, frozen here so upgrades don't silently change them.
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lock the vault after this many seconds without a request. `0` disables auto-lock.
    pub auto_lock_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_lock_seconds: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Idle timeout passed to a daemon spawned on demand by a client.
    pub spawn_idle_exit_seconds: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            spawn_idle_exit_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntercomConfig {
    pub session: SessionConfig,
    pub kdf: KdfConfig,
    pub daemon: DaemonConfig,
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn apply_env_overrides(cfg: &mut IntercomConfig) {
    if let Some(n) = env_u64("INTERCOM_AUTO_LOCK_SECONDS") {
        cfg.session.auto_lock_seconds = n;
    }
    if let Some(n) = env_u64("INTERCOM_DAEMON_IDLE_EXIT_SECONDS") {
        cfg.daemon.spawn_idle_exit_seconds = n;
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &IntercomPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<IntercomConfig> {
        let mut cfg = match crate::fsutil::read_private(&self.path)? {
            Some(bytes) => {
                let s = String::from_utf8(bytes).context("config.toml is not utf-8")?;
                toml::from_str(&s).context("parse config.toml")?
            }
            None => {
                let cfg = IntercomConfig::default();
                self.save(&cfg)?;
                cfg
            }
        };
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &IntercomConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_atomic_private(&self.path, s.as_bytes())
            .context("write config.toml")
    }
}

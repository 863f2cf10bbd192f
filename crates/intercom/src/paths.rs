use base64::Engine as _;
use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use rand::Rng as _;
use std::path::PathBuf;

/// Filesystem locations shared by the daemon and its clients.
#[derive(Debug, Clone)]
pub struct IntercomPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl IntercomPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("INTERCOM_DATA_DIR"),
            std::env::var("INTERCOM_CONFIG_DIR"),
        ) {
            return Ok(Self::from_dirs(
                PathBuf::from(config_dir),
                PathBuf::from(data_dir),
            ));
        }

        let proj =
            ProjectDirs::from("", "", "intercom").context("failed to resolve project dirs")?;
        Ok(Self::from_dirs(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    pub fn from_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let log_file = data_dir.join("intercom.log.jsonl");
        Self {
            config_dir,
            data_dir,
            log_file,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn auth_token_path(&self) -> PathBuf {
        self.config_dir.join("daemon_auth_token.txt")
    }

    pub fn storage_file(&self) -> PathBuf {
        self.data_dir.join("storage.json")
    }

    pub fn daemon_lock_path(&self) -> PathBuf {
        self.data_dir.join("intercom-daemon.lock")
    }

    #[cfg(unix)]
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("intercom.sock")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        Ok(())
    }

    /// Read the daemon auth token, creating it on first use.
    ///
    /// Several clients may race here on a cold start; whoever publishes first wins and the
    /// rest read that token.
    pub fn ensure_auth_token(&self) -> eyre::Result<String> {
        self.ensure_private_dirs()?;
        let p = self.auth_token_path();

        for _ in 0_usize..5_usize {
            if let Some(bytes) = crate::fsutil::read_private(&p)? {
                let tok = String::from_utf8(bytes)
                    .with_context(|| format!("auth token at {} is not utf-8", p.display()))?
                    .trim()
                    .to_owned();
                if !tok.is_empty() {
                    return Ok(tok);
                }
                // Left behind by a process killed mid-create.
                drop(std::fs::remove_file(&p));
                continue;
            }

            let mut bytes = [0_u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            let tok = base64::engine::general_purpose::STANDARD.encode(bytes);
            if crate::fsutil::publish_new_private(&p, format!("{tok}\n").as_bytes())? {
                return Ok(tok);
            }
        }

        eyre::bail!("failed to create/read auth token file: {}", p.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_is_stable_across_calls() -> eyre::Result<()> {
        let cfg = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let paths = IntercomPaths::from_dirs(cfg.path().to_path_buf(), data.path().to_path_buf());
        let a = paths.ensure_auth_token()?;
        let b = paths.ensure_auth_token()?;
        assert!(!a.is_empty());
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn empty_token_file_is_regenerated() -> eyre::Result<()> {
        let cfg = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let paths = IntercomPaths::from_dirs(cfg.path().to_path_buf(), data.path().to_path_buf());
        std::fs::write(paths.auth_token_path(), "")?;
        let tok = paths.ensure_auth_token()?;
        assert!(!tok.is_empty());
        Ok(())
    }
}

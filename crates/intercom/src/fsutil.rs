use eyre::Context as _;
use rand::Rng as _;
use std::{
    fs::{self, File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

fn is_symlink(p: &Path) -> eyre::Result<bool> {
    let md = fs::symlink_metadata(p).with_context(|| format!("stat {}", p.display()))?;
    Ok(md.file_type().is_symlink())
}

fn refuse_symlink(p: &Path) -> eyre::Result<()> {
    if p.exists() && is_symlink(p)? {
        eyre::bail!("refusing to use symlink: {}", p.display());
    }
    Ok(())
}

/// Create `dir` if missing and clamp it to owner-only access.
pub fn ensure_private_dir(dir: &Path) -> eyre::Result<()> {
    refuse_symlink(dir)?;
    if dir.exists() {
        if !fs::metadata(dir)
            .with_context(|| format!("stat {}", dir.display()))?
            .is_dir()
        {
            eyre::bail!("expected directory at {}", dir.display());
        }
    } else {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }

    #[cfg(unix)]
    {
        let mode = fs::metadata(dir)
            .with_context(|| format!("stat {}", dir.display()))?
            .permissions()
            .mode();
        if (mode & 0o077) != 0 {
            fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))
                .with_context(|| format!("chmod {MODE_DIR_PRIVATE:o} {}", dir.display()))?;
        }
    }

    Ok(())
}

fn private_options() -> OpenOptions {
    let mut oo = OpenOptions::new();
    #[cfg(unix)]
    {
        oo.mode(MODE_FILE_PRIVATE);
    }
    oo
}

/// Write `bytes` to a fresh hidden sibling of `path` and fsync it. The caller decides how
/// to move it into place.
fn write_temp_sibling(path: &Path, bytes: &[u8]) -> eyre::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    ensure_private_dir(parent)?;

    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let mut rand_bytes = [0_u8; 8];
    rand::rng().fill_bytes(&mut rand_bytes);
    let tmp = parent.join(format!(".{base}.tmp.{}", hex::encode(rand_bytes)));

    let mut f = private_options()
        .create_new(true)
        .write(true)
        .open(&tmp)
        .with_context(|| format!("open temp {}", tmp.display()))?;
    f.write_all(bytes)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    Ok(tmp)
}

/// Replace `path` atomically with `bytes` (owner-only permissions).
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> eyre::Result<()> {
    refuse_symlink(path)?;
    let tmp = write_temp_sibling(path, bytes)?;

    // Windows refuses to rename over an existing file.
    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove existing {}", path.display()))?;
        }
    }

    if let Err(e) = fs::rename(&tmp, path) {
        drop(fs::remove_file(&tmp));
        return Err(eyre::Report::new(e).wrap_err(format!(
            "rename {} -> {}",
            tmp.display(),
            path.display()
        )));
    }
    Ok(())
}

/// Publish `bytes` at `path` only if nothing exists there yet.
///
/// Returns `false` when another writer got there first. Readers never observe a
/// partially written file.
pub fn publish_new_private(path: &Path, bytes: &[u8]) -> eyre::Result<bool> {
    let tmp = write_temp_sibling(path, bytes)?;
    let linked = fs::hard_link(&tmp, path);
    drop(fs::remove_file(&tmp));
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(eyre::Report::new(e).wrap_err(format!("publish {}", path.display()))),
    }
}

/// Read a file, returning `None` when it does not exist. Symlinks are rejected.
pub fn read_private(path: &Path) -> eyre::Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    refuse_symlink(path)?;
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(bytes))
}

/// Open (creating if needed) a private file meant to be held as an advisory lock.
pub fn open_lock_file(path: &Path) -> eyre::Result<File> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    private_options()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock file at {}", path.display()))
}

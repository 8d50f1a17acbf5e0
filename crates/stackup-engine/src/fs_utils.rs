use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Removes whatever lives at `path`: file, symlink or directory tree.
pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat path: {}", path.display()))
        }
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory: {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed to remove file: {}", path.display()))
    }
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stackup".to_string());
    path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()))
}

fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let dir = fs::File::open(parent)
            .with_context(|| format!("failed to open directory: {}", parent.display()))?;
        dir.sync_all()
            .with_context(|| format!("failed to sync directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Writes `bytes` to a sibling temp file, fsyncs it and renames it over `path`, so
/// readers only ever see the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp = sibling_tmp_path(path);
    let result = (|| -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp)
            .with_context(|| format!("failed to open temp file: {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write temp file: {}", tmp.display()))?;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode on temp file: {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file: {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| {
            format!(
                "failed to move temp file into place: {} -> {}",
                tmp.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = remove_file_if_exists(&tmp);
    }
    result?;
    sync_parent_dir(path)
}

/// Copies `src` over `dst` through a sibling temp file and rename.
pub fn copy_file_atomic(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if fs::symlink_metadata(dst).is_ok_and(|metadata| metadata.is_dir()) {
        fs::remove_dir_all(dst)
            .with_context(|| format!("failed to replace directory: {}", dst.display()))?;
    }

    let tmp = sibling_tmp_path(dst);
    let result = (|| -> Result<()> {
        fs::copy(src, &tmp).with_context(|| {
            format!("failed to copy {} -> {}", src.display(), tmp.display())
        })?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&tmp)
            .with_context(|| format!("failed to open temp file: {}", tmp.display()))?;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode on temp file: {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file: {}", tmp.display()))?;
        fs::rename(&tmp, dst).with_context(|| {
            format!(
                "failed to move temp file into place: {} -> {}",
                tmp.display(),
                dst.display()
            )
        })
    })();

    if result.is_err() {
        let _ = remove_file_if_exists(&tmp);
    }
    result
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat source path: {}", src.display()))?;

    if metadata.is_dir() {
        fs::create_dir_all(dst)
            .with_context(|| format!("failed to create directory: {}", dst.display()))?;
        for entry in
            fs::read_dir(src).with_context(|| format!("failed to read directory: {}", src.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to iterate directory: {}", src.display()))?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("failed to read symlink: {}", src.display()))?;
        remove_path_if_exists(dst)?;
        std::os::unix::fs::symlink(&target, dst).with_context(|| {
            format!(
                "failed to copy symlink {} -> {}",
                src.display(),
                dst.display()
            )
        })?;
        return Ok(());
    }

    copy_file_atomic(src, dst, metadata.permissions().mode() & 0o7777)
}

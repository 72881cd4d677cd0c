use std::{
    ffi::OsString,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::warn;

/// Replaces the content of `path` with `contents` so that readers observe either the old or the
/// new file, never a partially written one. Data goes into a hidden sibling first, is synced and
/// then renamed over the target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), io::Error> {
    let temp = temp_sibling(path);

    let result = async {
        let mut file = File::create(&temp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp).await {
            warn!("Failed to clean up {temp:?} {e}");
        }
    }
    result
}

/// Creates `path` with `contents`, failing with [io::ErrorKind::AlreadyExists] if it's already
/// there. The existence check and the creation are a single filesystem operation.
pub async fn create_exclusive(path: &Path, contents: &[u8]) -> Result<(), io::Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let written = async {
        file.write_all(contents).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        drop(file);
        if let Err(remove) = fs::remove_file(path).await {
            warn!("Failed to remove half created {path:?} {remove}");
        }
        return Err(e);
    }
    Ok(())
}

/// Overwrites a file from the start without truncating it first. When `contents` is as long as
/// the previous data an interrupted write can only leave a mix of old and new bytes, never an
/// empty file.
pub async fn overwrite_in_place(file: &mut File, contents: &[u8]) -> Result<(), io::Error> {
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(contents).await?;
    file.set_len(contents.len() as u64).await?;
    file.sync_data().await
}

/// Whether `path` still names the file behind `file`. False once the path was removed or
/// replaced by another file.
#[cfg(unix)]
pub async fn is_same_file(file: &File, path: &Path) -> Result<bool, io::Error> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata().await?;
    match fs::metadata(path).await {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
pub async fn is_same_file(_file: &File, path: &Path) -> Result<bool, io::Error> {
    fs::try_exists(path).await
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

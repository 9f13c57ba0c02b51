use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::Result;
use crate::errstate;

/// Length of a sidecar file name in ASCII characters.
pub const NAME_SIZE: usize = 32;

/// Upper bound on the whole data image, 256 MiB.
pub const DATA_SIZE_LIMIT: usize = 1 << 28;

/// Returns the OS page size.
#[cfg(unix)]
pub fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

/// Buffers double until they pass this size, then grow linearly by it.
pub fn double_limit() -> usize {
    (page_size() << 1).max(1 << 14)
}

/// Spare capacity beyond this is given back to the file system.
pub fn truncate_threshold() -> usize {
    double_limit() << 1
}

/// Grows `capacity` until it covers `required`: doubling below the limit,
/// then in fixed increments of the limit.
pub fn new_capacity(capacity: usize, required: usize) -> Result<usize> {
    if required >= DATA_SIZE_LIMIT {
        return errstate!("data size out of limit");
    }
    let page = page_size();
    if required <= page {
        return Ok(page);
    }
    let limit = double_limit();
    let mut capacity = capacity.max(page);
    while capacity < required {
        if capacity <= limit {
            capacity <<= 1;
        } else {
            capacity += limit;
        }
    }
    Ok(capacity)
}

/// Generates a random sidecar file name of [NAME_SIZE] ASCII characters.
pub fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SIZE)
        .map(char::from)
        .collect()
}

/// Writes `bytes` to `path` and syncs, creating parent directories as needed.
pub fn save_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Reads a sidecar file, or None if it does not exist.
pub fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Deletes a file, ignoring a missing one.
pub fn delete_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Moves every regular file in `src` into `dst`, replacing same-named files.
pub fn move_dir_files(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        if from.is_file() {
            let to = dst.join(entry.file_name());
            fs::rename(&from, &to)?;
        }
    }
    Ok(())
}

/// Recursively deletes a directory, ignoring a missing one.
pub fn delete_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

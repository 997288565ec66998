//! Replace-by-rename writes for small files other processes may read.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use rand::TryRngCore;

/// Attempts at finding an unused temp name before giving up.
const TEMP_NAME_ATTEMPTS: usize = 5;

/// Write `data` to `path` so readers see either the old or the new contents.
///
/// The bytes go to a randomly named sibling first, are synced, and then
/// renamed over `path`. The parent directory must exist. On failure the temp
/// file is removed and `path` is untouched.
pub(crate) fn write(path: &Path, data: &[u8]) -> io::Result<()> {
    let (dir, name) = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => (dir, name.to_string_lossy()),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file path", path.display()),
            ));
        }
    };

    for _ in 0..TEMP_NAME_ATTEMPTS {
        let temp = dir.join(format!("{name}.tmp-{}", random_suffix()?));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&temp) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        };
        let written = file.write_all(data).and_then(|()| file.sync_all());
        drop(file);
        if let Err(err) = written.and_then(|()| rename_over(&temp, path)) {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free temporary name next to {}", path.display()),
    ))
}

fn random_suffix() -> io::Result<String> {
    let mut bytes = [0u8; 6];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| io::Error::other(format!("no randomness for temp file name: {err}")))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

/// `rename`, retried once after removing the target where the platform
/// refuses to replace an existing file.
fn rename_over(temp: &Path, path: &Path) -> io::Result<()> {
    match fs::rename(temp, path) {
        Ok(()) => Ok(()),
        Err(err) if cfg!(windows) && replace_refused(&err) => {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(inner) if inner.kind() == io::ErrorKind::NotFound => {}
                Err(inner) => return Err(inner),
            }
            fs::rename(temp, path)
        }
        Err(err) => Err(err),
    }
}

fn replace_refused(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AlreadyExists | io::ErrorKind::PermissionDenied
    )
}

/// Temp files a crashed writer may have left next to `path`.
#[cfg(test)]
pub(crate) fn leftover_temps(path: &Path) -> Vec<std::path::PathBuf> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Vec::new();
    };
    let prefix = format!("{}.tmp-", name.to_string_lossy());
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|p| {
                    p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
                })
                .collect()
        })
        .unwrap_or_default()
}

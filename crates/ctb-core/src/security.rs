use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use crate::{errors::Error, Result};

// ============== Group folder policy ==============

/// Validates a group's working-folder path: non-empty, relative, no `..`
/// segments, no leading `/`, and must resolve inside `workspace_root`.
pub fn validate_group_folder(workspace_root: &Path, folder: &str) -> Result<PathBuf> {
    if folder.trim().is_empty() {
        return Err(invalid_folder(folder, "must not be empty"));
    }
    if folder.starts_with('/') {
        return Err(invalid_folder(folder, "must be relative"));
    }

    let rel = Path::new(folder);
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return Err(invalid_folder(folder, "must not contain `..` segments")),
        }
    }

    let joined = workspace_root.join(rel);
    let resolved = canonicalize_or_resolve(&joined)?;
    let root_resolved = canonicalize_or_resolve(workspace_root)?;

    if resolved != root_resolved && !resolved.starts_with(&root_resolved) {
        return Err(invalid_folder(folder, "resolves outside workspace root"));
    }

    Ok(resolved)
}

fn invalid_folder(folder: &str, reason: &str) -> Error {
    Error::InvalidGroupFolder {
        folder: folder.to_string(),
        reason: reason.to_string(),
    }
}

fn canonicalize_or_resolve(p: &Path) -> Result<PathBuf> {
    if let Ok(canon) = fs::canonicalize(p) {
        return Ok(canon);
    }

    let resolved = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().map_err(Error::Io)?.join(p)
    };

    Ok(normalize_path(&resolved))
}

fn normalize_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ============== Singleton lock ==============

/// A PID-file based singleton lock. Held for the process lifetime; dropping
/// it removes the lock file.
pub struct SingletonLock {
    path: PathBuf,
}

impl SingletonLock {
    /// Acquires the lock at `path`, creating it if absent. If a lock file
    /// already exists, the holder's PID is probed for liveness: a live
    /// holder is a fatal conflict, a dead holder's lock is reclaimed.
    pub fn acquire(path: &Path) -> Result<Self> {
        match try_create_exclusive(path) {
            Ok(()) => return Ok(Self { path: path.to_path_buf() }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::Io(e)),
        }

        let existing = fs::read_to_string(path).unwrap_or_default();
        let existing_pid: Option<i32> = existing.trim().parse().ok();

        if let Some(pid) = existing_pid {
            if pid_is_alive(pid) {
                return Err(Error::SingletonLockHeld { pid });
            }
        }

        // Holder is dead (or the file was unreadable/corrupt): reclaim.
        fs::write(path, std::process::id().to_string())?;
        Ok(Self { path: path.to_path_buf() })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn try_create_exclusive(path: &Path) -> std::io::Result<()> {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    f.write_all(std::process::id().to_string().as_bytes())?;
    Ok(())
}

fn pid_is_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

//! Per-process and per-copy pidfiles.
//!
//! The copy worker takes `{pidfile}.copy.{table}` so the main worker can
//! observe it and a restarted copy can wait for a stale one to clear.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

/// Check whether the process named in a pidfile is still alive.
///
/// Returns `false` for a missing or unreadable file.  A stale file whose
/// process is gone is removed on the way out.
pub fn pidfile_alive(path: &Path) -> bool {
    let pid = match fs::read_to_string(path) {
        Ok(body) => match body.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => pid,
            _ => return false,
        },
        Err(_) => return false,
    };

    // signal 0 probes existence without delivering anything
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    let errno = io::Error::last_os_error().raw_os_error();
    if errno == Some(libc::EPERM) {
        return true;
    }
    let _ = fs::remove_file(path);
    false
}

/// Block until the pidfile at `path` is gone or its process has exited.
pub fn wait_for_pidfile(path: &Path, poll: Duration) {
    while pidfile_alive(path) {
        warn!(pidfile = %path.display(), "waiting for existing process to exit");
        std::thread::sleep(poll);
    }
}

/// Pidfile owned by this process, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current pid.  Fails if a live process already holds the
    /// file.
    pub fn take(path: PathBuf) -> io::Result<PidFile> {
        if pidfile_alive(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("pidfile busy: {}", path.display()),
            ));
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(PidFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Pidfile path for one table's copy process.
pub fn copy_pidfile(base: &Path, table_name: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".copy.{table_name}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");

        let pf = PidFile::take(path.clone()).unwrap();
        assert!(pidfile_alive(&path), "own pid counts as alive");
        assert!(PidFile::take(path.clone()).is_err());
        drop(pf);
        assert!(!path.exists());
    }

    #[test]
    fn stale_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");
        // no pid this large on any sane system
        fs::write(&path, "999999999\n").unwrap();
        assert!(!pidfile_alive(&path));
        assert!(!path.exists());
    }

    #[test]
    fn copy_pidfile_name() {
        let p = copy_pidfile(Path::new("/run/cartage/main.pid"), "public.t");
        assert_eq!(p, PathBuf::from("/run/cartage/main.pid.copy.public.t"));
    }
}

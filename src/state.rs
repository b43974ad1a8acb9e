//! Persisted runtime state
//!
//! Two small pieces live outside the configuration: the token-signing
//! secret in the app state directory, and the PID file in the run
//! directory. Stale PID files left by a crashed instance are reclaimed
//! when the recorded process is gone or is a different binary.

use std::fs;
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{AppError, MarkrouteError};

/// File name of the secret inside the state directory.
const SECRET_FILE: &str = "secret";

/// Length of the signing secret in raw bytes.
const SECRET_LEN: usize = 32;

/// Load the token-signing secret, creating it on first use.
///
/// The state directory is created with mode 0700 and the secret file with
/// mode 0600; the secret itself is 32 random bytes stored base64-encoded.
pub fn load_or_create_secret(state_dir: &Path) -> io::Result<Vec<u8>> {
    fs::create_dir_all(state_dir)?;
    fs::set_permissions(state_dir, fs::Permissions::from_mode(0o700))?;

    let path = state_dir.join(SECRET_FILE);
    if path.exists() {
        let encoded = fs::read_to_string(&path)?;
        let secret = BASE64
            .decode(encoded.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if secret.len() != SECRET_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("secret has {} bytes, expected {SECRET_LEN}", secret.len()),
            ));
        }
        return Ok(secret);
    }

    let mut secret = vec![0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true).mode(0o600);
    let mut file = options.open(&path)?;
    io::Write::write_all(&mut file, BASE64.encode(&secret).as_bytes())?;
    debug!(path = %path.display(), "created signing secret");

    Ok(secret)
}

/// A held PID file, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the PID file for this process, reclaiming stale files.
    ///
    /// A stale file is reclaimed when the recorded process no longer
    /// exists, or when its `/proc/<pid>/exe` base name differs from the
    /// current binary's. A live instance of the same binary is an error.
    pub fn acquire(run_dir: &Path, name: &str) -> Result<Self, MarkrouteError> {
        fs::create_dir_all(run_dir).map_err(MarkrouteError::Io)?;
        let path = run_dir.join(format!("{name}.pid"));

        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if Self::is_same_binary(pid) {
                    return Err(AppError::InstanceRunning(pid).into());
                }
                warn!(pid, path = %path.display(), "reclaiming stale pid file");
            }
            fs::remove_file(&path).map_err(MarkrouteError::Io)?;
        }

        fs::write(&path, format!("{}\n", std::process::id())).map_err(MarkrouteError::Io)?;
        Ok(Self { path })
    }

    /// Whether the process with `pid` runs the same binary as this one.
    fn is_same_binary(pid: u32) -> bool {
        let Ok(other) = fs::read_link(format!("/proc/{pid}/exe")) else {
            return false;
        };
        let Ok(current) = std::env::current_exe() else {
            return false;
        };
        other.file_name() == current.file_name()
    }

    /// Path of the held file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_created_with_modes() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let secret = load_or_create_secret(&state_dir).unwrap();
        assert_eq!(secret.len(), SECRET_LEN);

        let dir_mode = fs::metadata(&state_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        let file_mode = fs::metadata(state_dir.join(SECRET_FILE))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn test_secret_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_secret(dir.path()).unwrap();
        let second = load_or_create_secret(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_secret_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SECRET_FILE), "not base64 !!!").unwrap();
        assert!(load_or_create_secret(dir.path()).is_err());
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::acquire(dir.path(), "markroute").unwrap();
        let path = pid_file.path().to_path_buf();

        let recorded: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_same_binary_refused() {
        let dir = tempfile::tempdir().unwrap();
        // Record our own PID: /proc/self/exe trivially matches.
        fs::write(
            dir.path().join("markroute.pid"),
            format!("{}\n", std::process::id()),
        )
        .unwrap();

        let err = PidFile::acquire(dir.path(), "markroute").unwrap_err();
        assert!(matches!(
            err,
            MarkrouteError::App(AppError::InstanceRunning(_))
        ));
    }

    #[test]
    fn test_stale_pid_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // A PID that cannot exist keeps /proc lookups failing.
        fs::write(dir.path().join("markroute.pid"), "4194305\n").unwrap();

        let pid_file = PidFile::acquire(dir.path(), "markroute").unwrap();
        let recorded: u32 = fs::read_to_string(pid_file.path())
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(recorded, std::process::id());
    }
}

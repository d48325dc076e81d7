//! Shared child-process supervision for the core adapters.
//!
//! Every core binary is spawned the same way: detached in its own session,
//! stdout+stderr redirected into a per-tunnel log file, then re-polled after
//! a short grace period so an immediate crash fails the apply with the log
//! tail attached. Teardown is terminate → bounded wait → kill, followed by a
//! best-effort `pkill` sweep for strays that re-parented.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{name} binary not found; set {env_var} or install it under /usr/local/bin")]
    BinaryNotFound { name: String, env_var: String },
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} exited immediately after start (exit code {exit_code:?}): {log_tail}")]
    EarlyExit {
        name: String,
        exit_code: Option<i32>,
        log_tail: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve a core binary: explicit env override, then the conventional
/// install locations, then a PATH walk.
pub fn resolve_binary(name: &str, env_var: &str) -> Result<PathBuf, ProcessError> {
    if let Ok(override_path) = env::var(env_var) {
        let path = PathBuf::from(&override_path);
        if path.is_file() {
            return Ok(path);
        }
    }

    for dir in ["/usr/local/bin", "/usr/bin"] {
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(ProcessError::BinaryNotFound {
        name: name.to_string(),
        env_var: env_var.to_string(),
    })
}

/// Open the per-tunnel log file and write the startup header.
pub fn open_log(log_path: &Path, header: &[String]) -> Result<File, ProcessError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut log = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;
    for line in header {
        writeln!(log, "{}", line)?;
    }
    log.flush()?;
    Ok(log)
}

/// Spawn a core binary detached, with stdout and stderr appended to `log`.
pub fn spawn_logged(
    name: &str,
    binary: &Path,
    args: &[&str],
    cwd: &Path,
    log: &File,
) -> Result<Child, ProcessError> {
    let stdout = log.try_clone()?;
    let stderr = log.try_clone()?;

    let mut command = Command::new(binary);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0);

    let child = command.spawn().map_err(|source| ProcessError::Spawn {
        name: name.to_string(),
        source,
    })?;

    info!(name, pid = child.id(), binary = %binary.display(), "spawned core process");
    Ok(child)
}

/// Wait the grace period and confirm the child is still alive; on an early
/// exit the log tail becomes part of the error.
pub fn verify_startup(
    name: &str,
    child: &mut Child,
    log_path: &Path,
    grace: Duration,
) -> Result<(), ProcessError> {
    std::thread::sleep(grace);

    match child.try_wait()? {
        None => Ok(()),
        Some(status) => Err(ProcessError::EarlyExit {
            name: name.to_string(),
            exit_code: status.code(),
            log_tail: read_log_tail(log_path, 2000),
        }),
    }
}

/// Last `max_bytes` of a log file, lossily decoded. Empty string when the
/// file is missing or unreadable.
pub fn read_log_tail(log_path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = File::open(log_path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Terminate → bounded wait → kill. Never fails; a child that cannot be
/// reaped is logged and left to the pkill sweep.
pub fn stop_child(name: &str, child: &mut Child, wait: Duration) {
    let pid = child.id() as libc::pid_t;

    // SIGTERM first so the core can tear down its sockets.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let deadline = Instant::now() + wait;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() >= deadline => break,
            Ok(None) => std::thread::sleep(Duration::from_millis(100)),
            Err(err) => {
                warn!(name, pid, error = %err, "failed to poll child during shutdown");
                break;
            }
        }
    }

    if let Err(err) = child.kill() {
        warn!(name, pid, error = %err, "failed to kill child");
    }
    let _ = child.wait();
    info!(name, pid, "stopped core process");
}

/// Best-effort sweep for survivors whose command line mentions the tunnel.
pub fn pkill_pattern(pattern: &str) {
    let _ = Command::new("pkill")
        .args(["-f", pattern])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_binary_honors_env_override() {
        let dir = tempdir().unwrap();
        let fake = dir.path().join("fake-core");
        fs::write(&fake, b"#!/bin/sh\n").unwrap();

        env::set_var("SMITE_TEST_FAKE_BINARY", &fake);
        let resolved = resolve_binary("fake-core", "SMITE_TEST_FAKE_BINARY").unwrap();
        assert_eq!(resolved, fake);
        env::remove_var("SMITE_TEST_FAKE_BINARY");
    }

    #[test]
    fn missing_binary_is_a_specific_error() {
        let err = resolve_binary("no-such-core-xyz", "NO_SUCH_ENV").unwrap_err();
        assert!(matches!(err, ProcessError::BinaryNotFound { .. }));
        assert!(err.to_string().contains("no-such-core-xyz"));
    }

    #[test]
    fn log_tail_returns_last_bytes() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("core.log");
        fs::write(&log_path, b"0123456789").unwrap();
        assert_eq!(read_log_tail(&log_path, 4), "6789");
        assert_eq!(read_log_tail(&log_path, 100), "0123456789");
        assert_eq!(read_log_tail(&dir.path().join("missing.log"), 10), "");
    }

    #[test]
    fn stop_child_reaps_a_sleeping_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        stop_child("sleep", &mut child, Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
    }
}

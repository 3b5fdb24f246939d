//! Proxy core child process
//!
//! One `ProxyProcess` is one launch of `<executable> run -c <config>`:
//! - stdout/stderr drained line by line into tracing until cancelled
//! - two-phase shutdown: SIGTERM, then SIGKILL after a grace period

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long shutdown waits for each output reader
pub const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Log target for forwarded child output
const CHILD_TARGET: &str = "proxy_bootstrap::child";

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Resolve the proxy executable.
///
/// Paths with a directory component are used as given. A bare name is looked
/// up in the working directory first, then on `PATH`.
pub fn resolve_executable(executable: &Path) -> PathBuf {
    if executable.components().count() > 1 || executable.exists() {
        return executable.to_path_buf();
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(executable))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| executable.to_path_buf())
}

/// Fail with `BinaryMissing` unless `path` is an executable file
pub fn check_executable(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::binary_missing(format!("{}: {}", path.display(), e)))?;

    if !metadata.is_file() {
        return Err(Error::binary_missing(format!("{} is not a file", path.display())));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(Error::binary_missing(format!(
                "{} is not executable",
                path.display()
            )));
        }
    }

    Ok(())
}

/// A running proxy core
pub struct ProxyProcess {
    child: Child,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ProxyProcess {
    /// Launch the core with the given config file.
    ///
    /// Readers are cancelled with `parent` as well as on shutdown.
    pub fn spawn(executable: &Path, config_path: &Path, parent: &CancellationToken) -> Result<Self> {
        let mut cmd = Command::new(executable);
        cmd.arg("run")
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Starting proxy core: {:?} run -c {:?}", executable, config_path);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to spawn {}: {}", executable.display(), e),
            ))
        })?;

        let pid = child.id();
        info!("Proxy core started with PID: {}", pid.unwrap_or(0));

        let cancel = parent.child_token();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain(stdout, Stream::Stdout, pid, cancel.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain(stderr, Stream::Stderr, pid, cancel.clone()));
        }

        Ok(ProxyProcess {
            child,
            pid,
            readers,
            cancel,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking check whether the child has exited
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                debug!("Proxy core {:?} exited: {}", self.pid, status);
                true
            }
            Err(_) => true,
        }
    }

    /// Stop readers and the child.
    ///
    /// SIGTERM first; if the child is still alive after `grace` it is killed.
    pub async fn shutdown(mut self, grace: Duration) -> Result<()> {
        self.cancel.cancel();
        for mut reader in self.readers.drain(..) {
            if timeout(READER_JOIN_TIMEOUT, &mut reader).await.is_err() {
                warn!("Output reader did not stop within {:?}, aborting", READER_JOIN_TIMEOUT);
                reader.abort();
            }
        }

        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("Proxy core {:?} already exited: {}", self.pid, status);
            return Ok(());
        }

        info!("Stopping proxy core {:?}...", self.pid);
        self.terminate();

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Proxy core exited with status: {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::teardown(format!("wait failed: {}", e))),
            Err(_) => {
                warn!("Proxy core didn't exit within {:?}, forcing kill", grace);
                self.child
                    .kill()
                    .await
                    .map_err(|e| Error::teardown(format!("kill failed: {}", e)))
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        // No graceful signal available; the grace wait is skipped in effect
        let _ = self.child.start_kill();
    }
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        // Child itself is killed on drop due to kill_on_drop(true)
        self.cancel.cancel();
    }
}

fn drain<R>(reader: R, stream: Stream, pid: Option<u32>, cancel: CancellationToken) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let pid = pid.unwrap_or(0);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match stream {
                        Stream::Stdout => debug!(target: CHILD_TARGET, pid, stream = stream.as_str(), "{}", line),
                        Stream::Stderr => warn!(target: CHILD_TARGET, pid, stream = stream.as_str(), "{}", line),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(target: CHILD_TARGET, pid, "{} read error: {}", stream.as_str(), e);
                        break;
                    }
                },
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[test]
    fn test_check_executable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            check_executable(&dir.path().join("missing")),
            Err(Error::BinaryMissing(_))
        ));

        let plain = dir.path().join("plain");
        std::fs::write(&plain, "data").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(check_executable(&plain), Err(Error::BinaryMissing(_))));

        assert!(matches!(check_executable(dir.path()), Err(Error::BinaryMissing(_))));

        let exe = script(dir.path(), "core", "exit 0");
        assert!(check_executable(&exe).is_ok());
    }

    #[test]
    fn test_resolve_executable_from_path() {
        let resolved = resolve_executable(Path::new("sh"));
        assert!(resolved.is_absolute());
        assert_eq!(resolve_executable(Path::new("/opt/xray/xray")), PathBuf::from("/opt/xray/xray"));
    }

    #[tokio::test]
    async fn test_spawn_and_graceful_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "core", "echo \"started $@\"\necho oops >&2\nexec sleep 30");
        let cancel = CancellationToken::new();

        let mut process = ProxyProcess::spawn(&exe, &dir.path().join("cfg.json"), &cancel).unwrap();
        let pid = process.pid().unwrap();
        assert!(!process.has_exited());

        process.shutdown(Duration::from_millis(500)).await.unwrap();
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        // Ignores SIGTERM
        let exe = script(dir.path(), "stubborn", "trap '' TERM\nwhile true; do sleep 1; done");
        let cancel = CancellationToken::new();

        let process = ProxyProcess::spawn(&exe, &dir.path().join("cfg.json"), &cancel).unwrap();
        let pid = process.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        process.shutdown(Duration::from_millis(200)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn test_has_exited_after_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "quick", "exit 3");
        let cancel = CancellationToken::new();

        let mut process = ProxyProcess::spawn(&exe, &dir.path().join("cfg.json"), &cancel).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(process.has_exited());
        process.shutdown(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let cancel = CancellationToken::new();
        let result = ProxyProcess::spawn(
            Path::new("/nonexistent/xray"),
            Path::new("/tmp/cfg.json"),
            &cancel,
        );
        assert!(matches!(result, Err(Error::Io(_))));
    }
}

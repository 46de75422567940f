//! Transcoder subprocess control
//!
//! Spawns the transcoder with piped stderr, scans its output for liveness
//! and errors, and stops it with SIGTERM followed by a kill after a grace
//! period.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// What a line of transcoder stderr tells us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrLine {
    /// `frame=` progress report
    Progress,
    /// Manifest opened for writing
    OutputOpened,
    Error,
    Other,
}

#[must_use]
pub fn classify(line: &str) -> StderrLine {
    let trimmed = line.trim_start();
    if trimmed.starts_with("frame=") {
        StderrLine::Progress
    } else if trimmed.contains("Opening '") && trimmed.contains(".m3u8") {
        StderrLine::OutputOpened
    } else if trimmed.to_ascii_lowercase().contains("error") {
        StderrLine::Error
    } else {
        StderrLine::Other
    }
}

/// A running transcoder
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// Spawn `program` with `args`; `on_exit` runs once with the exit code
pub fn spawn<F>(program: &str, args: &[String], on_exit: F) -> Result<ProcessHandle>
where
    F: FnOnce(Option<i32>) + Send + 'static,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BridgeError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let pid = child.id();
    info!(program, pid, "Transcoder started");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(scan_stderr(stderr, pid));
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(false);

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!(pid, error = %e, "Failed to kill transcoder");
                }
                child.wait().await
            }
        };

        let code = match status {
            Ok(status) => {
                info!(pid, status = %status, "Transcoder exited");
                status.code()
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for transcoder");
                None
            }
        };

        exited_tx.send_replace(true);
        on_exit(code);
    });

    Ok(ProcessHandle {
        pid,
        kill: Some(kill_tx),
        exited: exited_rx,
    })
}

impl ProcessHandle {
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// SIGTERM, wait up to `grace`, then kill; true if it exited on its own
    pub async fn terminate(mut self, grace: Duration) -> bool {
        if self.has_exited() {
            return true;
        }

        let signalled = self.pid.is_some_and(send_sigterm);
        if signalled {
            debug!(pid = self.pid, "Sent SIGTERM to transcoder");
            let exited = tokio::time::timeout(grace, self.exited.wait_for(|exited| *exited))
                .await
                .is_ok();
            if exited {
                return true;
            }
            warn!(pid = self.pid, grace = ?grace, "Transcoder ignored SIGTERM, killing");
        }

        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        // the monitor task always reports the exit
        let _ = self.exited.wait_for(|exited| *exited).await;
        false
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

async fn scan_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    let mut seen_progress = false;

    while let Ok(Some(line)) = lines.next_line().await {
        match classify(&line) {
            StderrLine::Progress if !seen_progress => {
                seen_progress = true;
                info!(pid, "Transcoder is receiving media");
            }
            StderrLine::OutputOpened => info!(pid, line = %line.trim(), "Transcoder output"),
            StderrLine::Error => warn!(pid, line = %line.trim(), "Transcoder error"),
            StderrLine::Progress | StderrLine::Other => debug!(pid, line = %line.trim(), "Transcoder"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_classify_lines() {
        assert_eq!(
            classify("frame=   42 fps= 30 q=-1.0 size=N/A time=00:00:01.40"),
            StderrLine::Progress
        );
        assert_eq!(
            classify("[hls @ 0x1] Opening 'public/hls/stream.m3u8.tmp' for writing"),
            StderrLine::OutputOpened
        );
        assert_eq!(
            classify("[sdp @ 0x2] Error binding RTP socket"),
            StderrLine::Error
        );
        assert_eq!(classify("Input #0, sdp, from 'video.sdp':"), StderrLine::Other);
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let (tx, rx) = oneshot::channel();
        let handle = spawn("sh", &sh("exec sleep 30"), move |code| {
            let _ = tx.send(code);
        })
        .unwrap();

        assert!(!handle.has_exited());
        assert!(handle.terminate(Duration::from_secs(5)).await);
        // killed by a signal, no exit code
        assert_eq!(rx.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kill_after_grace_period() {
        let handle = spawn("sh", &sh("trap '' TERM; exec sleep 30"), |_| {}).unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.terminate(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let (tx, rx) = oneshot::channel();
        let _handle = spawn("sh", &sh("exit 3"), move |code| {
            let _ = tx.send(code);
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = spawn("/nonexistent/stagecast-transcoder", &[], |_| {});
        assert!(matches!(result, Err(BridgeError::Spawn { .. })));
    }
}

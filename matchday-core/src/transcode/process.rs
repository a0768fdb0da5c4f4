use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use super::TranscodeCommand;

/// How a transcoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub killed: bool,
}

impl ProcessExit {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            killed: false,
        }
    }

    pub fn killed() -> Self {
        Self {
            code: None,
            killed: true,
        }
    }

    pub fn success(&self) -> bool {
        !self.killed && self.code == Some(0)
    }

    fn from_status(status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                killed: false,
            },
            Err(err) => {
                warn!(error = %err, "failed to wait on transcoder process");
                Self {
                    code: None,
                    killed: false,
                }
            }
        }
    }
}

/// Liveness handle of one transcoder process.
#[async_trait::async_trait]
pub trait TranscodeProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Forced termination. Has no effect once the process has exited.
    fn kill(&self);

    async fn wait_for_exit(&self) -> ProcessExit;

    /// Diagnostic output lines, available to the first caller only.
    fn take_output(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        None
    }
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &TranscodeCommand) -> io::Result<Arc<dyn TranscodeProcess>>;
}

/// Spawns real OS processes through tokio. Must be called from within a
/// tokio runtime.
#[derive(Debug, Default)]
pub struct SystemProcessSpawner;

impl ProcessSpawner for SystemProcessSpawner {
    fn spawn(&self, command: &TranscodeCommand) -> io::Result<Arc<dyn TranscodeProcess>> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(pid = ?child.id(), command = %command.display(), "spawned transcoder");

        let output = child.stderr.take().map(|stderr| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_lines(stderr, tx));
            rx
        });
        Ok(Arc::new(ChildProcess::watch(child, output)))
    }
}

struct ChildProcess {
    pid: Option<u32>,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<ProcessExit>>,
    output: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

impl ChildProcess {
    /// Hands `child` to a reaper task that owns it until exit.
    fn watch(mut child: Child, output: Option<mpsc::UnboundedReceiver<String>>) -> Self {
        let pid = child.id();
        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);

        let kill_signal = kill.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => ProcessExit::from_status(status),
                _ = kill_signal.notified() => {
                    if let Err(err) = child.start_kill() {
                        debug!(pid = ?pid, error = %err, "kill after exit");
                    }
                    let status = child.wait().await;
                    ProcessExit {
                        code: status.ok().and_then(|status| status.code()),
                        killed: true,
                    }
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

        Self {
            pid,
            kill,
            exit: exit_rx,
            output: Mutex::new(output),
        }
    }
}

#[async_trait::async_trait]
impl TranscodeProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn kill(&self) {
        if self.is_alive() {
            self.kill.notify_one();
        }
    }

    async fn wait_for_exit(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        loop {
            if let Some(status) = *exit.borrow() {
                return status;
            }
            if exit.changed().await.is_err() {
                return exit.borrow().unwrap_or(ProcessExit {
                    code: None,
                    killed: false,
                });
            }
        }
    }

    fn take_output(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

// ffmpeg rewrites its stats line with '\r', so both '\r' and '\n' end a line.
async fn forward_lines<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(error = %err, "transcoder output closed");
                break;
            }
        };
        for &byte in &buffer[..read] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

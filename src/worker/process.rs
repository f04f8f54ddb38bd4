use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::RunnerError;

const READ_CHUNK: usize = 8 * 1024;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// Exit code, `None` when the process was killed by a signal or could
    /// not be waited on.
    pub code: Option<i32>,
}

impl Termination {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Launches external commands and hands back pollable handles.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Start `command` split on whitespace, with stderr folded into stdout.
    ///
    /// `env` is layered on top of the inherited environment. Must be called
    /// from within a Tokio runtime: a watcher task drains the output and
    /// reaps the child.
    pub fn launch(
        &self,
        command: &str,
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, RunnerError> {
        let mut argv = command.split_whitespace();
        let program = argv.next().ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(argv)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let pid = child.id();

        let (exit_tx, exit_rx) = watch::channel(None);
        let output = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&output);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tokio::spawn(async move {
            let combined = Arc::new(Mutex::new(Vec::new()));
            tokio::join!(
                drain(stdout, Arc::clone(&combined)),
                drain(stderr, Arc::clone(&combined))
            );

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait on process");
                    None
                }
            };

            let bytes = std::mem::take(&mut *combined.lock().unwrap_or_else(PoisonError::into_inner));
            *captured.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(String::from_utf8_lossy(&bytes).into_owned());
            // Output is stored before the exit is published.
            let _ = exit_tx.send(Some(Termination { code }));
        });

        tracing::debug!(pid = ?pid, command, "Process launched");

        Ok(ProcessHandle {
            pid,
            exit: exit_rx,
            output,
        })
    }
}

/// Copy everything from `reader` into the shared buffer, chunk by chunk.
async fn drain<R>(reader: Option<R>, sink: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&buf[..n]),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

/// Shared handle to a launched process. Clones observe the same process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit: watch::Receiver<Option<Termination>>,
    output: Arc<Mutex<Option<String>>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check.
    pub fn poll(&self) -> Option<Termination> {
        *self.exit.borrow()
    }

    /// Suspend until the process has exited and its output is captured.
    pub async fn wait(&self) -> Termination {
        let mut exit = self.exit.clone();
        let termination = match exit.wait_for(Option::is_some).await {
            Ok(state) => *state,
            // Watcher went away without reporting.
            Err(_) => None,
        };
        termination.unwrap_or(Termination { code: None })
    }

    /// Take the combined stdout/stderr text. Only the first call after exit
    /// gets the text.
    pub fn collect_output(&self) -> Result<String, RunnerError> {
        if self.poll().is_none() {
            return Err(RunnerError::StillRunning);
        }
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RunnerError::OutputCollected)
    }
}

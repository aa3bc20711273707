/// Node.js subprocess realisation of the isolated context
/// User code runs in a separate process under Node's permission model, with
/// an empty environment, inside a `vm` context whose globals are built in
/// that context; messages travel as JSON lines over stdio
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{HostMessage, IsolatedContext, Result, SandboxError, SandboxMessage};

const HARNESS: &str = include_str!("harness.js");
const HARNESS_FILE: &str = "harness.js";

/// Node's permission model switch (`--permission` on newer releases)
pub const DEFAULT_PERMISSION_FLAG: &str = "--experimental-permission";

/// How the sandbox runtime is located and started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Explicit node executable, looked up on PATH when unset
    pub program: Option<PathBuf>,

    /// Enables the permission model; the process may then read only the
    /// harness script and gets no child processes or workers
    pub permission_flag: String,

    /// Extra runtime flags placed before the harness script
    /// (e.g. `--max-old-space-size=64`)
    pub extra_args: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            program: None,
            permission_flag: DEFAULT_PERMISSION_FLAG.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl SandboxConfig {
    pub fn resolve_program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => which::which("node").map_err(|_| SandboxError::RuntimeMissing),
        }
    }

    pub fn runtime_available(&self) -> bool {
        self.resolve_program().is_ok()
    }

    /// Runtime arguments ahead of the harness script
    fn runtime_args(&self, harness: &Path) -> Vec<OsString> {
        let mut allow_read = OsString::from("--allow-fs-read=");
        allow_read.push(harness);

        let mut args = vec![OsString::from(&self.permission_flag), allow_read];
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }
}

pub struct NodeContext {
    child: Child,
    stdin: Option<ChildStdin>,
    messages: mpsc::UnboundedReceiver<SandboxMessage>,
    _workdir: TempDir,
}

impl NodeContext {
    /// Start a fresh runtime. Must be called from within a tokio runtime.
    pub fn spawn(config: &SandboxConfig) -> Result<Self> {
        let program = config.resolve_program()?;

        let workdir = tempfile::Builder::new()
            .prefix("coderoom-sandbox-")
            .tempdir()?;
        let harness = workdir.path().join(HARNESS_FILE);
        std::fs::write(&harness, HARNESS)?;
        // The read allowance must name the resolved path
        let harness = harness.canonicalize()?;

        let mut cmd = Command::new(&program);
        cmd.args(config.runtime_args(&harness))
            .arg(&harness)
            .env_clear()
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(format!("{}: {}", program.display(), e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("stdout not captured".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match SandboxMessage::parse(&line) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed sandbox message: {}", e),
                }
            }
            debug!("Sandbox stdout closed");
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("Sandbox stderr: {}", line);
                }
            });
        }

        debug!(
            "Sandbox context started: program={}, pid={:?}",
            program.display(),
            child.id()
        );

        Ok(Self {
            child,
            stdin,
            messages: rx,
            _workdir: workdir,
        })
    }

    /// Whether the runtime process has terminated
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

#[async_trait]
impl IsolatedContext for NodeContext {
    async fn post(&mut self, message: HostMessage) -> Result<()> {
        // A write into a dead child's pipe can still succeed
        if self.has_exited() {
            return Err(SandboxError::ContextClosed);
        }
        let stdin = self.stdin.as_mut().ok_or(SandboxError::ContextClosed)?;
        let line = message.to_line()?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| SandboxError::ContextClosed)?;
        stdin.flush().await.map_err(|_| SandboxError::ContextClosed)?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<SandboxMessage> {
        self.messages.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            // EOF lets the harness exit once in-flight runs settle
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }
}

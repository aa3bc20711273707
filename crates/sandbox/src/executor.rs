/// Host side of sandboxed execution: run dispatch and the output log
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{HostMessage, IsolatedContext, Result, SandboxMessage};

/// Prefix distinguishing error lines in rendered output
pub const ERROR_MARKER: &str = "❌ ";

pub const OUTPUT_PLACEHOLDER: &str = "// Output will appear here";

/// `Running` from the first `run` on. The context never reports that a run
/// has completed, so only [`SandboxedExecutor::finish`] or the context
/// exiting brings the executor back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    Log,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub kind: OutputKind,
    pub text: String,
}

impl OutputLine {
    pub fn render(&self) -> String {
        match self.kind {
            OutputKind::Log => self.text.clone(),
            OutputKind::Error => format!("{}{}", ERROR_MARKER, self.text),
        }
    }
}

/// Append-only output of the current run; never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputLog {
    lines: Vec<OutputLine>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: OutputKind, text: impl Into<String>) {
        self.lines.push(OutputLine {
            kind,
            text: text.into(),
        });
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return OUTPUT_PLACEHOLDER.to_string();
        }

        self.lines
            .iter()
            .map(OutputLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What applying a sandbox message did to the output log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChange {
    Appended(OutputLine),
    Cleared,
}

/// Dispatches runs to an isolated context and folds its messages into
/// an [`OutputLog`].
///
/// Messages carry no run identifier: a run started before the previous
/// one has finished reporting interleaves with it.
pub struct SandboxedExecutor {
    context: Box<dyn IsolatedContext>,
    state: ExecutorState,
    output: OutputLog,
    runs: u64,
}

impl SandboxedExecutor {
    pub fn new(context: impl IsolatedContext + 'static) -> Self {
        Self::from_boxed(Box::new(context))
    }

    pub fn from_boxed(context: Box<dyn IsolatedContext>) -> Self {
        Self {
            context,
            state: ExecutorState::Idle,
            output: OutputLog::new(),
            runs: 0,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn output(&self) -> &OutputLog {
        &self.output
    }

    /// Number of runs dispatched over the executor's lifetime
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Clear the output and dispatch `source` to the isolated context
    pub async fn run(&mut self, source: &str) -> Result<()> {
        if self.state == ExecutorState::Running {
            debug!("Run dispatched while a previous run may still be reporting");
        }

        self.output.clear();
        self.context.post(HostMessage::run_code(source)).await?;
        self.state = ExecutorState::Running;
        self.runs += 1;
        Ok(())
    }

    /// Next message from the context. Cancel-safe.
    pub async fn next_message(&mut self) -> Option<SandboxMessage> {
        let msg = self.context.next_message().await;
        if msg.is_none() && self.state == ExecutorState::Running {
            warn!("Isolated context exited");
            self.state = ExecutorState::Idle;
        }
        msg
    }

    pub fn apply(&mut self, message: SandboxMessage) -> OutputChange {
        match message {
            SandboxMessage::Log { message } => self.append(OutputKind::Log, message),
            SandboxMessage::Error { message } => self.append(OutputKind::Error, message),
            SandboxMessage::Clear => {
                self.output.clear();
                OutputChange::Cleared
            }
        }
    }

    fn append(&mut self, kind: OutputKind, text: String) -> OutputChange {
        let line = OutputLine { kind, text };
        self.output.lines.push(line.clone());
        OutputChange::Appended(line)
    }

    /// Close the context and collect everything it still reports.
    ///
    /// There is no cancellation: this waits for dispatched runs to
    /// complete, so a hung script keeps it waiting.
    pub async fn finish(&mut self) -> Result<&OutputLog> {
        self.context.close().await?;
        while let Some(msg) = self.context.next_message().await {
            self.apply(msg);
        }
        self.state = ExecutorState::Idle;
        Ok(&self.output)
    }
}

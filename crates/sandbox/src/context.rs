/// Isolated execution context seam
/// The host only ever talks to the context through tagged messages
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{HostMessage, Result, SandboxError, SandboxMessage};

/// A context that executes code without sharing memory with the host.
///
/// `next_message` must be cancel-safe: the session controller polls it
/// inside `tokio::select!` next to store notifications and timers.
#[async_trait]
pub trait IsolatedContext: Send {
    /// Dispatch a message into the context (one-way)
    async fn post(&mut self, message: HostMessage) -> Result<()>;

    /// Next message emitted by the context, `None` once it has exited
    async fn next_message(&mut self) -> Option<SandboxMessage>;

    /// Stop accepting input. Work already dispatched keeps reporting
    /// until it completes, after which `next_message` yields `None`.
    async fn close(&mut self) -> Result<()>;
}

/// In-process context backed by a pair of channels.
///
/// The other end ([`ContextPeer`]) plays the isolated side; it can live
/// on another task, thread, or runtime.
pub struct ChannelContext {
    outbound: Option<mpsc::UnboundedSender<HostMessage>>,
    inbound: mpsc::UnboundedReceiver<SandboxMessage>,
}

/// Isolated side of a [`ChannelContext`]
pub struct ContextPeer {
    inbound: mpsc::UnboundedReceiver<HostMessage>,
    outbound: mpsc::UnboundedSender<SandboxMessage>,
}

impl ChannelContext {
    pub fn pair() -> (ChannelContext, ContextPeer) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        (
            ChannelContext {
                outbound: Some(host_tx),
                inbound: peer_rx,
            },
            ContextPeer {
                inbound: host_rx,
                outbound: peer_tx,
            },
        )
    }
}

#[async_trait]
impl IsolatedContext for ChannelContext {
    async fn post(&mut self, message: HostMessage) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(SandboxError::ContextClosed)?;
        tx.send(message).map_err(|_| SandboxError::ContextClosed)
    }

    async fn next_message(&mut self) -> Option<SandboxMessage> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.outbound = None;
        Ok(())
    }
}

impl ContextPeer {
    /// Next message dispatched by the host, `None` after the host closed
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.inbound.recv().await
    }

    pub fn send(&self, message: SandboxMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| SandboxError::ContextClosed)
    }

    pub fn log(&self, message: impl Into<String>) -> Result<()> {
        self.send(SandboxMessage::Log {
            message: message.into(),
        })
    }

    pub fn error(&self, message: impl Into<String>) -> Result<()> {
        self.send(SandboxMessage::Error {
            message: message.into(),
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.send(SandboxMessage::Clear)
    }
}

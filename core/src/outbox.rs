//! Per-session output channel.
//!
//! The socket's write half is owned by a single writer task; everything that
//! wants to put bytes on a client's terminal (the command loop, the terminal
//! relay pump, the mailbox consumer) goes through a clonable [`Outbox`].

use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// The writer task has gone away; the client is disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxClosed;

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Outbox {
    /// Create an outbox and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), OutboxClosed> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.tx.send(bytes).await.map_err(|_| OutboxClosed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), OutboxClosed> {
        self.send_bytes(text.into().into_bytes()).await
    }

    /// Whether `self` and `other` feed the same client.
    pub fn same_session(&self, other: &Outbox) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle on the task that owns a client's write half.
#[derive(Debug)]
pub struct OutputWriter {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl OutputWriter {
    /// Flush what is already queued, then close the connection even if
    /// background pipelines still hold [`Outbox`] clones.
    pub async fn finish(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            debug!(error = %err, "output writer ended abnormally");
        }
    }
}

/// Spawn the task that owns `writer` and copies every queued chunk onto it,
/// in order, until [`OutputWriter::finish`] or until the peer stops
/// accepting bytes.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>) -> OutputWriter
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut closing = false;
        loop {
            let chunk = tokio::select! {
                _ = &mut shutdown_rx, if !closing => {
                    // Queued chunks are still delivered after close.
                    rx.close();
                    closing = true;
                    continue;
                }
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            if let Err(err) = writer.write_all(&chunk).await {
                debug!(error = %err, "client write failed; dropping output");
                break;
            }
        }
        // Producers see the channel closed from here on.
        rx.close();
        let _ = writer.shutdown().await;
    });
    OutputWriter { task, shutdown }
}

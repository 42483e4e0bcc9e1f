//! Terminal relay: the per-Line stand-in for the client's socket.
//!
//! Stage processes never get the socket itself. They write to the blocking
//! write end of a pipe, and a task pumps the read end into the session's
//! [`Outbox`]. The pump finishes once every copy of the write end is closed,
//! which for a foreground Line means every stage has exited.

use std::io;
use std::os::fd::OwnedFd;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::fd::anon_pipe;
use crate::outbox::Outbox;

const PUMP_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
pub(crate) struct TerminalRelay {
    writer: OwnedFd,
    pump: JoinHandle<()>,
}

impl TerminalRelay {
    /// Must be called within a tokio runtime.
    pub(crate) fn open(outbox: Outbox) -> io::Result<Self> {
        let (reader, writer) = anon_pipe()?;
        let receiver = pipe::Receiver::from_owned_fd(reader)?;
        let pump = tokio::spawn(pump(receiver, outbox));
        Ok(Self { writer, pump })
    }

    /// A new descriptor for a stage's stdout or stderr.
    pub(crate) fn endpoint(&self) -> io::Result<OwnedFd> {
        self.writer.try_clone()
    }

    /// Drop the coordinator's write end. The returned handle completes when
    /// the last stage holding an endpoint has closed it.
    pub(crate) fn close(self) -> JoinHandle<()> {
        drop(self.writer);
        self.pump
    }
}

async fn pump(mut receiver: pipe::Receiver, outbox: Outbox) {
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        match receiver.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if outbox.send_bytes(buf[..n].to_vec()).await.is_err() {
                    // Client gone; dropping the receiver turns further
                    // writes into EPIPE.
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "terminal relay read failed");
                break;
            }
        }
    }
}

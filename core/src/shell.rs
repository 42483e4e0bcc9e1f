//! One connected client: the command loop, the mailbox consumer and the
//! ordered termination path.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::ShellError;
use crate::error::notice_line;
use crate::executor::LineStatus;
use crate::executor::run_line;
use crate::mailbox::Audience;
use crate::notice;
use crate::numbered_pipe::NumberedPipeTable;
use crate::outbox::Outbox;
use crate::outbox::spawn_writer;
use crate::parser::parse;
use crate::registry::SessionHandle;
use crate::registry::UNNAMED;
use crate::server::ServerServices;
use crate::session_id::SessionId;

/// Per-session state owned by the command loop.
pub(crate) struct SessionState {
    pub(crate) id: SessionId,
    pub(crate) addr: SocketAddr,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) numbered: NumberedPipeTable,
    pub(crate) outbox: Outbox,
    pub(crate) services: Arc<ServerServices>,
    /// Working directory of stage processes.
    pub(crate) cwd: PathBuf,
}

impl SessionState {
    fn new(
        id: SessionId,
        addr: SocketAddr,
        outbox: Outbox,
        services: Arc<ServerServices>,
    ) -> Self {
        let env = BTreeMap::from([(
            "PATH".to_string(),
            services.config.default_path.clone(),
        )]);
        let cwd = services
            .config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            id,
            addr,
            env,
            numbered: NumberedPipeTable::new(),
            outbox,
            services,
            cwd,
        }
    }

    pub(crate) fn display_name(&self) -> String {
        self.services
            .sessions
            .lookup_by_id(self.id)
            .map(|info| info.display_name().to_string())
            .unwrap_or_else(|| UNNAMED.to_string())
    }

    /// Queue `text` for this session's client. A vanished client is noticed
    /// by the command loop on its next read.
    pub(crate) async fn write(&self, text: impl Into<String>) {
        if self.outbox.send_text(text).await.is_err() {
            debug!(session = %self.id, "client output closed");
        }
    }

    pub(crate) async fn report(&self, err: &ShellError) {
        self.write(notice_line(err)).await;
    }

    /// Publish to every session and wait until all of them, this one
    /// included, have taken the notice.
    pub(crate) async fn broadcast(&self, text: String) {
        let services = &self.services;
        if let Some(message) = services
            .mailbox
            .publish(&services.sessions, self.id, text, Audience::All, false)
            .await
        {
            services.mailbox.wait_drained(message).await;
        }
    }

    /// Run every Line of `raw` in order. Returns `false` once the session
    /// should end.
    async fn run_command(&mut self, raw: &str) -> bool {
        for line in parse(raw) {
            let status = run_line(self, &line, raw).await;
            debug!(session = %self.id, ?status, "line done");
            if status == LineStatus::Exit {
                return false;
            }
        }
        true
    }

    /// Leave notice, user pipe cleanup, then wait for the notice to reach
    /// everyone before the connection is closed. The id stays reserved until
    /// the consumer is stopped, see [`serve_connection`].
    async fn terminate(&self, leave_gate: &Notify) {
        let services = &self.services;
        let name = self.display_name();
        services.sessions.mark_for_removal(self.id);
        let leave = services
            .mailbox
            .publish(
                &services.sessions,
                self.id,
                notice::logout(&name),
                Audience::All,
                true,
            )
            .await;
        services.user_pipes.drain_for(self.id);

        if let Some(message) = leave {
            let stall = services.config.mailbox_stall_timeout();
            if tokio::time::timeout(stall, leave_gate.notified())
                .await
                .is_err()
            {
                warn!(session = %self.id, "own leave notice was not consumed in time");
            }
            services.mailbox.wait_drained(message).await;
        }
        info!(session = %self.id, name, addr = %self.addr, "session left");
    }
}

/// Serve one accepted connection until the client exits or disconnects.
pub async fn serve_connection(
    services: Arc<ServerServices>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let (read_half, write_half) = stream.into_split();
    let (outbox, rx) = Outbox::channel(services.config.outbox_capacity);
    let writer = spawn_writer(write_half, rx);

    let handle = SessionHandle::new(outbox.clone());
    let wake = Arc::clone(&handle.wake);
    services.sessions.apply_removals(&services.user_pipes);
    let id = match services.sessions.create(addr, handle) {
        Ok(id) => id,
        Err(err) => {
            warn!(%addr, error = %err, "connection rejected");
            if outbox.send_text(notice_line(&err)).await.is_err() {
                debug!(%addr, "rejected client already gone");
            }
            drop(outbox);
            writer.finish().await;
            return;
        }
    };
    info!(session = %id, %addr, "session connected");

    // Queued before the consumer starts, so the banner precedes any notice.
    if outbox.send_text(notice::WELCOME_BANNER).await.is_err() {
        debug!(session = %id, "client output closed");
    }
    let leave_gate = Arc::new(Notify::new());
    let consumer = spawn_consumer(
        Arc::clone(&services),
        id,
        outbox.clone(),
        wake,
        Arc::clone(&leave_gate),
    );

    let mut state = SessionState::new(id, addr, outbox, Arc::clone(&services));
    state.broadcast(notice::login(UNNAMED, addr)).await;
    state.write(notice::PROMPT).await;

    let mut reader = BufReader::new(read_half);
    let max_line = services.config.max_line_bytes;
    loop {
        let raw = match read_command(&mut reader, max_line).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(session = %id, "client closed the connection");
                break;
            }
            Err(err) => {
                debug!(session = %id, error = %err, "client read failed");
                break;
            }
        };
        if !state.run_command(&raw).await {
            break;
        }
        if state.outbox.is_closed() {
            break;
        }
        state.write(notice::PROMPT).await;
    }

    state.terminate(&leave_gate).await;
    services.sessions.release(id);
    stop_consumer(consumer).await;
    services.mailbox.forget(id);
    // Only now may a new connection take the id.
    services.sessions.apply_removals(&services.user_pipes);
    drop(state);
    writer.finish().await;
}

/// Read one command line, without its CR/LF, truncated to `max_bytes`.
/// Bytes past the limit are skipped without being buffered. `None` at end
/// of stream.
async fn read_command<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max_bytes)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let mut buf = Vec::new();
    if (&mut *reader).take(limit).read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && buf.len() > max_bytes {
        skip_line(reader).await?;
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    buf.truncate(max_bytes);
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Consume input through the next newline.
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|byte| *byte == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

fn spawn_consumer(
    services: Arc<ServerServices>,
    id: SessionId,
    outbox: Outbox,
    wake: Arc<Notify>,
    leave_gate: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            wake.notified().await;
            match services.mailbox.consume(id, &outbox).await {
                Ok(Some(consumed)) if consumed.own_exit => leave_gate.notify_one(),
                Ok(_) => {}
                // Still acknowledged; other sessions are not held up.
                Err(_) => debug!(session = %id, "notice dropped; client output closed"),
            }
        }
    })
}

async fn stop_consumer(consumer: JoinHandle<()>) {
    consumer.abort();
    if let Err(err) = consumer.await
        && !err.is_cancelled()
    {
        warn!(error = %err, "mailbox consumer ended abnormally");
    }
}

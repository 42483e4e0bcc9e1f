//! Runs one parsed [`Line`]: resolves pipe tokens, wires descriptors and
//! spawns a process per stage.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;

use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::dispatch;
use crate::error::Result;
use crate::error::ShellError;
use crate::fd::anon_pipe;
use crate::fd::with_retries;
use crate::notice;
use crate::parser::Line;
use crate::parser::Stage;
use crate::process_death::kill_on_parent_death;
use crate::registry::SessionInfo;
use crate::relay::TerminalRelay;
use crate::session_id::SessionId;
use crate::shell::SessionState;

/// Exit status reported for a stage whose program could not be resolved.
pub const EXIT_NOT_FOUND: i32 = 127;
const EXIT_SIGNAL_BASE: i32 = 128;

/// How a Line ended, as far as the command loop is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A builtin handled the Line.
    Builtin,
    /// `exit`: the session must terminate.
    Exit,
    /// Foreground pipeline finished with this exit status of its last stage.
    Finished(i32),
    /// The last stage's output was routed into a numbered or user pipe; the
    /// pipeline keeps running on its own.
    Detached,
    /// A pipe or process could not be created; already reported.
    Aborted,
}

/// Run `line` for the session. `raw` is the whole input line, quoted in
/// user pipe notices.
pub(crate) async fn run_line(state: &mut SessionState, line: &Line, raw: &str) -> LineStatus {
    state.numbered.age();

    if let [stage] = line.stages.as_slice()
        && let Some(status) = dispatch::run_builtin(state, stage).await
    {
        return status;
    }

    match run_pipeline(state, line, raw).await {
        Ok(status) => status,
        Err(err) => {
            warn!(session = %state.id, error = %err, "pipeline aborted");
            state.report(&err).await;
            LineStatus::Aborted
        }
    }
}

async fn run_pipeline(state: &mut SessionState, line: &Line, raw: &str) -> Result<LineStatus> {
    let retries = state.services.config.spawn_retries;
    let delay = state.services.config.spawn_retry_delay();

    let outbox = state.outbox.clone();
    let relay = with_retries("terminal relay", retries, delay, || {
        TerminalRelay::open(outbox.clone())
    })
    .await
    .map_err(|err| ShellError::resource_exhaustion("cannot create pipe", err))?;

    let mut due = state
        .numbered
        .due_reader()
        .map_err(|err| ShellError::resource_exhaustion("cannot duplicate pipe", err))?;

    let stage_count = line.stages.len();
    let mut previous: Option<OwnedFd> = None;
    let mut upstream: Vec<Child> = Vec::new();
    let mut last: Option<Child> = None;

    for (index, stage) in line.stages.iter().enumerate() {
        let is_first = index == 0;
        let is_last = index + 1 == stage_count;

        let piped_input = previous.take();
        let stdin = if let Some(src) = stage.input_from {
            receive_user_pipe(state, src, raw).await
        } else if is_first {
            due.take()
        } else {
            piped_input
        };

        let numbered = match line.tag {
            Some(tag) if is_last => Some(numbered_writer(state, tag.count).await?),
            _ => None,
        };

        let stdout = if let Some(path) = &stage.output_file {
            open_output_file(state, path).await
        } else if let Some(dst) = stage.output_to {
            send_user_pipe(state, dst, raw).await?
        } else if !is_last {
            let (reader, writer) = with_retries("stage pipe", retries, delay, anon_pipe)
                .await
                .map_err(|err| ShellError::resource_exhaustion("cannot create pipe", err))?;
            previous = Some(reader);
            Some(writer)
        } else if let Some(writer) = &numbered {
            Some(dup(writer)?)
        } else {
            Some(dup_endpoint(&relay)?)
        };

        let stderr = match (&numbered, line.tag) {
            (Some(writer), Some(tag)) if tag.merge_stderr => dup(writer)?,
            _ => dup_endpoint(&relay)?,
        };
        drop(numbered);

        let child = spawn_stage(state, stage, stdin, stdout, stderr).await?;
        if is_first {
            // The due slot's reader now belongs to the first stage.
            due = None;
            state.numbered.close_due();
        }
        match child {
            Some(child) if is_last => last = Some(child),
            Some(child) => upstream.push(child),
            None => {}
        }
    }
    drop(due);

    for child in upstream {
        reap_in_background(child);
    }
    let pump = relay.close();

    let detached = line.tag.is_some()
        || line
            .stages
            .last()
            .is_some_and(|stage| stage.output_to.is_some());
    if detached {
        if let Some(child) = last {
            reap_in_background(child);
        }
        return Ok(LineStatus::Detached);
    }

    let code = match last {
        Some(mut child) => match child.wait().await {
            Ok(status) => exit_code(status),
            Err(err) => {
                warn!(session = %state.id, error = %err, "failed to wait for stage");
                1
            }
        },
        None => EXIT_NOT_FOUND,
    };
    if let Err(err) = pump.await {
        debug!(error = %err, "terminal relay task ended abnormally");
    }
    debug!(session = %state.id, code, "pipeline finished");
    Ok(LineStatus::Finished(code))
}

fn dup(fd: &OwnedFd) -> Result<OwnedFd> {
    fd.try_clone()
        .map_err(|err| ShellError::resource_exhaustion("cannot duplicate pipe", err))
}

fn dup_endpoint(relay: &TerminalRelay) -> Result<OwnedFd> {
    relay
        .endpoint()
        .map_err(|err| ShellError::resource_exhaustion("cannot duplicate pipe", err))
}

/// Write end for tag `count`: the existing slot when a Line already targets
/// the same future Line, otherwise a fresh slot.
async fn numbered_writer(state: &mut SessionState, count: u16) -> Result<OwnedFd> {
    let exhausted = |err| ShellError::resource_exhaustion("cannot create numbered pipe", err);
    if let Some(writer) = state.numbered.writer(count).map_err(exhausted)? {
        return Ok(writer);
    }
    let config = &state.services.config;
    let (reader, writer) = with_retries(
        "numbered pipe",
        config.spawn_retries,
        config.spawn_retry_delay(),
        anon_pipe,
    )
    .await
    .map_err(exhausted)?;
    state.numbered.insert(count, reader, writer).map_err(exhausted)
}

/// Resolve `<src`. On failure the error is reported and the stage reads
/// from a null source.
async fn receive_user_pipe(state: &SessionState, src: SessionId, raw: &str) -> Option<OwnedFd> {
    match take_link(state, src) {
        Ok((sender, reader)) => {
            let me = state.display_name();
            state
                .broadcast(notice::received(
                    (&me, state.id),
                    (sender.display_name(), src),
                    raw,
                ))
                .await;
            Some(reader)
        }
        Err(err) => {
            state.report(&err).await;
            None
        }
    }
}

fn take_link(state: &SessionState, src: SessionId) -> Result<(SessionInfo, OwnedFd)> {
    let services = &state.services;
    let sender = services
        .sessions
        .lookup_by_id(src)
        .ok_or(ShellError::PeerNotFound { id: src })?;
    let reader = services.user_pipes.consume(src, state.id)?;
    Ok((sender, reader))
}

/// Resolve `>dst`. Resolution failures are reported and the stage writes to
/// a null sink; running out of descriptors aborts the pipeline.
async fn send_user_pipe(
    state: &SessionState,
    dst: SessionId,
    raw: &str,
) -> Result<Option<OwnedFd>> {
    match open_link(state, dst).await {
        Ok((receiver, writer)) => {
            let me = state.display_name();
            state
                .broadcast(notice::piped(
                    (&me, state.id),
                    (receiver.display_name(), dst),
                    raw,
                ))
                .await;
            Ok(Some(writer))
        }
        Err(err @ ShellError::ResourceExhaustion { .. }) => Err(err),
        Err(err) => {
            state.report(&err).await;
            Ok(None)
        }
    }
}

async fn open_link(state: &SessionState, dst: SessionId) -> Result<(SessionInfo, OwnedFd)> {
    let services = &state.services;
    let receiver = services
        .sessions
        .lookup_by_id(dst)
        .ok_or(ShellError::PeerNotFound { id: dst })?;
    let writer = services
        .user_pipes
        .create(
            state.id,
            dst,
            services.config.spawn_retries,
            services.config.spawn_retry_delay(),
        )
        .await?;
    Ok((receiver, writer))
}

async fn open_output_file(state: &SessionState, path: &Path) -> Option<OwnedFd> {
    let target = state.cwd.join(path);
    let opened = File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&target);
    match opened {
        Ok(file) => Some(OwnedFd::from(file)),
        Err(source) => {
            state
                .report(&ShellError::Redirect {
                    path: path.to_path_buf(),
                    source,
                })
                .await;
            None
        }
    }
}

fn stdio(fd: Option<OwnedFd>) -> Stdio {
    fd.map_or_else(Stdio::null, Stdio::from)
}

/// Spawn the process for `stage`. Returns `None` when the program cannot be
/// resolved; the notice then goes to the session, wherever the stage's
/// stderr was routed.
async fn spawn_stage(
    state: &SessionState,
    stage: &Stage,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: OwnedFd,
) -> Result<Option<Child>> {
    let name = stage.program();
    let search_path = state.env.get("PATH").cloned().unwrap_or_default();
    let program = match which::which_in(name, Some(&search_path), &state.cwd) {
        Ok(program) => program,
        Err(err) => {
            debug!(session = %state.id, program = name, error = %err, "program not found");
            drop(stderr);
            state
                .report(&ShellError::ProgramNotFound {
                    name: name.to_string(),
                })
                .await;
            return Ok(None);
        }
    };

    let mut command = Command::new(&program);
    command
        .arg0(name)
        .args(stage.args())
        .env_clear()
        .envs(&state.env)
        .current_dir(&state.cwd)
        .stdin(stdio(stdin))
        .stdout(stdio(stdout))
        .stderr(Stdio::from(stderr));
    kill_on_parent_death(&mut command);

    let config = &state.services.config;
    let spawned = with_retries(
        "spawn stage",
        config.spawn_retries,
        config.spawn_retry_delay(),
        || command.spawn(),
    )
    .await;
    // Closes the coordinator's copies of the stage's descriptors.
    drop(command);

    match spawned {
        Ok(child) => {
            debug!(session = %state.id, program = name, pid = child.id(), "stage spawned");
            Ok(Some(child))
        }
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ) =>
        {
            debug!(session = %state.id, program = name, error = %err, "exec failed");
            state
                .report(&ShellError::ProgramNotFound {
                    name: name.to_string(),
                })
                .await;
            Ok(None)
        }
        Err(err) => Err(ShellError::resource_exhaustion(
            format!("cannot spawn {name}"),
            err,
        )),
    }
}

fn reap_in_background(mut child: Child) {
    let pid = child.id();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(pid, code = exit_code(status), "stage exited"),
            Err(err) => debug!(error = %err, "failed to reap stage"),
        }
    });
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| EXIT_SIGNAL_BASE + status.signal().unwrap_or_default())
}

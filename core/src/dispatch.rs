//! Builtin commands. Only single-stage Lines reach this table.

use crate::error::ShellError;
use crate::executor::LineStatus;
use crate::mailbox::Audience;
use crate::notice;
use crate::parser::Stage;
use crate::session_id::SessionId;
use crate::shell::SessionState;

/// Run `stage` as a builtin. Returns `None` when it names a program instead.
pub(crate) async fn run_builtin(state: &mut SessionState, stage: &Stage) -> Option<LineStatus> {
    let args = stage.args();
    match stage.program() {
        "setenv" => {
            if let Some(var) = args.first() {
                let value = args.get(1).cloned().unwrap_or_default();
                state.env.insert(var.clone(), value);
            }
        }
        "printenv" => {
            if let Some(value) = args.first().and_then(|var| state.env.get(var)) {
                state.write(format!("{value}\n")).await;
            }
        }
        "exit" => return Some(LineStatus::Exit),
        "who" => {
            let sessions = state.services.sessions.list();
            state.write(notice::who_table(&sessions, state.id)).await;
        }
        "tell" => tell(state, stage).await,
        "yell" => {
            let text = notice::yelled(&state.display_name(), message_after(&stage.raw, 1));
            state.broadcast(text).await;
        }
        "name" => {
            if let Some(name) = args.first() {
                rename(state, name).await;
            }
        }
        _ => return None,
    }
    Some(LineStatus::Builtin)
}

async fn tell(state: &SessionState, stage: &Stage) {
    let Some(target) = stage
        .args()
        .first()
        .and_then(|id| id.parse().ok())
        .map(SessionId::new)
    else {
        return;
    };
    let services = &state.services;
    if !services.sessions.contains(target) {
        state.report(&ShellError::PeerNotFound { id: target }).await;
        return;
    }
    let text = notice::told(&state.display_name(), message_after(&stage.raw, 2));
    services
        .mailbox
        .publish(
            &services.sessions,
            state.id,
            text,
            Audience::One(target),
            false,
        )
        .await;
}

async fn rename(state: &SessionState, name: &str) {
    match state.services.sessions.rename(state.id, name) {
        Ok(info) => {
            state
                .broadcast(notice::renamed(info.addr, info.display_name()))
                .await;
        }
        Err(err) => state.report(&err).await,
    }
}

/// The text of `raw` after its first `skip` words, with inner spacing kept.
fn message_after(raw: &str, skip: usize) -> &str {
    let mut rest = raw.trim_start();
    for _ in 0..skip {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = rest[end..].trim_start();
    }
    rest
}

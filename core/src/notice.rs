//! Text of the notices sessions exchange. Every helper returns a complete,
//! newline-terminated line.

use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::registry::SessionInfo;
use crate::session_id::SessionId;

pub const PROMPT: &str = "% ";

pub const WELCOME_BANNER: &str = "\
****************************************
** Welcome to the information server. **
****************************************
";

pub fn login(name: &str, addr: SocketAddr) -> String {
    format!("*** User '{name}' entered from {addr}. ***\n")
}

pub fn logout(name: &str) -> String {
    format!("*** User '{name}' left. ***\n")
}

pub fn told(sender: &str, message: &str) -> String {
    format!("*** {sender} told you ***: {message}\n")
}

pub fn yelled(sender: &str, message: &str) -> String {
    format!("*** {sender} yelled ***: {message}\n")
}

pub fn renamed(addr: SocketAddr, name: &str) -> String {
    format!("*** User from {addr} is named '{name}'. ***\n")
}

pub fn received(me: (&str, SessionId), src: (&str, SessionId), raw: &str) -> String {
    format!(
        "*** {} (#{}) just received from {} (#{}) by '{raw}' ***\n",
        me.0, me.1, src.0, src.1
    )
}

pub fn piped(me: (&str, SessionId), dst: (&str, SessionId), raw: &str) -> String {
    format!(
        "*** {} (#{}) just piped '{raw}' to {} (#{}) ***\n",
        me.0, me.1, dst.0, dst.1
    )
}

/// Output of `who`: one row per session, ascending by id.
pub fn who_table(sessions: &[SessionInfo], me: SessionId) -> String {
    let mut table = String::from("<ID>\t<nickname>\t<IP:port>\t<indicate me>\n");
    for info in sessions {
        let marker = if info.id == me { "<-me" } else { "" };
        let _ = writeln!(
            table,
            "{}\t{}\t{}\t{marker}",
            info.id,
            info.display_name(),
            info.addr
        );
    }
    table
}

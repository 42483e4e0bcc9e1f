//! Splits one raw input line into independently executed [`Line`]s.
//!
//! A numbered pipe marker (`|N`) or error pipe marker (`!N`) ends a Line;
//! whatever follows it starts the next one. Inside a Line, `|` separates
//! stages, and each stage may carry user pipe tokens (`<N`, `>N`) and a file
//! redirection (`> path`).

use std::path::PathBuf;
use std::sync::LazyLock;

use regex_lite::Regex;

use crate::session_id::SessionId;

#[allow(clippy::expect_used)]
static LINE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[|!]([1-9][0-9]{0,3})").expect("valid marker pattern"));

#[allow(clippy::expect_used)]
static USER_PIPE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([<>])([1-9][0-9]{0,3})$").expect("valid token pattern"));

/// Numbered pipe attached to the last stage of a Line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeTag {
    /// How many Lines later the output is consumed.
    pub count: u16,
    /// `!N`: stderr goes into the pipe as well.
    pub merge_stderr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stage {
    /// Program name followed by its arguments.
    pub argv: Vec<String>,
    /// `<N`: read stdin from the user pipe sent by session N.
    pub input_from: Option<SessionId>,
    /// `>N`: send stdout through a user pipe to session N.
    pub output_to: Option<SessionId>,
    /// `> path`: write stdout to this file.
    pub output_file: Option<PathBuf>,
    /// The stage text as typed, trimmed.
    pub raw: String,
}

impl Stage {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Line {
    pub stages: Vec<Stage>,
    pub tag: Option<PipeTag>,
}

/// Parse one input line. Blank input yields no Lines.
pub fn parse(raw: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut rest = raw;

    while let Some(captures) = LINE_MARKER.captures(rest) {
        let (Some(marker), Some(digits)) = (captures.get(0), captures.get(1)) else {
            break;
        };
        let tag = digits.as_str().parse().ok().map(|count| PipeTag {
            count,
            merge_stderr: marker.as_str().starts_with('!'),
        });
        push_line(&mut lines, &rest[..marker.start()], tag);
        rest = &rest[marker.end()..];
    }
    push_line(&mut lines, rest, None);
    lines
}

fn push_line(lines: &mut Vec<Line>, text: &str, tag: Option<PipeTag>) {
    let stages: Vec<Stage> = text.split('|').filter_map(parse_stage).collect();
    if !stages.is_empty() {
        lines.push(Line { stages, tag });
    }
}

fn parse_stage(text: &str) -> Option<Stage> {
    let raw = text.trim();
    if raw.is_empty() {
        return None;
    }

    let mut stage = Stage {
        raw: raw.to_string(),
        ..Stage::default()
    };
    let mut tokens = raw.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == ">" {
            if let Some(path) = tokens.next() {
                stage.output_file = Some(PathBuf::from(path));
            }
            continue;
        }
        if let Some(captures) = USER_PIPE_TOKEN.captures(token) {
            let direction = captures.get(1).map(|m| m.as_str());
            let peer = captures
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .map(SessionId::new);
            match direction {
                Some("<") => stage.input_from = peer,
                Some(">") => stage.output_to = peer,
                _ => {}
            }
            continue;
        }
        stage.argv.push(token.to_string());
    }

    if stage.argv.is_empty() {
        return None;
    }
    Some(stage)
}

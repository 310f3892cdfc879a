//! Chat protocol messages and the two grammars that produce them
//!
//! Inbound lines follow the wire grammar:
//!
//! ```text
//! [@<tags> ][:<nick>[!<user>][@<host>] ]<command>[ <middle>...][ :<trailing>]
//! ```
//!
//! Lines typed by the operator (or produced by the generation backend) follow the
//! simpler authored grammar: `<COMMAND>[ <middle>][ <trailing...>]`, with the
//! identity fields supplied by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{ParseError, ParseResult};

/// Position of a message in the log. Assigned at submission, strictly increasing.
pub type SequenceId = u64;

/// One protocol exchange, inbound or outbound.
///
/// Absent optional parts are empty strings. `has_trailing` keeps the difference
/// between `PRIVMSG #a :` (empty trailing) and `PRIVMSG #a` (no trailing).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Raw tag section, without the leading `@`
    pub tags: String,
    /// Source nickname
    pub nick: String,
    /// Source username
    pub user: String,
    /// Source host
    pub host: String,
    /// Protocol verb or numeric reply code
    pub command: String,
    /// Space-joined positional arguments
    pub middle_params: String,
    /// Free-text payload
    pub trailing: String,
    /// Whether a trailing parameter was present, even if empty
    #[serde(default)]
    pub has_trailing: bool,
    /// Original wire line, or its canonical reconstruction for authored messages
    #[serde(default)]
    pub full_text: String,
    /// Log position, set once persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<SequenceId>,
    /// Commit time, set once persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// A message that carries nothing to send.
    pub fn noop() -> Self {
        Self::default()
    }

    /// True when there is no command, i.e. nothing to send or answer.
    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }

    /// Outbound send format: `command middle trailing` + CRLF.
    ///
    /// Fields are always joined with single spaces, even when empty, so
    /// `JOIN #room` goes out as `"JOIN #room \r\n"`.
    pub fn to_send_line(&self) -> String {
        format!(
            "{} {} {}\r\n",
            self.command, self.middle_params, self.trailing
        )
    }

    /// Canonical wire form (no terminator). Parsing it yields the same
    /// command, middle params and trailing.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.full_text.len().max(32));
        if !self.tags.is_empty() || self.command.starts_with('@') {
            out.push('@');
            out.push_str(&self.tags);
            out.push(' ');
        }
        if !self.nick.is_empty() {
            out.push(':');
            out.push_str(&self.nick);
            if !self.user.is_empty() {
                out.push('!');
                out.push_str(&self.user);
            }
            if !self.host.is_empty() {
                out.push('@');
                out.push_str(&self.host);
            }
            out.push(' ');
        }
        out.push_str(&self.command);
        if !self.middle_params.is_empty() {
            out.push(' ');
            out.push_str(&self.middle_params);
        }
        if self.has_trailing || !self.trailing.is_empty() {
            out.push_str(" :");
            out.push_str(&self.trailing);
        }
        out
    }

    /// Render as a chat-log line: `nick: command middle trailing`, skipping empty parts.
    pub fn transcript_line(&self) -> String {
        let content = [
            self.command.as_str(),
            self.middle_params.as_str(),
            self.trailing.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
        format!("{}: {}", self.nick, content)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = serde_json::json!({
            "tags": self.tags,
            "nick": self.nick,
            "user": self.user,
            "host": self.host,
            "command": self.command,
            "middle_params": self.middle_params,
            "trailing": self.trailing,
        });
        write!(f, "{value}")
    }
}

/// Parse one inbound protocol line.
pub fn parse_wire(raw: &str) -> ParseResult<Message> {
    let line = raw.trim();
    if line.is_empty() {
        return Err(ParseError::new(raw, "empty line"));
    }
    if line.contains(['\r', '\n']) {
        return Err(ParseError::new(raw, "embedded line terminator"));
    }

    let mut parser = WireParser::new(line);
    let mut message = Message {
        full_text: line.to_string(),
        ..Message::default()
    };

    parser.parse_tags(&mut message);
    parser.parse_prefix(&mut message);
    message.command = parser.take_token().to_string();
    if message.command.is_empty() {
        return Err(ParseError::new(raw, "missing command"));
    }
    parser.parse_params(&mut message);

    Ok(message)
}

/// Parse a locally authored command line, attributing it to `nick!user@host`.
pub fn parse_authored(raw: &str, nick: &str, user: &str, host: &str) -> ParseResult<Message> {
    let line = raw.trim();
    if line.contains(['\r', '\n']) {
        return Err(ParseError::new(raw, "embedded line terminator"));
    }

    let command_end = line
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(line.len());
    if command_end == 0 {
        return Err(ParseError::new(raw, "command must start with a letter"));
    }

    let mut message = Message {
        nick: nick.to_string(),
        user: user.to_string(),
        host: host.to_string(),
        command: line[..command_end].to_string(),
        ..Message::default()
    };

    let rest = &line[command_end..];
    if !rest.is_empty() {
        if !rest.starts_with(' ') {
            return Err(ParseError::new(raw, "command must be alphabetic"));
        }
        let rest = rest.trim_start_matches(' ');
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (token, after) = rest.split_at(token_end);
        if after.is_empty() {
            message.middle_params = token.to_string();
        } else if after.starts_with(' ') {
            message.middle_params = token.to_string();
            message.trailing = after.trim_start_matches(' ').to_string();
            message.has_trailing = true;
        } else {
            // No space after the first token: the whole remainder is free text.
            message.trailing = rest.to_string();
            message.has_trailing = true;
        }
    }

    message.full_text = message.to_wire();
    Ok(message)
}

/// Cursor over a trimmed wire line. Token boundaries are single ASCII spaces,
/// so every index it produces is a valid char boundary.
struct WireParser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> WireParser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn skip_spaces(&mut self) {
        while self.current() == Some(b' ') {
            self.index += 1;
        }
    }

    fn token_end(&self) -> usize {
        self.src[self.index..]
            .find(' ')
            .map_or(self.bytes.len(), |offset| self.index + offset)
    }

    fn take_token(&mut self) -> &'a str {
        let end = self.token_end();
        let token = &self.src[self.index..end];
        self.index = end;
        token
    }

    /// `@tags` counts only when followed by a space; otherwise the token is the command.
    fn parse_tags(&mut self, message: &mut Message) {
        if self.current() != Some(b'@') {
            return;
        }
        let end = self.token_end();
        if end == self.bytes.len() {
            return;
        }
        message.tags = self.src[self.index + 1..end].to_string();
        self.index = end;
        self.skip_spaces();
    }

    /// `:nick[!user][@host]` counts only when well formed and followed by a space;
    /// otherwise the token is the command.
    fn parse_prefix(&mut self, message: &mut Message) {
        if self.current() != Some(b':') {
            return;
        }
        let end = self.token_end();
        if end == self.bytes.len() {
            return;
        }
        let Some((nick, user, host)) = split_prefix(&self.src[self.index + 1..end]) else {
            return;
        };
        message.nick = nick.to_string();
        message.user = user.to_string();
        message.host = host.to_string();
        self.index = end;
        self.skip_spaces();
    }

    fn parse_params(&mut self, message: &mut Message) {
        let mut middle: Option<(usize, usize)> = None;
        loop {
            self.skip_spaces();
            if self.eof() {
                break;
            }
            if self.current() == Some(b':') {
                message.trailing = self.src[self.index + 1..].to_string();
                message.has_trailing = true;
                break;
            }
            let start = self.index;
            self.take_token();
            middle = Some(match middle {
                Some((first, _)) => (first, self.index),
                None => (start, self.index),
            });
        }
        if let Some((start, end)) = middle {
            message.middle_params = self.src[start..end].to_string();
        }
    }
}

fn split_prefix(prefix: &str) -> Option<(&str, &str, &str)> {
    if prefix.chars().any(char::is_whitespace) {
        return None;
    }

    let nick_end = prefix.find(['!', '@']).unwrap_or(prefix.len());
    let (nick, mut rest) = prefix.split_at(nick_end);
    if nick.is_empty() {
        return None;
    }

    let mut user = "";
    if let Some(after_bang) = rest.strip_prefix('!') {
        let user_end = after_bang.find('@').unwrap_or(after_bang.len());
        if user_end == 0 {
            return None;
        }
        user = &after_bang[..user_end];
        rest = &after_bang[user_end..];
    }

    let mut host = "";
    if let Some(after_at) = rest.strip_prefix('@') {
        if after_at.is_empty() {
            return None;
        }
        host = after_at;
        rest = "";
    }

    rest.is_empty().then_some((nick, user, host))
}

//! Operator console input
//!
//! Lines typed locally are authored commands (`JOIN #room`, `PRIVMSG #room hi`)
//! and go out through the same send path as generated replies.

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::bus::{Event, EventBus};
use super::message::parse_authored;

/// Read authored commands from `input` until EOF, publishing each as a send request.
pub async fn run_operator_input<R>(input: R, bus: EventBus, nick: String, user: String) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_authored(&line, &nick, &user, "localhost") {
            Ok(message) => bus.publish(Event::SendRequest { message }),
            Err(err) => tracing::warn!(error = %err, "ignoring operator input"),
        }
    }
    tracing::debug!("operator input closed");
    Ok(())
}

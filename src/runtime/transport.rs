//! Byte-stream adapter for the chat protocol
//!
//! Frames inbound bytes into lines, answers `PING` probes itself and publishes
//! every other line as [`Event::MessageReceived`]. Outbound lines go through a
//! queue drained by a dedicated writer task, so senders never touch the socket.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use super::bus::{Event, EventBus};
use super::error::{TransportError, TransportResult};
use super::message::{Message, parse_wire};

/// Longest inbound line accepted, terminator included.
pub const MAX_LINE_LEN: usize = 8192;

/// Cloneable sending side of a transport.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    /// Queue `message` in the outbound send format.
    pub fn send(&self, message: &Message) -> TransportResult<()> {
        self.send_raw(message.to_send_line())
    }

    /// Queue a preformatted line; it must carry its own CRLF.
    pub fn send_raw(&self, line: String) -> TransportResult<()> {
        self.tx.send(line).map_err(|_| TransportError::Closed)
    }
}

/// Answer to a liveness probe, or `None` if `line` is not one.
pub fn pong_for(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("PING") {
        return None;
    }
    Some(match tokens.next() {
        Some(argument) => format!("PONG {argument}\r\n"),
        None => "PONG\r\n".to_string(),
    })
}

/// One protocol session over a byte stream.
pub struct Transport<R> {
    reader: BufReader<R>,
    outbound: Outbound,
}

impl Transport<OwnedReadHalf> {
    /// Open a TCP session to `server:port`.
    pub async fn connect(server: &str, port: u16) -> TransportResult<Self> {
        let stream = TcpStream::connect((server, port)).await?;
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        tracing::info!(server, port, "connected");
        Ok(Self::new(reader, writer))
    }
}

impl<R> Transport<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Wrap an already open stream. Must be called inside a Tokio runtime.
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(writer, rx));
        Self {
            reader: BufReader::new(reader),
            outbound: Outbound { tx },
        }
    }

    /// Handle for sending on this session
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Send the session registration lines.
    pub fn register(&self, nick: &str, realname: &str, username: &str) -> TransportResult<()> {
        self.outbound
            .send_raw(format!("USER {username} 0 * :{realname}\r\n"))?;
        self.outbound.send_raw(format!("NICK {nick}\r\n"))
    }

    /// Next non-probe line without its terminator, or `None` once the peer closes.
    ///
    /// Lines longer than [`MAX_LINE_LEN`] are discarded whole.
    pub async fn next_line(&mut self) -> TransportResult<Option<String>> {
        let mut buf = Vec::with_capacity(512);
        loop {
            buf.clear();
            let read = (&mut self.reader)
                .take(MAX_LINE_LEN as u64)
                .read_until(b'\n', &mut buf)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if read == MAX_LINE_LEN && buf.last() != Some(&b'\n') {
                tracing::warn!(limit = MAX_LINE_LEN, "discarding over-long line");
                self.skip_rest_of_line().await?;
                continue;
            }

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            if let Some(pong) = pong_for(line) {
                tracing::trace!(probe = line, "answering ping");
                self.outbound.send_raw(pong)?;
                continue;
            }
            return Ok(Some(line.to_string()));
        }
    }

    async fn skip_rest_of_line(&mut self) -> TransportResult<()> {
        loop {
            let (used, done) = {
                let chunk = self.reader.fill_buf().await?;
                match chunk.iter().position(|b| *b == b'\n') {
                    Some(end) => (end + 1, true),
                    None => (chunk.len(), chunk.is_empty()),
                }
            };
            self.reader.consume(used);
            if done {
                return Ok(());
            }
        }
    }

    /// Read until the stream closes, publishing each parsed line.
    ///
    /// Unparsable lines are logged and skipped. Returns `Ok` on a clean close
    /// and the I/O error otherwise; either way the session is over.
    pub async fn run(mut self, bus: EventBus) -> TransportResult<()> {
        loop {
            match self.next_line().await {
                Ok(Some(line)) => match parse_wire(&line) {
                    Ok(message) => bus.publish(Event::MessageReceived { message }),
                    Err(err) => tracing::warn!(error = %err, "dropping unparsable line"),
                },
                Ok(None) => {
                    tracing::info!("disconnected from server");
                    break Ok(());
                }
                Err(err) => {
                    tracing::error!(error = %err, "transport read failed");
                    break Err(err);
                }
            }
        }
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::error!(error = %err, "transport write failed");
            return;
        }
    }
    writer.shutdown().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bus::EventKind;
    use crate::runtime::message::parse_authored;
    use tokio::io::{AsyncReadExt, duplex};

    #[test]
    fn pong_uses_first_argument() {
        assert_eq!(pong_for("PING abc123").as_deref(), Some("PONG abc123\r\n"));
        assert_eq!(pong_for("PING :irc.example.net").as_deref(), Some("PONG :irc.example.net\r\n"));
        assert_eq!(pong_for("PING").as_deref(), Some("PONG\r\n"));
        assert_eq!(pong_for("PINGER x"), None);
        assert_eq!(pong_for(":srv PING x"), None);
    }

    #[tokio::test]
    async fn ping_is_answered_once_and_never_published() {
        let (client, mut server) = duplex(4096);
        let (read, write) = tokio::io::split(client);
        let transport = Transport::new(read, write);

        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::MessageReceived, move |event| {
            let tx = tx.clone();
            async move {
                if let Event::MessageReceived { message } = event {
                    tx.send(message).ok();
                }
                Ok::<(), anyhow::Error>(())
            }
        });

        server
            .write_all(b"PING abc123\r\n:alice!a@h PRIVMSG #room :hello there\r\n\r\n")
            .await
            .unwrap();
        server.shutdown().await.unwrap();

        transport.run(bus.clone()).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.nick, "alice");
        assert_eq!(message.trailing, "hello there");

        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "PONG abc123\r\n");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn over_long_lines_are_dropped() {
        let (client, mut server) = duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);
        let mut transport = Transport::new(read, write);

        let mut input = vec![b'x'; MAX_LINE_LEN * 2];
        input.extend_from_slice(b"\r\n:alice!a@h PRIVMSG #room :still here\r\n");
        server.write_all(&input).await.unwrap();
        server.shutdown().await.unwrap();

        assert_eq!(
            transport.next_line().await.unwrap().as_deref(),
            Some(":alice!a@h PRIVMSG #room :still here")
        );
        assert_eq!(transport.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn sends_registration_and_messages() {
        let (client, mut server) = duplex(4096);
        let (read, write) = tokio::io::split(client);
        let transport = Transport::new(read, write);

        transport.register("lain", "And I am me.", "lain").unwrap();
        let join = parse_authored("JOIN #room", "lain", "lain", "localhost").unwrap();
        transport.outbound().send(&join).unwrap();
        drop(transport);

        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert_eq!(
            written,
            "USER lain 0 * :And I am me.\r\nNICK lain\r\nJOIN #room \r\n"
        );
    }
}

//! Stdio transport: newline-delimited JSON over a pair of byte streams.
//!
//! The streams can be this process's stdin/stdout, the pipes of a spawned
//! subprocess, or any `AsyncRead`/`AsyncWrite` pair (a socket half, an
//! in-memory duplex).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, trace, warn};

use super::{lock, EventReceiver, FrameSink, Transport, TransportCore, TransportState, WriteQueue};
use crate::error::{Error, Result};
use crate::mcp::codec::{self, Message};

/// Upper bound for a single line.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Source {
    Process,
    Streams(BoxedReader, BoxedWriter),
    Command { program: String, args: Vec<String> },
}

/// Stdio transport for MCP.
pub struct StdioTransport {
    core: Arc<TransportCore>,
    source: Mutex<Option<Source>>,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<WriteQueue>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Transport over this process's stdin and stdout.
    pub fn new() -> Self {
        Self::with_source(Source::Process)
    }

    /// Transport over an arbitrary reader/writer pair.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_source(Source::Streams(Box::new(reader), Box::new(writer)))
    }

    /// Transport over the pipes of `program`, spawned on connect and killed on disconnect.
    pub fn command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_source(Source::Command {
            program: program.into(),
            args,
        })
    }

    fn with_source(source: Source) -> Self {
        Self {
            core: Arc::new(TransportCore::new("stdio")),
            source: Mutex::new(Some(source)),
            child: Mutex::new(None),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    fn open(&self, source: Source) -> Result<(BoxedReader, BoxedWriter)> {
        match source {
            Source::Process => Ok((
                Box::new(tokio::io::stdin()),
                Box::new(tokio::io::stdout()),
            )),
            Source::Streams(reader, writer) => Ok((reader, writer)),
            Source::Command { program, args } => {
                info!("Spawning MCP subprocess: {} {:?}", program, args);
                let mut child = Command::new(&program)
                    .args(&args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Transport("subprocess stdin unavailable".to_string()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Transport("subprocess stdout unavailable".to_string()))?;
                *lock(&self.child) = Some(child);
                Ok((Box::new(stdout), Box::new(stdin)))
            }
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct LineSink {
    inner: FramedWrite<BoxedWriter, LinesCodec>,
}

#[async_trait]
impl FrameSink for LineSink {
    async fn write_frame(&mut self, frame: String) -> Result<()> {
        trace!("stdio send: {}", frame);
        self.inner.send(frame).await.map_err(lines_error)
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::<String>::close(&mut self.inner)
            .await
            .map_err(lines_error)
    }
}

fn lines_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Transport(format!("line exceeds {} bytes", MAX_LINE_BYTES))
        }
    }
}

async fn read_loop(core: Arc<TransportCore>, reader: BoxedReader) {
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        match lines.next().await {
            Some(Ok(line)) => core.emit_frame(&line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("stdio: discarding oversized line");
                core.emit_error(lines_error(LinesCodecError::MaxLineLengthExceeded));
            }
            Some(Err(LinesCodecError::Io(e))) => {
                error!("stdio: read failed: {}", e);
                core.emit_error(Error::Io(e));
                break;
            }
            None => {
                debug!("EOF on stdio input");
                break;
            }
        }
    }

    let intentional = matches!(
        core.state(),
        TransportState::Disconnecting | TransportState::Disconnected
    );
    if !intentional {
        core.emit_error(Error::ConnectionClosed("end of input stream".to_string()));
    }
    core.set_state(TransportState::Disconnected);
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        self.core.kind()
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn take_events(&self) -> Option<EventReceiver> {
        self.core.take_events()
    }

    async fn connect(&self) -> Result<()> {
        self.core
            .transition(&[TransportState::Disconnected], TransportState::Connecting)?;

        let source = lock(&self.source).take();
        let opened = match source {
            Some(source) => self.open(source),
            None => Err(Error::Transport(
                "stdio streams were already consumed".to_string(),
            )),
        };
        let (reader, writer) = match opened {
            Ok(streams) => streams,
            Err(e) => {
                self.core.set_state(TransportState::Error);
                return Err(e);
            }
        };

        let (queue, _writer_task) = WriteQueue::spawn(LineSink {
            inner: FramedWrite::new(writer, LinesCodec::new()),
        });
        *lock(&self.writer) = Some(queue);

        // Connected before the reader starts so an immediate EOF is reported.
        self.core.set_state(TransportState::Connected);
        let task = tokio::spawn(read_loop(self.core.clone(), reader));
        *lock(&self.reader_task) = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.core.state() == TransportState::Disconnected {
            return Ok(());
        }
        self.core.set_state(TransportState::Disconnecting);

        // Dropping the queue lets the writer flush and close.
        lock(&self.writer).take();
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!("failed to kill MCP subprocess: {}", e);
            }
        }

        self.core.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.core.ensure_connected()?;
        let queue = lock(&self.writer)
            .clone()
            .ok_or_else(|| Error::ConnectionClosed("stdio writer closed".to_string()))?;
        queue.write(codec::encode_line(&message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::RequestId;
    use crate::transport::TransportEvent;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn next_message(events: &mut EventReceiver) -> Message {
        loop {
            match events.recv().await.expect("event stream ended") {
                TransportEvent::Message(msg) => return msg,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_send_writes_one_line_per_message() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let transport = StdioTransport::from_streams(server_read, server_write);
        transport.connect().await.unwrap();

        transport
            .send(Message::notification("notifications/initialized", None))
            .await
            .unwrap();
        transport
            .send(Message::request(RequestId::from("s-1"), "ping", None))
            .await
            .unwrap();

        let mut lines = BufReader::new(client_end).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let second = lines.next_line().await.unwrap().unwrap();
        assert!(first.contains("notifications/initialized"));
        assert!(second.contains("\"id\":\"s-1\""));
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_reader() {
        let (mut client_end, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let transport = StdioTransport::from_streams(server_read, server_write);
        let mut events = transport.take_events().unwrap();
        transport.connect().await.unwrap();

        client_end
            .write_all(b"this is not json\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":7}\n")
            .await
            .unwrap();

        let mut saw_error = false;
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Error(Error::Parse(_)) => saw_error = true,
                TransportEvent::Message(msg) => {
                    assert_eq!(msg.method(), Some("ping"));
                    assert_eq!(msg.id(), Some(&RequestId::Number(7)));
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_error);
        assert_eq!(transport.state(), TransportState::Connected);
    }

    #[tokio::test]
    async fn test_eof_disconnects_with_connection_closed() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let transport = StdioTransport::from_streams(server_read, server_write);
        let mut events = transport.take_events().unwrap();
        transport.connect().await.unwrap();

        drop(client_end);

        let mut saw_closed = false;
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Error(e) if e.is_connection_closed() => saw_closed = true,
                TransportEvent::StateChanged { new, .. } if new == TransportState::Disconnected => {
                    break
                }
                _ => {}
            }
        }
        assert!(saw_closed);
        assert!(transport
            .send(Message::notification("x", None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_explicit_disconnect_is_quiet() {
        let (_client_end, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let transport = StdioTransport::from_streams(server_read, server_write);
        let mut events = transport.take_events().unwrap();
        transport.connect().await.unwrap();

        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TransportEvent::Error(_)));
        }
        assert!(transport.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_message_roundtrip_between_two_transports() {
        let (a, b) = tokio::io::duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let left = StdioTransport::from_streams(a_read, a_write);
        let right = StdioTransport::from_streams(b_read, b_write);
        let mut right_events = right.take_events().unwrap();
        left.connect().await.unwrap();
        right.connect().await.unwrap();

        left.send(Message::response(
            RequestId::from("c-1"),
            serde_json::json!({"ok": true}),
        ))
        .await
        .unwrap();

        let msg = next_message(&mut right_events).await;
        assert_eq!(msg.id(), Some(&RequestId::from("c-1")));
    }
}

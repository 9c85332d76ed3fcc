//! Duplex relay between a pseudo-terminal and a WebSocket.
//!
//! Two pumps move bytes, one per direction:
//!
//! - [`pump_output`] reads the PTY on the blocking pool and sends each chunk
//!   as one binary message. It runs as its own task.
//! - [`pump_input`] runs on the session task, reading one message at a time.
//!   Binary payloads go to the PTY verbatim; text payloads go to the control
//!   decoder and are never written to the process.
//!
//! Neither pump buffers beyond one chunk: the next read is not issued until
//! the previous chunk has been accepted by the peer, so a slow consumer
//! throttles its producer. Both pumps stop as soon as the session starts
//! tearing down, and neither closes anything itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::Frame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::control::{self, ControlOutcome};
use super::lifecycle::{Lifecycle, TerminationReason};
use super::pty::{PtyHost, PtyReader, PtyWriter, ReadOutcome};

/// Default size of one PTY read, and so the largest outbound binary message.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Traffic counters shared by both pumps.
#[derive(Debug)]
pub struct Activity {
    /// Last activity timestamp (Unix epoch milliseconds).
    last_activity: AtomicU64,
    /// Bytes written to the process.
    bytes_in: AtomicU64,
    /// Bytes sent to the client.
    bytes_out: AtomicU64,
}

impl Activity {
    /// Creates counters with the activity clock set to now.
    pub fn new() -> Self {
        Self {
            last_activity: AtomicU64::new(now_millis()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Marks activity without moving any bytes.
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Records bytes relayed from the client to the process.
    pub fn record_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Records bytes relayed from the process to the client.
    pub fn record_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Total bytes written to the process.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes sent to the client.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the current Unix timestamp in milliseconds.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An inbound WebSocket message, classified by its transport tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Terminal bytes or a structured message.
    Frame(Frame),
    /// The client started the close handshake.
    Close,
    /// Keepalive or low-level frame; nothing to relay.
    Skip,
}

/// Classifies a message before any payload inspection.
pub fn classify(message: Message) -> Inbound {
    match message {
        Message::Binary(bytes) => Inbound::Frame(Frame::Raw(bytes)),
        Message::Text(text) => Inbound::Frame(Frame::Structured(text)),
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Skip,
    }
}

/// Converts an outbound frame to a WebSocket message.
pub fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Raw(bytes) => Message::Binary(bytes),
        Frame::Structured(text) => Message::Text(text),
    }
}

/// Pumps process output to the client (direction A).
///
/// Returns the sink once the pump stops so the lifecycle manager can close
/// the transport.
pub async fn pump_output<S>(
    mut reader: PtyReader,
    mut sink: S,
    lifecycle: &Lifecycle,
    activity: &Activity,
    chunk_size: usize,
) -> S
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let session_id = lifecycle.id();

    loop {
        let read = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; chunk_size];
            let result = reader.read(&mut buffer);
            (reader, buffer, result)
        });

        // An abandoned read finishes on its own once teardown kills the process.
        let (returned, mut buffer, result) = tokio::select! {
            _ = lifecycle.terminating() => break,
            joined = read => match joined {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Read task panicked");
                    lifecycle.begin_teardown(TerminationReason::ProcessIo);
                    break;
                }
            },
        };
        reader = returned;

        match result {
            Ok(ReadOutcome::Data(n)) => {
                buffer.truncate(n);
                activity.record_out(n);

                tokio::select! {
                    _ = lifecycle.terminating() => break,
                    sent = sink.send(Message::Binary(buffer)) => {
                        if let Err(e) = sent {
                            tracing::debug!(
                                session_id = %session_id,
                                error = %e,
                                "Failed to send terminal output"
                            );
                            lifecycle.begin_teardown(TerminationReason::Transport);
                            break;
                        }
                    }
                }
            }
            Ok(ReadOutcome::Eof) => {
                tracing::info!(session_id = %session_id, "PTY EOF - process exited");
                lifecycle.begin_teardown(TerminationReason::ProcessExited);
                break;
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Error reading from PTY");
                lifecycle.begin_teardown(TerminationReason::ProcessIo);
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Output pump stopped");
    sink
}

/// Pumps client input to the process (direction B).
pub async fn pump_input<S>(
    mut stream: S,
    mut writer: PtyWriter,
    host: &PtyHost,
    lifecycle: &Lifecycle,
    activity: &Activity,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let session_id = lifecycle.id();

    loop {
        let next = tokio::select! {
            _ = lifecycle.terminating() => break,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::debug!(session_id = %session_id, error = %e, "WebSocket receive error");
                lifecycle.begin_teardown(TerminationReason::Transport);
                break;
            }
            None => {
                tracing::debug!(session_id = %session_id, "WebSocket stream ended");
                lifecycle.begin_teardown(TerminationReason::ClientClosed);
                break;
            }
        };

        match classify(message) {
            Inbound::Frame(Frame::Raw(bytes)) => {
                let len = bytes.len();
                let write = tokio::task::spawn_blocking(move || {
                    let result = writer.write(&bytes);
                    (writer, result)
                });

                let (returned, result) = tokio::select! {
                    _ = lifecycle.terminating() => break,
                    joined = write => match joined {
                        Ok(parts) => parts,
                        Err(e) => {
                            tracing::error!(session_id = %session_id, error = %e, "Write task panicked");
                            lifecycle.begin_teardown(TerminationReason::ProcessIo);
                            break;
                        }
                    },
                };
                writer = returned;

                if let Err(e) = result {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to write to PTY");
                    lifecycle.begin_teardown(TerminationReason::ProcessIo);
                    break;
                }
                activity.record_in(len);
            }
            Inbound::Frame(Frame::Structured(text)) => {
                activity.touch();
                if let ControlOutcome::Resize { cols, rows, applied } = control::apply(&text, host) {
                    tracing::debug!(
                        session_id = %session_id,
                        cols = cols,
                        rows = rows,
                        applied = applied,
                        "Resize requested"
                    );
                }
            }
            Inbound::Close => {
                tracing::debug!(session_id = %session_id, "Client closed the connection");
                lifecycle.begin_teardown(TerminationReason::ClientClosed);
                break;
            }
            Inbound::Skip => activity.touch(),
        }
    }

    tracing::debug!(session_id = %session_id, "Input pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::PtyOptions;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server, client) = tokio::io::duplex(256 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (server, client)
    }

    #[test]
    fn test_classify_dispatches_on_tag() {
        // Binary that happens to look like JSON is still terminal input.
        let json_bytes = br#"{"type":"resize","cols":1,"rows":1}"#.to_vec();
        assert_eq!(
            classify(Message::Binary(json_bytes.clone())),
            Inbound::Frame(Frame::Raw(json_bytes))
        );
        assert_eq!(
            classify(Message::Text("hello".to_string())),
            Inbound::Frame(Frame::Structured("hello".to_string()))
        );
        assert_eq!(classify(Message::Close(None)), Inbound::Close);
        assert_eq!(classify(Message::Ping(vec![1])), Inbound::Skip);
        assert_eq!(classify(Message::Pong(vec![])), Inbound::Skip);
    }

    #[test]
    fn test_to_message() {
        assert_eq!(
            to_message(Frame::Raw(b"ls\n".to_vec())),
            Message::Binary(b"ls\n".to_vec())
        );
        assert!(matches!(
            to_message(Frame::resize(80, 24).unwrap()),
            Message::Text(_)
        ));
    }

    #[test]
    fn test_activity_counters() {
        let activity = Activity::new();
        activity.record_in(3);
        activity.record_out(10);
        activity.record_out(5);

        assert_eq!(activity.bytes_in(), 3);
        assert_eq!(activity.bytes_out(), 15);
        assert!(activity.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_output_pump_forwards_until_exit() {
        let (server, mut client) = ws_pair().await;
        let options = PtyOptions::new("/bin/sh").with_args(["-c", "printf relay_output_marker"]);
        let (_host, reader, _writer) = PtyHost::start(&options).unwrap();

        let lifecycle = Lifecycle::new("relay-test".to_string());
        lifecycle.activate();
        let activity = Activity::new();

        let pumped = timeout(
            Duration::from_secs(10),
            pump_output(reader, server, &lifecycle, &activity, READ_BUFFER_SIZE),
        )
        .await;
        assert!(pumped.is_ok(), "output pump did not stop at EOF");
        assert_eq!(lifecycle.reason(), Some(TerminationReason::ProcessExited));

        let mut received = Vec::new();
        while let Ok(Some(Ok(Message::Binary(bytes)))) =
            timeout(Duration::from_millis(200), client.next()).await
        {
            received.extend_from_slice(&bytes);
        }
        assert_eq!(String::from_utf8_lossy(&received), "relay_output_marker");
        assert_eq!(activity.bytes_out(), received.len() as u64);
    }

    #[tokio::test]
    async fn test_output_pump_stops_on_teardown() {
        let (server, _client) = ws_pair().await;
        let (host, reader, _writer) = PtyHost::start(&PtyOptions::new("/bin/sh")).unwrap();

        let lifecycle = Lifecycle::new("relay-test".to_string());
        lifecycle.activate();
        let activity = Activity::new();

        let pump = pump_output(reader, server, &lifecycle, &activity, READ_BUFFER_SIZE);
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            lifecycle.begin_teardown(TerminationReason::Shutdown);
        };

        let (pumped, _) = timeout(Duration::from_secs(5), async { tokio::join!(pump, trigger) })
            .await
            .expect("output pump ignored teardown");
        drop(pumped);
        assert_eq!(lifecycle.reason(), Some(TerminationReason::Shutdown));
        host.close();
    }

    #[tokio::test]
    async fn test_input_pump_diverts_text_frames() {
        let (server, mut client) = ws_pair().await;
        let (host, _reader, writer) = PtyHost::start(&PtyOptions::new("/bin/sh")).unwrap();

        let lifecycle = Lifecycle::new("relay-test".to_string());
        lifecycle.activate();
        let activity = Activity::new();

        client
            .send(Message::Text(
                r#"{"type":"resize","cols":132,"rows":43}"#.to_string(),
            ))
            .await
            .unwrap();
        client.send(Message::Text("garbage".to_string())).await.unwrap();
        client.send(Message::Binary(b"ls\n".to_vec())).await.unwrap();
        client.send(Message::Close(None)).await.unwrap();

        let (_sink, stream) = server.split();
        timeout(
            Duration::from_secs(5),
            pump_input(stream, writer, &host, &lifecycle, &activity),
        )
        .await
        .expect("input pump did not stop on close");

        assert_eq!(host.size(), Some((132, 43)));
        assert_eq!(activity.bytes_in(), 3);
        assert_eq!(lifecycle.reason(), Some(TerminationReason::ClientClosed));
        host.close();
    }
}

//! Terminal client.
//!
//! [`TerminalClient`] speaks the bridge protocol over tokio-tungstenite:
//! binary frames carry keystrokes and output, text frames carry control
//! envelopes. [`attach`] wires a client to the local terminal.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use protocol::{ErrorNotice, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::session::relay::{self, READ_BUFFER_SIZE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Terminal output bytes.
    Output(Vec<u8>),
    /// The server reported an error, such as a failed spawn.
    Error(String),
    /// The connection is closed.
    Closed,
}

/// A connected terminal client.
pub struct TerminalClient {
    ws: WsStream,
}

impl TerminalClient {
    /// Connects to a terminal endpoint such as `ws://127.0.0.1:3010/api/terminal/ws`.
    pub async fn connect(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
        if parsed.scheme() != "ws" {
            bail!("Unsupported URL scheme '{}', expected ws://", parsed.scheme());
        }

        let (ws, response) = connect_async(parsed.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        debug!(url = %url, status = %response.status(), "Connected to terminal server");

        Ok(Self { ws })
    }

    /// Sends a frame.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.ws
            .send(relay::to_message(frame))
            .await
            .context("Failed to send frame")
    }

    /// Sends keystrokes or other raw input.
    pub async fn send_input(&mut self, data: &[u8]) -> Result<()> {
        self.send_frame(Frame::Raw(data.to_vec())).await
    }

    /// Asks the server to resize the terminal.
    pub async fn send_resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        let frame = Frame::resize(cols, rows)?;
        self.send_frame(frame).await
    }

    /// Waits for the next event.
    ///
    /// Text frames that are not error notices are skipped.
    pub async fn recv(&mut self) -> Result<ClientEvent> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(ClientEvent::Output(bytes)),
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = decode_notice(&text) {
                        return Ok(event);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(ClientEvent::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Failed to receive from server"),
            }
        }
    }

    /// Sends a close frame and waits for the handshake to finish.
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await.context("Failed to close connection")?;
        while let Some(Ok(_)) = self.ws.next().await {}
        Ok(())
    }
}

fn decode_notice(text: &str) -> Option<ClientEvent> {
    ErrorNotice::from_json(text)
        .ok()
        .map(|notice| ClientEvent::Error(notice.error))
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Reads stdin on its own task; the channel closes at end of input.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}

/// Attaches the local terminal to a remote shell until either side closes.
///
/// Returns the server's error notice, if one was received.
pub async fn attach(url: &str) -> Result<Option<String>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut client = TerminalClient::connect(url).await?;
    let _raw = RawModeGuard::enable()?;

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    client.send_resize(cols, rows).await?;

    let (mut sink, mut stream) = client.ws.split();
    let mut stdout = tokio::io::stdout();
    let mut winch =
        signal(SignalKind::window_change()).context("Failed to install SIGWINCH handler")?;
    let mut input = spawn_stdin_reader();
    let mut notice = None;

    loop {
        tokio::select! {
            chunk = input.recv() => {
                let Some(chunk) = chunk else {
                    break;
                };
                sink.send(Message::Binary(chunk))
                    .await
                    .context("Failed to send input")?;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Binary(bytes))) => {
                    stdout.write_all(&bytes).await.context("Failed to write stdout")?;
                    stdout.flush().await.context("Failed to flush stdout")?;
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(ClientEvent::Error(message)) = decode_notice(&text) {
                        notice = Some(message);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Connection lost"),
            },
            _ = winch.recv() => {
                if let Some(frame) = crossterm::terminal::size()
                    .ok()
                    .and_then(|(cols, rows)| Frame::resize(cols, rows).ok())
                {
                    sink.send(relay::to_message(frame))
                        .await
                        .context("Failed to send resize")?;
                }
            }
        }
    }

    let _ = sink.close().await;
    Ok(notice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_notice() {
        assert_eq!(
            decode_notice(r#"{"error":"failed to start terminal"}"#),
            Some(ClientEvent::Error("failed to start terminal".to_string()))
        );
        assert_eq!(decode_notice(r#"{"type":"resize","cols":1,"rows":1}"#), None);
        assert_eq!(decode_notice("plain text"), None);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_urls() {
        assert!(TerminalClient::connect("not a url").await.is_err());

        let err = TerminalClient::connect("http://127.0.0.1:3010/api/terminal/ws")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unsupported URL scheme"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("ws://{}/api/terminal/ws", addr);
        assert!(TerminalClient::connect(&url).await.is_err());
    }
}

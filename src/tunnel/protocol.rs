//! Session protocol: newline-delimited JSON over the secured stream.
//!
//! The relay opens every connection with a `challenge`. Control
//! connections answer with `hello`; data connections answer with `attach`
//! and then carry raw bytes.

use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use super::TunnelError;

/// Longest control line accepted from the relay.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Byte stream to the relay, plain or TLS.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

/// Boxed relay stream.
pub type BoxedStream = Box<dyn RelayStream>;

/// Messages sent by the relay.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Opens every connection.
    Challenge {
        /// Random value the client signs.
        nonce: String,
    },
    /// The identity was accepted.
    Welcome {
        /// Session identifier used by data connections.
        client_id: String,
    },
    /// The identity was refused.
    Rejected {
        /// Human readable reason.
        reason: String,
    },
    /// A hostname is now routed to this session.
    Bound {
        /// Service name.
        service: String,
        /// Service port.
        port: u16,
        /// Public URL.
        url: String,
    },
    /// Liveness check.
    Ping,
    /// A visitor connected; open a data connection for it.
    Connect {
        /// Relay-side connection id.
        connection_id: String,
        /// Service port the visitor targets.
        port: u16,
    },
}

/// Messages sent by the client.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Answers the challenge on a control connection.
    Hello {
        /// Environment the session belongs to.
        environment_id: String,
        /// Base64 Ed25519 public key.
        public_key: String,
        /// Base64 signature over `nonce || environment_id`.
        signature: String,
    },
    /// Requests a hostname for one service port.
    Bind {
        /// Service name.
        service: String,
        /// Service port.
        port: u16,
        /// Requested hostname label.
        hostname: String,
    },
    /// Answers `ping`.
    Pong,
    /// Claims a visitor connection on a data connection.
    Attach {
        /// Relay-side connection id.
        connection_id: String,
        /// Session identifier from `welcome`.
        client_id: String,
    },
    /// Declines a `connect` for a port the session never bound.
    Refuse {
        /// Relay-side connection id.
        connection_id: String,
        /// Why the connection was declined.
        reason: String,
    },
    /// Ends the session.
    Close,
}

/// Line-framed message channel over a relay stream.
///
/// The partially read line lives in the struct so `recv` can be raced
/// in `select!` without losing data.
pub struct Channel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    line: String,
}

impl<S: AsyncRead + AsyncWrite> Channel<S> {
    /// Wraps `stream`.
    pub fn new(stream: S) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer,
            line: String::new(),
        }
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Disconnected`] when the write fails.
    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<(), TunnelError> {
        let mut encoded = serde_json::to_vec(message)
            .map_err(|err| TunnelError::Protocol(format!("encoding failed: {err}")))?;
        encoded.push(b'\n');
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receives one message.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Disconnected`] at end of stream and
    /// [`TunnelError::Protocol`] for oversized or malformed lines.
    pub async fn recv<M: for<'de> Deserialize<'de>>(&mut self) -> Result<M, TunnelError> {
        loop {
            let read = self.reader.read_line(&mut self.line).await?;
            if self.line.len() > MAX_LINE_BYTES {
                return Err(TunnelError::Protocol(String::from("control line too long")));
            }
            if read == 0 && !self.line.ends_with('\n') {
                return Err(TunnelError::Disconnected(String::from("end of stream")));
            }
            let line = std::mem::take(&mut self.line);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|err| TunnelError::Protocol(format!("unexpected message {trimmed}: {err}")));
        }
    }

    /// Reassembles the stream. Buffered but unread bytes are dropped, so
    /// only call this at a message boundary.
    pub fn into_inner(self) -> S
    where
        S: Unpin,
    {
        self.reader.into_inner().unsplit(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_snake_case() {
        let encoded = serde_json::to_string(&ClientMessage::Attach {
            connection_id: String::from("c-1"),
            client_id: String::from("client-7"),
        })
        .expect("encode");
        assert_eq!(
            encoded,
            r#"{"type":"attach","connection_id":"c-1","client_id":"client-7"}"#
        );
        let decoded: RelayMessage =
            serde_json::from_str(r#"{"type":"connect","connection_id":"c-2","port":8080}"#)
                .expect("decode");
        assert_eq!(decoded, RelayMessage::Connect {
            connection_id: String::from("c-2"),
            port: 8080,
        });
    }

    #[tokio::test]
    async fn channel_skips_blank_lines_and_reports_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"\n{\"type\":\"ping\"}\n")
            .await
            .expect("write frames");
        let mut peer = Channel::new(client);
        let received: RelayMessage = peer.recv().await.expect("ping");
        assert_eq!(received, RelayMessage::Ping);

        drop(server);
        let err = peer.recv::<RelayMessage>().await.expect_err("closed");
        assert!(matches!(err, TunnelError::Disconnected(_)));
    }
}

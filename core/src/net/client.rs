//! Relay client: one long-lived TCP connection to the relay server.
//!
//! The socket is split into an owned reader and writer. The writer task
//! drains an unbounded channel so senders never block; the reader task
//! decodes frames incrementally and forwards messages to the node's event
//! loop. HELLO is sent as the first frame after connecting.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::net::frame::{encode_frame, FrameDecoder};
use crate::net::messages::Message;

/// What the reader task reports to the node.
#[derive(Debug)]
pub enum NetEvent {
    Message(Message),
    /// The relay connection is gone (EOF or transport error).
    Disconnected,
}

#[derive(Clone)]
pub struct RelayClient {
    outbound: mpsc::UnboundedSender<Message>,
}

impl RelayClient {
    /// Connect to the relay, announce ourselves, and wire inbound messages
    /// into `events`.
    pub async fn connect(
        node_id: &str,
        addr: &str,
        events: mpsc::UnboundedSender<NetEvent>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to relay at {addr}"))?;
        let (mut reader, mut writer) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        // Writer task: serialize, frame, write. Per-connection writes are
        // serialized here so the length prefix and body stay contiguous.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let payload = match msg.encode() {
                    Ok(p) => p,
                    Err(e) => {
                        error!("dropping unencodable message: {}", e);
                        continue;
                    }
                };
                if writer.write_all(&encode_frame(&payload)).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: incremental frame decode, then dispatch.
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => match Message::decode(&frame) {
                                    Ok(msg) => {
                                        debug!("received {} from {}", msg.kind(), msg.sender_id());
                                        if events.send(NetEvent::Message(msg)).is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => warn!("undecodable frame from relay: {}", e),
                                },
                                Ok(None) => break,
                                Err(e) => {
                                    error!("framing error from relay: {}", e);
                                    let _ = events.send(NetEvent::Disconnected);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("relay read error: {}", e);
                        break;
                    }
                }
            }
            let _ = events.send(NetEvent::Disconnected);
        });

        let client = Self { outbound };
        client.send(Message::Hello { sender_id: node_id.to_string() });
        Ok(client)
    }

    /// Queue a message for the relay. Send failures only happen after the
    /// writer task died, which the reader task reports separately.
    pub fn send(&self, msg: Message) {
        let _ = self.outbound.send(msg);
    }

    /// A client whose outbound end is a bare channel, for driving a node
    /// without a live relay. The receiver sees everything the node sends.
    #[cfg(any(test, feature = "dev-tools"))]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }
}

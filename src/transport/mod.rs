//! Controller channel.
//!
//! A websocket link to the controller carrying the JSON frames defined in
//! [`protocol`]. Outbound frames are queued through a [`FrameSender`] so any
//! task can emit them; [`Channel::pump`] owns the socket and interleaves
//! outbound writes with inbound reads until the peer closes, an error occurs,
//! or the session is stopped.

pub mod protocol;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

pub use protocol::{
    ControlFrame, DONE_SENTINEL, DataFrame, FileToUpload, FrameData, InboundMessage,
    OutboundMessage, ProtocolError, WorkItem,
};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to controller at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
}

/// Why a channel stopped pumping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The controller closed the socket.
    PeerClosed(Option<String>),
    /// The session asked the pump to stop.
    Stopped,
    Failed(String),
}

pub type FrameReceiver = mpsc::UnboundedReceiver<OutboundMessage>;

/// Cloneable handle queueing frames for the controller.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl FrameSender {
    pub fn channel() -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a frame; `false` once the channel is gone.
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn line(&self, request_id: &str, line: impl Into<String>) -> bool {
        self.send(OutboundMessage::line(request_id, line))
    }

    pub fn done(&self, request_id: &str) -> bool {
        self.send(OutboundMessage::done(request_id))
    }

    /// Error frame followed by the terminal sentinel.
    pub fn fail(&self, request_id: &str, message: impl Into<String>) -> bool {
        self.send(OutboundMessage::error(request_id, message)) && self.done(request_id)
    }
}

/// Established websocket connection to the controller.
pub struct Channel {
    url: String,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Channel {
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let (socket, _response) = connect_async(url).await.map_err(|source| ChannelError::Connect {
            url: url.to_string(),
            source,
        })?;
        Ok(Self {
            url: url.to_string(),
            socket,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs the socket until it closes or `stop` fires, handing every
    /// inbound frame to `on_message`.
    pub async fn pump<F>(self, outbound: FrameReceiver, stop: CancellationToken, on_message: F) -> CloseReason
    where
        F: FnMut(InboundMessage),
    {
        pump(self.socket, outbound, stop, on_message).await
    }
}

/// Socket-agnostic pump loop behind [`Channel::pump`].
pub async fn pump<S, F>(
    socket: S,
    mut outbound: FrameReceiver,
    stop: CancellationToken,
    mut on_message: F,
) -> CloseReason
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
    F: FnMut(InboundMessage),
{
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return CloseReason::Stopped;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return CloseReason::Stopped;
                };
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        log::error!("dropping unencodable frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::text(text)).await {
                    return CloseReason::Failed(err.to_string());
                }
            }

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match InboundMessage::parse(text.as_str()) {
                    Ok(message) => on_message(message),
                    Err(err) => log::warn!("ignoring malformed controller frame: {err}"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = sink.send(Message::Pong(payload)).await {
                        return CloseReason::Failed(err.to_string());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return CloseReason::PeerClosed(frame.map(|frame| frame.reason.to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return CloseReason::Failed(err.to_string()),
                None => return CloseReason::PeerClosed(None),
            },
        }
    }
}

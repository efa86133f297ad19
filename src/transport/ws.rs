//! WebSocket transport over `tokio-tungstenite`.
//!
//! Each replica binds a listener and advertises `ws://host:port` as its
//! peer address. The dialer's first binary frame is a hello carrying its
//! own advertised address, so the callee knows who the channel belongs
//! to before any protocol traffic flows. After the hello, every binary
//! frame is one encoded operation batch.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};

use super::{Channel, ChannelId, Direction, NetEvent, Transport, CHANNEL_QUEUE_DEPTH};
use crate::protocol::{MeshError, PeerAddr};

/// WebSocket transport bound to one listening socket.
pub struct WsTransport {
    local: PeerAddr,
    funnel: mpsc::Sender<NetEvent>,
}

impl WsTransport {
    /// Bind a listener and start accepting. `bind_addr` is a plain
    /// `host:port`; pass port 0 to let the OS pick one. The advertised
    /// peer address is `ws://` plus the bound socket address.
    pub async fn bind(bind_addr: &str, funnel: mpsc::Sender<NetEvent>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = PeerAddr::new(format!("ws://{}", listener.local_addr()?));
        log::info!("listening on {local}");
        tokio::spawn(accept_loop(listener, funnel.clone()));
        Ok(Self { local, funnel })
    }

    /// The address other replicas dial to reach this one.
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }
}

impl Transport for WsTransport {
    fn connect(&self, addr: PeerAddr) -> BoxFuture<'static, Result<Channel, MeshError>> {
        let local = self.local.clone();
        let funnel = self.funnel.clone();
        Box::pin(async move {
            let (mut ws, _) = match connect_async(addr.as_str()).await {
                Ok(ok) => ok,
                Err(e) => {
                    log::debug!("{local}: dial {addr} failed: {e}");
                    return Err(MeshError::Unreachable(addr));
                }
            };
            let hello = encode_hello(&local)?;
            if ws.send(Message::Binary(hello.into())).await.is_err() {
                return Err(MeshError::Unreachable(addr));
            }

            let (frames_tx, frames_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
            let channel = Channel::new(addr.clone(), Direction::Outbound, frames_tx);
            tokio::spawn(run_socket(
                ws,
                frames_rx,
                funnel,
                addr,
                Direction::Outbound,
                channel.id(),
            ));
            Ok(channel)
        })
    }
}

async fn accept_loop(listener: TcpListener, funnel: mpsc::Sender<NetEvent>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let funnel = funnel.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => serve_inbound(ws, funnel).await,
                Err(e) => log::warn!("websocket handshake with {remote} failed: {e}"),
            }
        });
    }
}

async fn serve_inbound(mut ws: WebSocketStream<TcpStream>, funnel: mpsc::Sender<NetEvent>) {
    // The hello must come first; anything else is not a mesh peer.
    let addr = loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                match decode_hello(&bytes) {
                    Ok(addr) => break addr,
                    Err(e) => {
                        log::warn!("rejecting connection with bad hello: {e}");
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let (frames_tx, frames_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let channel = Channel::new(addr.clone(), Direction::Inbound, frames_tx);
    let id = channel.id();
    if funnel.send(NetEvent::Inbound(channel)).await.is_err() {
        return;
    }
    run_socket(ws, frames_rx, funnel, addr, Direction::Inbound, id).await;
}

/// Drive one socket until either side is done: queued outbound frames go
/// out as binary messages, incoming binary messages go into the funnel,
/// and the close is reported exactly once.
async fn run_socket<S>(
    mut ws: WebSocketStream<S>,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    funnel: mpsc::Sender<NetEvent>,
    addr: PeerAddr,
    direction: Direction,
    id: ChannelId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) = ws.send(Message::Binary(bytes.into())).await {
                        log::debug!("send to {addr} failed: {e}");
                        break;
                    }
                }
                // Channel handle dropped: close the socket cleanly.
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let event = NetEvent::Frame { from: addr.clone(), bytes };
                    if funnel.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("socket to {addr} errored: {e}");
                    break;
                }
            },
        }
    }
    let _ = funnel
        .send(NetEvent::Closed {
            from: addr,
            direction,
            id,
        })
        .await;
}

fn encode_hello(addr: &PeerAddr) -> Result<Vec<u8>, MeshError> {
    bincode::serde::encode_to_vec(addr, bincode::config::standard())
        .map_err(|e| MeshError::Encode(e.to_string()))
}

fn decode_hello(bytes: &[u8]) -> Result<PeerAddr, MeshError> {
    let (addr, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| MeshError::Decode(e.to_string()))?;
    Ok(addr)
}

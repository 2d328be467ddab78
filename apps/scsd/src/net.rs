//! Connection acceptors and read loops.
//!
//! Two listeners: a byte-stream listener for legacy clients (frames split on
//! `%`) and a WebSocket listener hosting `/` (legacy or JSON protocol,
//! auto-detected) and `/DATA` (server-info probe).
//!
//! Auto-detect exploits the handshake asymmetry: the legacy protocol waits
//! for the server's `decryptor` probe, the JSON protocol speaks first with
//! `hello`. We read for 250 ms; if nothing arrives we send the probe, then
//! classify whatever shows up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::stream::SplitStream;
use futures_util::SinkExt;
use futures_util::StreamExt;
use scio::frame::FrameReader;
use scio::frame::FrameWriter;
use scproto::ao::PacketAo;
use scproto::sc::PacketSc;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::handshake::server::Response;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::client::Client;
use crate::client::ClientKind;
use crate::client::Outbound;
use crate::server::Server;

const PROBE_DELAY: Duration = Duration::from_millis(250);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn listen_tcp(srv: Arc<Server>) {
    let addr = format!("0.0.0.0:{}", srv.config.legacy_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            srv.fatal(anyhow::anyhow!("couldn't listen on legacy port: {e}"))
                .await;
            return;
        }
    };
    info!(port = srv.config.legacy_port, "listening for legacy connections");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(err = %e, "legacy accept error");
                continue;
            }
        };
        let srv = srv.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_conn(srv, stream, peer).await {
                debug!(peer = %peer, err = %e, "legacy connection ended with error");
            }
        });
    }
}

/// One raw stream connection: always the legacy protocol, server sends the
/// decryptor probe immediately.
pub(crate) async fn handle_tcp_conn<S>(
    srv: Arc<Server>,
    stream: S,
    peer: SocketAddr,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let (c, rx) = Client::new(peer, ClientKind::Ao);
    let writer = tokio::spawn(stream_writer(wr, rx));
    srv.clients.add(c.clone());
    c.start_mute_ticker();
    debug!(peer = %peer, ipid = %c.ipid(), "new legacy connection");

    // To this day, this is part of the handshake.
    c.write_ao("decryptor", &["DEPRECATED"]).await;

    let mut fr = FrameReader::new(rd);
    loop {
        tokio::select! {
            _ = c.wait_closed() => break,
            res = fr.read_frame() => {
                match res {
                    Ok(Some(frame)) => match scproto::ao::decode(&frame) {
                        Ok(pkt) => {
                            trace!(peer = %peer, ipid = %c.ipid(), header = %pkt.header, "recv");
                            srv.handle_packet_ao(&c, pkt).await;
                        }
                        Err(e) => {
                            info!(peer = %peer, ipid = %c.ipid(), err = %e, "bad frame");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(peer = %peer, ipid = %c.ipid(), err = %e, "read error");
                        break;
                    }
                }
            }
        }
    }

    srv.remove_client(&c).await;
    drop(c);
    let _ = writer.await;
    Ok(())
}

async fn stream_writer<W>(wr: W, mut rx: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    let mut fw = FrameWriter::new(wr);
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Frame(s) => {
                let res = tokio::time::timeout(WRITE_TIMEOUT, fw.write_frame(s.as_bytes())).await;
                if !matches!(res, Ok(Ok(()))) {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = fw.shutdown().await;
}

pub async fn listen_ws(srv: Arc<Server>) {
    let addr = format!("0.0.0.0:{}", srv.config.ws_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            srv.fatal(anyhow::anyhow!("couldn't listen on WS port: {e}"))
                .await;
            return;
        }
    };
    info!(port = srv.config.ws_port, "listening for WebSocket connections");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(err = %e, "WS accept error");
                continue;
            }
        };
        let srv = srv.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_ws_conn(srv, stream, peer).await {
                debug!(peer = %peer, err = %e, "WS connection ended with error");
            }
        });
    }
}

/// Upgrade a WebSocket connection and route it by request path.
pub(crate) async fn handle_ws_conn<S>(
    srv: Arc<Server>,
    stream: S,
    peer: SocketAddr,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Origin checking is permissive; the upgrade callback only records the
    // request path so we can route `/DATA`.
    let mut path = String::new();
    let ws = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        }),
    )
    .await
    .context("WS handshake timed out")?
    .context("WS handshake failed")?;

    if path.starts_with("/DATA") {
        return data_endpoint(&srv, ws, peer).await;
    }

    let (c, rx) = Client::new(peer, ClientKind::Undetermined);
    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(ws_writer(sink, rx));
    srv.clients.add(c.clone());
    c.start_mute_ticker();
    debug!(peer = %peer, ipid = %c.ipid(), "new WS connection");

    match detect_first_message(&c, &mut stream).await {
        Some(data) => match classify(&data) {
            Detected::Ao(pkt) => {
                c.set_kind(ClientKind::Ao);
                trace!(peer = %peer, ipid = %c.ipid(), "classified as legacy client");
                srv.handle_packet_ao(&c, pkt).await;
                read_loop_ao(&srv, &c, &mut stream).await;
            }
            Detected::Sc(pkt) => {
                c.set_kind(ClientKind::Sc);
                trace!(peer = %peer, ipid = %c.ipid(), "classified as JSON client");
                srv.handle_packet_sc(&c, pkt).await;
                read_loop_sc(&srv, &c, &mut stream).await;
            }
            Detected::Unknown => {
                debug!(peer = %peer, ipid = %c.ipid(), "could not determine client type");
            }
        },
        None => {
            debug!(peer = %peer, ipid = %c.ipid(), "closed before identifying");
        }
    }

    srv.remove_client(&c).await;
    drop(c);
    let _ = writer.await;
    Ok(())
}

enum Detected {
    Ao(PacketAo),
    Sc(PacketSc),
    Unknown,
}

/// `HI` in the delimited form means a legacy client; a `hello` JSON
/// envelope means a JSON client; anything else is undecidable.
fn classify(data: &[u8]) -> Detected {
    if let Ok(p) = scproto::ao::decode(data) {
        if p.header == "HI" {
            return Detected::Ao(p);
        }
    }
    if let Ok(p) = scproto::sc::decode(data) {
        if p.header == "hello" {
            return Detected::Sc(p);
        }
    }
    Detected::Unknown
}

/// Wait for the first data message, firing the `decryptor` probe if the
/// client has said nothing after 250 ms.
async fn detect_first_message<S>(
    c: &Arc<Client>,
    stream: &mut SplitStream<WebSocketStream<S>>,
) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let probe = tokio::time::sleep(PROBE_DELAY);
    tokio::pin!(probe);
    let mut probe_sent = false;
    loop {
        tokio::select! {
            _ = &mut probe, if !probe_sent => {
                probe_sent = true;
                c.write_ao("decryptor", &["DEPRECATED"]).await;
            }
            msg = stream.next() => {
                match msg? {
                    Ok(Message::Text(s)) => return Some(s.into_bytes()),
                    Ok(Message::Binary(b)) => return Some(b),
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        }
    }
}

async fn read_loop_ao<S>(srv: &Arc<Server>, c: &Arc<Client>, stream: &mut SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = c.wait_closed() => return,
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { return };
                let data = match msg {
                    Message::Text(s) => s.into_bytes(),
                    Message::Binary(b) => b,
                    Message::Close(_) => return,
                    _ => continue,
                };
                match scproto::ao::decode(&data) {
                    Ok(pkt) => {
                        trace!(ipid = %c.ipid(), header = %pkt.header, "recv");
                        srv.handle_packet_ao(c, pkt).await;
                    }
                    Err(e) => {
                        info!(ipid = %c.ipid(), err = %e, "bad frame");
                    }
                }
            }
        }
    }
}

async fn read_loop_sc<S>(srv: &Arc<Server>, c: &Arc<Client>, stream: &mut SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = c.wait_closed() => return,
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { return };
                let data = match msg {
                    Message::Text(s) => s.into_bytes(),
                    Message::Binary(b) => b,
                    Message::Close(_) => return,
                    _ => continue,
                };
                match scproto::sc::decode(&data) {
                    Ok(pkt) => {
                        trace!(ipid = %c.ipid(), header = %pkt.header, "recv");
                        srv.handle_packet_sc(c, pkt).await;
                    }
                    Err(e) => {
                        // Malformed JSON drops the packet, not the client.
                        debug!(ipid = %c.ipid(), err = %e, "bad JSON");
                    }
                }
            }
        }
    }
}

async fn ws_writer<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, mut rx: mpsc::Receiver<Outbound>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Frame(s) => {
                let res = tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(s))).await;
                if !matches!(res, Ok(Ok(()))) {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = sink.close().await;
}

/// `/DATA`: send one SERVERHELLO envelope with server metadata, then close.
async fn data_endpoint<S>(
    srv: &Arc<Server>,
    mut ws: WebSocketStream<S>,
    peer: SocketAddr,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = scproto::sc::DataHelloServer {
        application: "scs".to_string(),
        version: "alpha".to_string(),
        name: srv.config.name.clone(),
        description: srv.config.description.clone(),
        playercount: srv.clients.size_joined(),
        url: String::new(),
        packages: Vec::new(),
    };
    let frame = scproto::sc::encode("SERVERHELLO", &hello).context("encode SERVERHELLO")?;
    ws.send(Message::Text(frame))
        .await
        .context("write SERVERHELLO")?;
    let _ = ws.close(None).await;
    debug!(peer = %peer, "served /DATA probe");
    Ok(())
}

//! server — the OSC control plane
//!
//! Control requests arrive on port 9002 (UDP by default, TCP with length
//! prefixed frames when requested) and mutate the flow/source sets through
//! the handlers in [`handlers`].  Replies and the per-frame data stream go
//! back to each subscriber's own endpoint.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rosc::{decoder, encoder, OscPacket};

use crate::message::Message;
use crate::runtime::App;

pub mod handlers;

/// Port the control server listens on.
pub const SERVER_PORT: u16 = 9002;
/// Port replies default to when a request does not carry one.
pub const CLIENT_PORT: u16 = 9000;

pub const PATH_CONNECT: &str = "/blobserver/connect";
pub const PATH_DISCONNECT: &str = "/blobserver/disconnect";
pub const PATH_SET_PARAMETER: &str = "/blobserver/setParameter";
pub const PATH_GET_PARAMETER: &str = "/blobserver/getParameter";
pub const PATH_DETECTORS: &str = "/blobserver/detectors";
pub const PATH_SOURCES: &str = "/blobserver/sources";
pub const PATH_START_FRAME: &str = "/blobserver/startFrame";
pub const PATH_END_FRAME: &str = "/blobserver/endFrame";

/// How long blocking reads wait before re-checking the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

// ── Subscriber endpoint ───────────────────────────────────────────────────────

enum ClientTransport {
    Udp(UdpSocket),
    /// Lazily connected; reset to `None` after a send failure so the next
    /// send retries.
    Tcp(Mutex<Option<TcpStream>>),
}

/// A subscriber endpoint.  Shared (`Arc`) between the flow that streams to it
/// and any control handler replying to it, so neither can dangle the other.
pub struct OscClient {
    address: IpAddr,
    port: u16,
    transport: ClientTransport,
}

impl OscClient {
    pub fn new(address: &str, port: u16, tcp: bool) -> Result<Self> {
        let address: IpAddr = address
            .parse()
            .with_context(|| format!("invalid client address {address:?}"))?;
        let transport = if tcp {
            ClientTransport::Tcp(Mutex::new(None))
        } else {
            ClientTransport::Udp(
                UdpSocket::bind(("0.0.0.0", 0)).context("could not bind client socket")?,
            )
        };
        Ok(Self {
            address,
            port,
            transport,
        })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one OSC message.  An unreachable subscriber is not an error: the
    /// flow persists until an explicit disconnect, so failures are only
    /// logged at debug level.
    pub fn send(&self, path: &str, message: &Message) {
        let packet = OscPacket::Message(message.to_osc(path));
        let bytes = match encoder::encode(&packet) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path, error = %err, "OSC encode failed");
                return;
            }
        };

        match &self.transport {
            ClientTransport::Udp(socket) => {
                if let Err(err) = socket.send_to(&bytes, (self.address, self.port)) {
                    tracing::debug!(client = %self.address, error = %err, "UDP send failed");
                }
            }
            ClientTransport::Tcp(stream) => {
                let mut guard = stream.lock().expect("client stream poisoned");
                if guard.is_none() {
                    let addr = SocketAddr::new(self.address, self.port);
                    match TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT) {
                        Ok(stream) => *guard = Some(stream),
                        Err(err) => {
                            tracing::debug!(client = %addr, error = %err, "TCP connect failed");
                            return;
                        }
                    }
                }
                let stream = guard.as_mut().expect("connected above");
                let framed = frame_tcp(&bytes);
                if let Err(err) = stream.write_all(&framed).and_then(|_| stream.flush()) {
                    tracing::debug!(client = %self.address, error = %err, "TCP send failed");
                    *guard = None;
                }
            }
        }
    }
}

/// OSC-over-TCP framing: a big-endian length prefix before each packet.
fn frame_tcp(packet: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + packet.len());
    framed.extend_from_slice(&(packet.len() as u32).to_be_bytes());
    framed.extend_from_slice(packet);
    framed
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Bind the control socket and spawn the receive thread.  A bind failure is
/// fatal to the caller.
pub fn spawn(app: Arc<App>, port: u16) -> Result<JoinHandle<()>> {
    if app.tcp {
        spawn_tcp(app, port)
    } else {
        spawn_udp(app, port)
    }
}

fn spawn_udp(app: Arc<App>, port: u16) -> Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .with_context(|| format!("could not bind UDP control port {port}"))?;
    socket
        .set_read_timeout(Some(POLL_INTERVAL))
        .context("could not set socket timeout")?;
    tracing::info!(port, "OSC control server listening (UDP)");

    let handle = std::thread::spawn(move || {
        let mut buf = [0u8; 65536];
        while app.is_running() {
            match socket.recv_from(&mut buf) {
                Ok((len, peer)) => match decoder::decode_udp(&buf[..len]) {
                    Ok((_, packet)) => handle_packet(&app, packet),
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "undecodable OSC packet")
                    }
                },
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(err) => tracing::warn!(error = %err, "control socket receive failed"),
            }
        }
    });
    Ok(handle)
}

fn spawn_tcp(app: Arc<App>, port: u16) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("could not bind TCP control port {port}"))?;
    listener
        .set_nonblocking(true)
        .context("could not make listener non-blocking")?;
    tracing::info!(port, "OSC control server listening (TCP)");

    let handle = std::thread::spawn(move || {
        while app.is_running() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "control connection accepted");
                    let app = Arc::clone(&app);
                    std::thread::spawn(move || serve_tcp_connection(app, stream, peer));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => tracing::warn!(error = %err, "control accept failed"),
            }
        }
    });
    Ok(handle)
}

fn serve_tcp_connection(app: Arc<App>, mut stream: TcpStream, peer: SocketAddr) {
    if stream.set_read_timeout(Some(POLL_INTERVAL)).is_err() {
        return;
    }
    let mut length = [0u8; 4];
    while app.is_running() {
        match stream.read_exact(&mut length) {
            Ok(()) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => break, // peer closed
        }
        let len = u32::from_be_bytes(length) as usize;
        if len == 0 || len > 1 << 20 {
            tracing::warn!(%peer, len, "implausible OSC frame length, dropping connection");
            break;
        }
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).is_err() {
            break;
        }
        match decoder::decode_udp(&payload) {
            Ok((_, packet)) => handle_packet(&app, packet),
            Err(err) => tracing::warn!(%peer, error = %err, "undecodable OSC frame"),
        }
    }
}

fn handle_packet(app: &Arc<App>, packet: OscPacket) {
    match packet {
        OscPacket::Message(osc) => {
            let message = match Message::from_osc(&osc) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(path = osc.addr, error = %err, "rejected control message");
                    return;
                }
            };
            dispatch(app, &osc.addr, &message);
        }
        OscPacket::Bundle(bundle) => {
            for packet in bundle.content {
                handle_packet(app, packet);
            }
        }
    }
}

/// Route one decoded control message; the returned reply (if any) goes back
/// on the request's own path.
pub fn dispatch(app: &Arc<App>, path: &str, message: &Message) {
    let reply = match path {
        PATH_CONNECT => handlers::connect(app, message),
        PATH_DISCONNECT => handlers::disconnect(app, message),
        PATH_SET_PARAMETER => handlers::set_parameter(app, message),
        PATH_GET_PARAMETER => handlers::get_parameter(app, message),
        PATH_DETECTORS => handlers::detectors(app, message),
        PATH_SOURCES => handlers::sources(app, message),
        other => {
            tracing::debug!(path = other, args = message.len(), "unhandled message");
            None
        }
    };

    if let Some((client, reply)) = reply {
        client.send(path, &reply);
    }
}

//! Integration tests over loopback sockets
//!
//! Each test plays both the backend server and the client with raw
//! `TcpStream`s and drives the relay in between.

mod eof_rewrite;
mod stale_replay;

use std::sync::Arc;
use std::time::Duration;

use athena_relay::backend::{BackendConnection, BackendRole, Lsn, ReplicaFreshness};
use athena_relay::protocol::packet::{capabilities, encode_packet, PACKET_HEADER_SIZE};
use athena_relay::protocol::ProtocolError;
use athena_relay::session::{SessionContext, SessionState};
use athena_relay::transport::{Connection, PacketHandler, Role, Slice, TransportContext, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const CLASSIC: u32 = capabilities::CLIENT_PROTOCOL_41;
pub const DEPRECATE: u32 = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_DEPRECATE_EOF;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// Read one packet, returning (sequence id, payload)
pub async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut header))
        .await
        .expect("timed out waiting for a packet")
        .unwrap();
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (header[3], payload)
}

pub async fn read_packets(stream: &mut TcpStream, count: usize) -> Vec<(u8, Vec<u8>)> {
    let mut packets = Vec::with_capacity(count);
    for _ in 0..count {
        packets.push(read_packet(stream).await);
    }
    packets
}

/// Nothing more arrives within a short window
pub async fn assert_quiet(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut byte)).await;
    assert!(result.is_err(), "unexpected bytes on the wire");
}

/// The relay hung up: the next read sees end of stream
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    let read = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut byte))
        .await
        .expect("socket still open")
        .unwrap();
    assert_eq!(read, 0, "unexpected bytes before close");
}

/// Backend server side: answers with canned packets
pub struct FakeServer {
    pub stream: TcpStream,
}

impl FakeServer {
    /// Read one request, returning its payload
    pub async fn request(&mut self) -> Vec<u8> {
        let (seq, payload) = read_packet(&mut self.stream).await;
        assert_eq!(seq, 0);
        payload
    }

    pub async fn send(&mut self, packets: &[(u8, &[u8])]) {
        let mut wire = Vec::new();
        for (seq, payload) in packets {
            wire.extend_from_slice(&encode_packet(*seq, payload));
        }
        self.stream.write_all(&wire).await.unwrap();
    }
}

/// Relay side of a backend socket plus the server driving it
pub async fn backend(caps: u32, role: BackendRole, applied: Lsn) -> (Arc<BackendConnection>, FakeServer) {
    let ctx = Arc::new(TransportContext::default());
    let (server, local) = pair().await;
    let conn = Connection::new(local, Role::Backend, ctx).unwrap();
    conn.set_capabilities(caps);
    let freshness = ReplicaFreshness::new(role);
    freshness.observe_applied(applied);
    let backend = BackendConnection::new(conn, Arc::new(freshness));
    backend.spawn();
    (backend, FakeServer { stream: server })
}

struct Discard;

impl PacketHandler for Discard {
    fn on_packet(&mut self, _packets: Vec<Slice>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn on_close(&mut self, _error: Option<&TransportError>) {}
}

/// Relay side of a client socket, its session, and the raw client peer
pub async fn client(caps: u32) -> (Arc<Connection>, Arc<dyn SessionContext>, TcpStream) {
    let ctx = Arc::new(TransportContext::default());
    let (peer, local) = pair().await;
    let conn = Connection::new(local, Role::Client, ctx).unwrap();
    conn.set_capabilities(caps);
    tokio::spawn(conn.clone().run(Discard));
    let session = SessionState::new();
    session.set_from_handshake(Some("shop".into()), caps, 33);
    (conn, Arc::new(session), peer)
}

pub fn query(sql: &str) -> Vec<u8> {
    let mut body = vec![0x03];
    body.extend_from_slice(sql.as_bytes());
    body
}

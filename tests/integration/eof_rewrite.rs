//! EOF compatibility between legs negotiated differently

use std::sync::Arc;

use athena_relay::backend::BackendRole;
use athena_relay::protocol::messages::EOF_HEADER;
use athena_relay::protocol::packet::{encode_packet, status};
use athena_relay::protocol::{ColumnDefinition, EofPacket, FieldType, OkPacket};
use athena_relay::request::RequestContext;
use athena_relay::result::{Destination, ResultState, ResultStream};

use crate::{assert_quiet, backend, client, query, read_packets, CLASSIC, DEPRECATE};

fn column(name: &str) -> Vec<u8> {
    ColumnDefinition::new(name, FieldType::VarString).encode_payload().to_vec()
}

async fn wait_for(done: impl Fn() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition never met");
}

#[tokio::test]
async fn test_deprecating_backend_to_classic_client() {
    let (backend, mut server) = backend(DEPRECATE, BackendRole::Replica, 0).await;
    let (sink, session, mut peer) = client(CLASSIC).await;

    let request = Arc::new(RequestContext::new(encode_packet(0, &query("SELECT a, b FROM t"))));
    let handler = backend
        .execute(request, session, Destination::Forward(sink), None)
        .unwrap()
        .unwrap();
    assert_eq!(server.request().await, query("SELECT a, b FROM t"));

    let terminator = OkPacket::new().encode_payload(EOF_HEADER, DEPRECATE);
    server
        .send(&[
            (1, &b"\x02"[..]),
            (2, &column("a")[..]),
            (3, &column("b")[..]),
            (4, &b"\x011\x011"[..]),
            (5, &b"\x012\x012"[..]),
            (6, &terminator[..]),
        ])
        .await;

    let packets = read_packets(&mut peer, 7).await;
    let sequences: Vec<u8> = packets.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6, 7]);
    // injected between the definitions and the rows
    assert_eq!(packets[3].1.len(), 5);
    assert_eq!(packets[3].1[0], EOF_HEADER);
    assert_eq!(packets[4].1, b"\x011\x011");
    assert_eq!(
        packets[6].1,
        EofPacket::new(0, status::SERVER_STATUS_AUTOCOMMIT).encode_payload(CLASSIC).to_vec()
    );
    assert_quiet(&mut peer).await;

    wait_for(|| handler.is_done()).await;
    assert_eq!(handler.state(), ResultState::EOF);
    assert_eq!(backend.outstanding(), 0);
}

#[tokio::test]
async fn test_classic_backend_to_deprecating_client() {
    let (backend, mut server) = backend(CLASSIC, BackendRole::Replica, 0).await;
    let (sink, session, mut peer) = client(DEPRECATE).await;

    let request = Arc::new(RequestContext::new(encode_packet(0, &query("SELECT a FROM t"))));
    backend
        .execute(request, session, Destination::Forward(sink), None)
        .unwrap()
        .unwrap();
    server.request().await;

    let eof = EofPacket::new(0, status::SERVER_STATUS_AUTOCOMMIT).encode_payload(CLASSIC);
    server
        .send(&[
            (1, &b"\x01"[..]),
            (2, &column("a")[..]),
            (3, &eof[..]),
            (4, &b"\x01x"[..]),
            (5, &eof[..]),
        ])
        .await;

    let packets = read_packets(&mut peer, 4).await;
    let sequences: Vec<u8> = packets.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert_eq!(packets[2].1, b"\x01x");
    let terminator = OkPacket::parse(&packets[3].1, DEPRECATE).unwrap();
    assert_eq!(terminator.status_flags, status::SERVER_STATUS_AUTOCOMMIT);
    assert_quiet(&mut peer).await;
}

#[tokio::test]
async fn test_multi_result_keeps_sequence_across_chain() {
    let (backend, mut server) = backend(DEPRECATE, BackendRole::Replica, 0).await;
    let (sink, session, mut peer) = client(CLASSIC).await;

    let request = Arc::new(RequestContext::new(encode_packet(
        0,
        &query("UPDATE t SET a = 1; SELECT a FROM t"),
    )));
    let first = backend
        .execute(request, session, Destination::Forward(sink), None)
        .unwrap()
        .unwrap();
    server.request().await;

    let mut ok = OkPacket::new();
    ok.affected_rows = 1;
    ok.status_flags |= status::SERVER_MORE_RESULTS_EXISTS;
    let ok = ok.encode_payload(0, DEPRECATE);
    let terminator = OkPacket::new().encode_payload(EOF_HEADER, DEPRECATE);
    server
        .send(&[
            (1, &ok[..]),
            (2, &b"\x01"[..]),
            (3, &column("a")[..]),
            (4, &b"\x011"[..]),
            (5, &terminator[..]),
        ])
        .await;

    let packets = read_packets(&mut peer, 6).await;
    let sequences: Vec<u8> = packets.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(packets[3].1[0], EOF_HEADER);

    wait_for(|| first.more().is_some_and(|next| next.is_done())).await;
    assert!(first.has_more());
    assert_eq!(first.chain().len(), 2);
    assert_eq!(backend.outstanding(), 0);
}

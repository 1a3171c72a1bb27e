//! Stale results replayed on the leader, and what happens when they cannot be

use std::sync::Arc;

use athena_relay::backend::{BackendConnection, BackendLink, BackendRole};
use athena_relay::config::RetryConfig;
use athena_relay::protocol::packet::encode_packet;
use athena_relay::protocol::{ColumnDefinition, ErrPacket, FieldType, OkPacket};
use athena_relay::request::{ReadPreference, RequestContext};
use athena_relay::result::{Destination, ResultStream};
use athena_relay::retry::{RequestScheduler, RetryCoordinator};
use athena_relay::session::SessionContext;
use athena_relay::transport::{Connection, PacketSink};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::{assert_closed, assert_quiet, backend, client, query, read_packet, read_packets, CLASSIC};

#[derive(Debug)]
enum Event {
    Reissued { attempt: u32, preference: ReadPreference, pinned: bool },
    Error(u16),
    Closed(String),
}

/// Routes replays to the leader and answers the client directly
struct Router {
    leader: Arc<BackendConnection>,
    client: Arc<Connection>,
    events: mpsc::UnboundedSender<Event>,
}

impl RequestScheduler for Router {
    fn reissue(&self, request: Arc<RequestContext>, session: Arc<dyn SessionContext>) {
        let _ = self.events.send(Event::Reissued {
            attempt: request.attempt(),
            preference: request.preference(),
            pinned: request.pinned_lsn().is_some(),
        });
        self.leader
            .execute(request, session, Destination::Forward(self.client.clone()), None)
            .unwrap();
    }

    fn send_error(&self, _request: &RequestContext, err: ErrPacket) {
        let _ = self.events.send(Event::Error(err.error_code));
        let caps = self.client.capabilities();
        self.client.write(err.encode(1, caps).to_wire()).unwrap();
    }

    fn close_client(&self, _request: &RequestContext, reason: &str) {
        let _ = self.events.send(Event::Closed(reason.to_string()));
        self.client.close();
    }
}

struct Setup {
    coordinator: Arc<RetryCoordinator>,
    leader: crate::FakeServer,
    client: Arc<Connection>,
    session: Arc<dyn SessionContext>,
    peer: tokio::net::TcpStream,
    events: mpsc::UnboundedReceiver<Event>,
}

async fn setup() -> Setup {
    let (leader, leader_server) = backend(CLASSIC, BackendRole::Leader, 0).await;
    let (client, session, peer) = client(CLASSIC).await;
    let (tx, events) = mpsc::unbounded_channel();
    let router = Arc::new(Router {
        leader,
        client: client.clone(),
        events: tx,
    });
    let config = RetryConfig {
        fast_delay_ms: 1,
        jitter_ms: 0,
        ..RetryConfig::default()
    };
    Setup {
        coordinator: RetryCoordinator::new(config, router, Handle::current()),
        leader: leader_server,
        client,
        session,
        peer,
        events,
    }
}

fn pinned_query(sql: &str, lsn: u64) -> Arc<RequestContext> {
    Arc::new(RequestContext::new(encode_packet(0, &query(sql))).with_pinned_lsn(lsn))
}

#[tokio::test]
async fn test_stale_replica_result_replayed_on_leader() {
    let mut setup = setup().await;
    let (replica, mut replica_server) = backend(CLASSIC, BackendRole::Replica, 10).await;

    let handler = replica
        .execute(
            pinned_query("SELECT 1", 20),
            setup.session.clone(),
            Destination::Forward(setup.client.clone()),
            Some(setup.coordinator.clone()),
        )
        .unwrap()
        .unwrap();
    replica_server.request().await;
    let mut stale = OkPacket::new();
    stale.info = "replica".into();
    replica_server.send(&[(1, &stale.encode_payload(0, CLASSIC)[..])]).await;

    // the replay reaches the leader with the same bytes
    assert_eq!(setup.leader.request().await, query("SELECT 1"));
    match setup.events.recv().await {
        Some(Event::Reissued { attempt, preference, pinned }) => {
            assert_eq!(attempt, 1);
            assert_eq!(preference, ReadPreference::Leader);
            assert!(!pinned);
        }
        other => panic!("unexpected {other:?}"),
    }
    let mut fresh = OkPacket::new();
    fresh.info = "leader".into();
    setup.leader.send(&[(1, &fresh.encode_payload(0, CLASSIC)[..])]).await;

    // exactly one response, and it is the leader's
    let (seq, payload) = read_packet(&mut setup.peer).await;
    assert_eq!(seq, 1);
    assert_eq!(OkPacket::parse(&payload, CLASSIC).unwrap().info, "leader");
    assert_quiet(&mut setup.peer).await;
    assert!(handler.disposition().dropped_stale());
    assert!(!handler.disposition().forwarded());
}

#[tokio::test]
async fn test_abort_on_known_stale_replica_is_replayed() {
    let mut setup = setup().await;
    let (replica, mut replica_server) = backend(CLASSIC, BackendRole::Replica, 10).await;

    let handler = replica
        .execute(
            Arc::new(RequestContext::new(encode_packet(0, &query("SELECT 2")))),
            setup.session.clone(),
            Destination::Forward(setup.client.clone()),
            Some(setup.coordinator.clone()),
        )
        .unwrap()
        .unwrap();
    replica_server.request().await;
    replica.freshness().mark_stale();
    assert!(replica.is_known_stale());
    drop(replica_server);

    assert_eq!(setup.leader.request().await, query("SELECT 2"));
    setup
        .leader
        .send(&[(1, &OkPacket::new().encode_payload(0, CLASSIC)[..])])
        .await;
    let (seq, _) = read_packet(&mut setup.peer).await;
    assert_eq!(seq, 1);
    assert!(handler.disposition().aborted_known_stale());
}

#[tokio::test]
async fn test_abort_before_any_byte_sends_error() {
    let mut setup = setup().await;
    let (replica, mut replica_server) = backend(CLASSIC, BackendRole::Replica, 10).await;

    replica
        .execute(
            Arc::new(RequestContext::new(encode_packet(0, &query("SELECT 3")))),
            setup.session.clone(),
            Destination::Forward(setup.client.clone()),
            Some(setup.coordinator.clone()),
        )
        .unwrap()
        .unwrap();
    replica_server.request().await;
    drop(replica_server);

    match setup.events.recv().await {
        Some(Event::Error(code)) => assert_eq!(code, 2013),
        other => panic!("unexpected {other:?}"),
    }
    let (seq, payload) = read_packet(&mut setup.peer).await;
    assert_eq!(seq, 1);
    assert_eq!(ErrPacket::parse(&payload, CLASSIC).unwrap().error_code, 2013);
}

#[tokio::test]
async fn test_abort_after_partial_forward_closes_client() {
    let mut setup = setup().await;
    let (replica, mut replica_server) = backend(CLASSIC, BackendRole::Replica, 10).await;

    let handler = replica
        .execute(
            Arc::new(RequestContext::new(encode_packet(0, &query("SELECT a FROM t")))),
            setup.session.clone(),
            Destination::Forward(setup.client.clone()),
            Some(setup.coordinator.clone()),
        )
        .unwrap()
        .unwrap();
    replica_server.request().await;
    let column = ColumnDefinition::new("a", FieldType::VarString).encode_payload();
    replica_server.send(&[(1, &b"\x01"[..]), (2, &column[..])]).await;

    let forwarded = read_packets(&mut setup.peer, 2).await;
    assert_eq!(forwarded[0], (1, vec![0x01]));
    drop(replica_server);

    match setup.events.recv().await {
        Some(Event::Closed(reason)) => assert_eq!(reason, "partial result forwarded"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(handler.is_done());
    assert!(handler.disposition().forwarded());
    assert!(setup.client.is_closed());
    // the client sees the teardown even though the router still holds the connection
    assert_closed(&mut setup.peer).await;
}

#[tokio::test]
async fn test_stale_result_in_transaction_is_not_replayed() {
    let mut setup = setup().await;
    let (replica, mut replica_server) = backend(CLASSIC, BackendRole::Replica, 10).await;

    // a transaction opened earlier on this session
    setup.session.update_status(
        athena_relay::protocol::status::SERVER_STATUS_IN_TRANS,
        0,
    );
    replica
        .execute(
            pinned_query("SELECT 4", 20),
            setup.session.clone(),
            Destination::Forward(setup.client.clone()),
            Some(setup.coordinator.clone()),
        )
        .unwrap()
        .unwrap();
    replica_server.request().await;
    replica_server
        .send(&[(1, &OkPacket::new().encode_payload(0, CLASSIC)[..])])
        .await;

    match setup.events.recv().await {
        Some(Event::Error(code)) => assert_eq!(code, 1105),
        other => panic!("unexpected {other:?}"),
    }
    let (_, payload) = read_packet(&mut setup.peer).await;
    assert_eq!(ErrPacket::parse(&payload, CLASSIC).unwrap().error_code, 1105);
}

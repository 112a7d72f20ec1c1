use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use gauze_rtc_protocol::{
    decode_frame, Event, Request, ERROR_CODE_CONNECTION_REFUSED, ERROR_CODE_NAME_NOT_RESOLVED,
    ERROR_CODE_TRANSPORT_FAILURE,
};
use gauze_rtc_service::{
    PortRange, RequestTransport, ResolveError, RtcSocketService, SendOptions, ServiceConfig,
    SocketEvent, TransportError,
};

fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
}

fn any_port() -> SocketAddr {
    v4(0, 0, 0, 0, 0)
}

struct Harness {
    service: RtcSocketService,
    provider_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let (provider_tx, provider_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let service = RtcSocketService::spawn(ServiceConfig::default(), provider_tx, inbound_rx);
        Self {
            service,
            provider_rx,
            inbound_tx,
        }
    }

    async fn next_request(&mut self) -> Request {
        let bytes = timeout(Duration::from_secs(1), self.provider_rx.recv())
            .await
            .expect("timed out waiting for provider-bound frame")
            .expect("provider channel closed");
        Request::decode(&decode_frame(&bytes).expect("malformed frame")).expect("bad request")
    }

    fn inject(&self, event: Event) {
        self.inbound_tx
            .send(event.encode().expect("encode event"))
            .expect("inbound channel closed");
    }
}

async fn next_event(
    handle: &mut gauze_rtc_service::SocketHandle,
) -> Option<SocketEvent> {
    timeout(Duration::from_secs(1), handle.recv_event())
        .await
        .expect("timed out waiting for socket event")
}

#[tokio::test(flavor = "current_thread")]
async fn datagram_socket_create_open_send_receive() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    let mut socket = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("create datagram socket");

    let raw = socket.id().get();
    match h.next_request().await {
        Request::CreateUdpSocket { id, bind, .. } => {
            assert_eq!(id, raw);
            assert_eq!(bind, any_port());
        }
        other => panic!("expected CreateUdpSocket, got {other:?}"),
    }

    // Provider confirms the bind with the real local address.
    let confirmed = v4(10, 0, 0, 5, 54321);
    h.inject(Event::Opened {
        id: raw,
        local: confirmed,
    });
    assert_eq!(
        next_event(&mut socket).await,
        Some(SocketEvent::Opened { local: confirmed })
    );

    // Outbound data flows through as a SendPacket request.
    let dest = v4(203, 0, 113, 9, 3478);
    socket
        .send(
            b"ping".to_vec(),
            Some(dest),
            SendOptions {
                packet_id: 7,
                dscp: 46,
            },
        )
        .expect("send");
    match h.next_request().await {
        Request::SendPacket {
            id,
            dest: Some(d),
            packet_id,
            dscp,
            payload,
        } => {
            assert_eq!(id, raw);
            assert_eq!(d, dest);
            assert_eq!(packet_id, 7);
            assert_eq!(dscp, 46);
            assert_eq!(payload, b"ping");
        }
        other => panic!("expected SendPacket, got {other:?}"),
    }

    // Completion and inbound data come back as events.
    h.inject(Event::SentConfirmation {
        id: raw,
        packet_id: 7,
        send_time_ms: 1111,
    });
    h.inject(Event::DataReceived {
        id: raw,
        source: dest,
        timestamp_ms: 2222,
        payload: b"pong".to_vec(),
    });
    assert_eq!(
        next_event(&mut socket).await,
        Some(SocketEvent::Sent {
            packet_id: 7,
            send_time_ms: 1111
        })
    );
    assert_eq!(
        next_event(&mut socket).await,
        Some(SocketEvent::Data {
            payload: b"pong".to_vec(),
            source: dest,
            timestamp_ms: 2222
        })
    );
}

#[tokio::test(flavor = "current_thread")]
async fn client_socket_queues_sends_until_opened() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    let remote = v4(198, 51, 100, 7, 443);
    let mut socket = handle
        .create_client_socket(any_port(), remote, 0)
        .await
        .expect("create client socket");
    let raw = socket.id().get();
    assert!(matches!(
        h.next_request().await,
        Request::CreateClientTcpSocket { id, .. } if id == raw
    ));

    socket
        .send(b"first".to_vec(), None, SendOptions { packet_id: 1, dscp: 0 })
        .expect("send");
    socket
        .send(b"second".to_vec(), None, SendOptions { packet_id: 2, dscp: 0 })
        .expect("send");

    // Barrier: a later create command round-trips through the actor, proving the sends
    // above were processed and queued rather than forwarded.
    let _barrier = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("barrier socket");
    assert!(matches!(
        h.next_request().await,
        Request::CreateUdpSocket { .. }
    ));

    h.inject(Event::Opened {
        id: raw,
        local: v4(10, 0, 0, 2, 50001),
    });
    assert!(matches!(
        next_event(&mut socket).await,
        Some(SocketEvent::Opened { .. })
    ));

    // The queue flushes in submission order.
    for expected in [1u64, 2] {
        match h.next_request().await {
            Request::SendPacket { id, packet_id, .. } => {
                assert_eq!(id, raw);
                assert_eq!(packet_id, expected);
            }
            other => panic!("expected SendPacket, got {other:?}"),
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn connection_failure_is_delivered_exactly_once() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    let mut socket = handle
        .create_client_socket(any_port(), v4(198, 51, 100, 7, 443), 0)
        .await
        .expect("create client socket");
    let raw = socket.id().get();
    h.next_request().await;

    h.inject(Event::ConnectionFailed {
        id: raw,
        code: ERROR_CODE_CONNECTION_REFUSED,
        message: "refused".to_owned(),
    });
    // A duplicate terminal event crossing in flight must be dropped.
    h.inject(Event::ConnectionFailed {
        id: raw,
        code: ERROR_CODE_CONNECTION_REFUSED,
        message: "refused".to_owned(),
    });

    match next_event(&mut socket).await {
        Some(SocketEvent::Failed { error }) => {
            assert_eq!(error.code, ERROR_CODE_CONNECTION_REFUSED);
        }
        other => panic!("expected Failed event, got {other:?}"),
    }
    // Terminal: the event stream ends instead of delivering a second failure.
    assert_eq!(next_event(&mut socket).await, None);
}

#[tokio::test(flavor = "current_thread")]
async fn close_sends_exactly_one_close_request() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    let mut socket = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("create datagram socket");
    let raw = socket.id().get();
    h.next_request().await;

    socket.close();
    socket.close();
    drop(socket);

    // Barrier to flush the command queue.
    let _barrier = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("barrier socket");

    assert!(matches!(
        h.next_request().await,
        Request::Close { id } if id == raw
    ));
    assert!(matches!(
        h.next_request().await,
        Request::CreateUdpSocket { .. }
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn dropping_the_handle_closes_the_socket() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    let socket = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("create datagram socket");
    let raw = socket.id().get();
    h.next_request().await;

    drop(socket);

    assert!(matches!(
        h.next_request().await,
        Request::Close { id } if id == raw
    ));

    // Events arriving after the close are dropped without crashing anything.
    h.inject(Event::DataReceived {
        id: raw,
        source: v4(203, 0, 113, 9, 3478),
        timestamp_ms: 0,
        payload: b"late".to_vec(),
    });
    let _still_alive = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("service survives late events");
}

#[tokio::test(flavor = "current_thread")]
async fn resolver_resolves_and_fails_exactly_once() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    let lookup = tokio::spawn({
        let handle = handle.clone();
        async move { handle.resolve("example.test").await }
    });
    let raw = match h.next_request().await {
        Request::CreateResolver { id, query } => {
            assert_eq!(query, "example.test");
            id
        }
        other => panic!("expected CreateResolver, got {other:?}"),
    };

    let addr = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
    h.inject(Event::Resolved {
        id: raw,
        addresses: vec![addr],
    });
    // The duplicate is silently dropped.
    h.inject(Event::Resolved {
        id: raw,
        addresses: vec![addr],
    });
    assert_eq!(lookup.await.unwrap(), Ok(vec![addr]));

    // Failure path.
    let lookup = tokio::spawn({
        let handle = handle.clone();
        async move { handle.resolve("missing.test").await }
    });
    let raw = match h.next_request().await {
        Request::CreateResolver { id, .. } => id,
        other => panic!("expected CreateResolver, got {other:?}"),
    };
    h.inject(Event::ResolutionFailed {
        id: raw,
        code: ERROR_CODE_NAME_NOT_RESOLVED,
        message: "nxdomain".to_owned(),
    });
    match lookup.await.unwrap() {
        Err(ResolveError::Provider(error)) => {
            assert_eq!(error.code, ERROR_CODE_NAME_NOT_RESOLVED);
        }
        other => panic!("expected provider failure, got {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn interleaved_events_route_without_cross_talk() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    let mut first = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("create first");
    let mut second = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("create second");
    assert_ne!(first.id(), second.id());
    h.next_request().await;
    h.next_request().await;

    let source = v4(203, 0, 113, 9, 3478);
    h.inject(Event::DataReceived {
        id: first.id().get(),
        source,
        timestamp_ms: 1,
        payload: b"for-first".to_vec(),
    });
    h.inject(Event::DataReceived {
        id: second.id().get(),
        source,
        timestamp_ms: 2,
        payload: b"for-second".to_vec(),
    });
    h.inject(Event::DataReceived {
        id: first.id().get(),
        source,
        timestamp_ms: 3,
        payload: b"for-first-again".to_vec(),
    });

    match next_event(&mut first).await {
        Some(SocketEvent::Data { payload, .. }) => assert_eq!(payload, b"for-first"),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut first).await {
        Some(SocketEvent::Data { payload, .. }) => assert_eq!(payload, b"for-first-again"),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut second).await {
        Some(SocketEvent::Data { payload, .. }) => assert_eq!(payload, b"for-second"),
        other => panic!("unexpected event {other:?}"),
    }
}

struct BrokenTransport;

impl RequestTransport for BrokenTransport {
    fn send(&mut self, _frame: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError {
            reason: "pipe broken".to_owned(),
        })
    }
}

#[tokio::test(flavor = "current_thread")]
async fn transport_failure_surfaces_as_terminal_failure() {
    let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let service = RtcSocketService::spawn(ServiceConfig::default(), BrokenTransport, inbound_rx);
    let handle = service.handle();

    // Creation still hands back a handle; the undeliverable create request is folded
    // into a terminal failure event instead of a synchronous error.
    let mut socket = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("create returns optimistically");
    match next_event(&mut socket).await {
        Some(SocketEvent::Failed { error }) => {
            assert_eq!(error.code, ERROR_CODE_TRANSPORT_FAILURE);
        }
        other => panic!("expected transport failure event, got {other:?}"),
    }
    assert_eq!(next_event(&mut socket).await, None);

    // Resolutions fail the same way.
    match handle.resolve("example.test").await {
        Err(ResolveError::Provider(error)) => {
            assert_eq!(error.code, ERROR_CODE_TRANSPORT_FAILURE);
        }
        other => panic!("expected provider failure, got {other:?}"),
    }

    service.shutdown().await;
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_inbound_frames_are_dropped() {
    let mut h = Harness::new();
    let handle = h.service.handle();

    h.inbound_tx.send(vec![0xff; 3]).expect("inject garbage");
    h.inbound_tx
        .send(vec![0x00; 64])
        .expect("inject unknown message type");

    // The service keeps running and serving traffic.
    let mut socket = handle
        .create_datagram_socket(any_port(), PortRange::ANY)
        .await
        .expect("create after garbage");
    let raw = socket.id().get();
    h.next_request().await;
    h.inject(Event::Opened {
        id: raw,
        local: v4(10, 0, 0, 5, 54321),
    });
    assert!(matches!(
        next_event(&mut socket).await,
        Some(SocketEvent::Opened { .. })
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn shutdown_ends_outstanding_waiters() {
    let h = Harness::new();
    let handle = h.service.handle();

    let lookup = tokio::spawn({
        let handle = handle.clone();
        async move { handle.resolve("never.test").await }
    });
    // Give the resolve command a chance to register.
    tokio::task::yield_now().await;

    h.service.shutdown().await;
    assert_eq!(lookup.await.unwrap(), Err(ResolveError::ServiceClosed));
}

//! Two end hosts talking over the in-memory network.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use scion_ssp::core::DispatchError;
use scion_ssp::prelude::*;

const A: &str = "10.0.0.1";
const B: &str = "10.0.1.1";

struct Fixture {
    net: MemoryNetwork,
    a: EndHost,
    b: EndHost,
    b_addr: ScionAddr,
    paths: Vec<Path>,
}

fn ia(as_id: u32) -> IsdAs {
    IsdAs::new(1, as_id)
}

fn setup() -> Fixture {
    let a_addr = ScionAddr::new(ia(10), A.parse().unwrap());
    let b_addr = ScionAddr::new(ia(11), B.parse().unwrap());
    let paths = vec![
        Path::new(
            vec![
                Hop::new(ia(10), 0, 1),
                Hop::new(ia(12), 2, 3),
                Hop::new(ia(11), 4, 0),
            ],
            1400,
        ),
        Path::new(
            vec![
                Hop::new(ia(10), 0, 5),
                Hop::new(ia(13), 6, 7),
                Hop::new(ia(11), 8, 0),
            ],
            1400,
        ),
    ];
    let lookup = Arc::new(StaticPathLookup::new());
    lookup.insert(ia(10), ia(11), paths.clone());

    let net = MemoryNetwork::new();
    let (a_underlay, a_inbound) = net.attach(a_addr, 4096);
    let (b_underlay, b_inbound) = net.attach(b_addr, 4096);
    Fixture {
        a: EndHost::new(a_addr, a_underlay, a_inbound, lookup.clone()),
        b: EndHost::new(b_addr, b_underlay, b_inbound, lookup),
        net,
        b_addr,
        paths,
    }
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(20), fut)
        .await
        .expect("test timed out")
}

async fn open(f: &Fixture, config: StreamConfig) -> (SspStream, SspStream) {
    let listener = f.b.listen(8000, config.clone()).unwrap();
    let remote = ScionSocketAddr::new(f.b_addr, 8000);
    let (client, server) = tokio::join!(f.a.connect(remote, config), listener.accept());
    (client.unwrap(), server.unwrap())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_stream_transfer_both_ways() {
    within(async {
        let f = setup();
        let (client, server) = open(&f, StreamConfig::default()).await;
        assert_eq!(client.phase(), ConnectionPhase::Established);
        assert_eq!(server.peer_addr(), client.local_addr());
        assert!(!server.peer_paths().is_empty());

        let data = pattern(64 * 1024);
        let mut received = vec![0u8; data.len()];
        let (sent, read) = tokio::join!(client.send_all(&data), server.recv_exact(&mut received));
        sent.unwrap();
        read.unwrap();
        assert_eq!(received, data);

        server.send_all(b"done").await.unwrap();
        let mut reply = [0u8; 4];
        client.recv_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"done");

        client.flush().await.unwrap();
        let stats = client.stats();
        assert!(stats.bytes_sent >= data.len() as u64);
        assert!(stats.paths.iter().any(|p| p.state.counters.sent > 0));
    })
    .await;
}

#[tokio::test]
async fn test_reservation_reaches_responder() {
    within(async {
        let f = setup();
        let reservation = PathReservation {
            priority: 3,
            bandwidth_kbps: 20_000,
            duration: Duration::from_secs(60),
        };
        let listener = f.b.listen(8000, StreamConfig::default()).unwrap();
        let config = StreamConfig::builder().reservation(reservation).build();
        let remote = ScionSocketAddr::new(f.b_addr, 8000);
        let (client, server) = tokio::join!(f.a.connect(remote, config), listener.accept());
        let (client, server) = (client.unwrap(), server.unwrap());

        assert_eq!(server.peer_reservation(), Some(reservation));
        assert_eq!(client.peer_reservation(), None);
    })
    .await;
}

#[tokio::test]
async fn test_graceful_close_reaches_eof() {
    within(async {
        let f = setup();
        let (client, server) = open(&f, StreamConfig::default()).await;

        client.send_all(b"last words").await.unwrap();
        client.close(true);

        let mut buf = [0u8; 10];
        server.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last words");
        assert_eq!(server.recv(&mut buf).await.unwrap(), 0);

        server.close(true);
        client.closed().await.unwrap();
        assert_eq!(client.phase(), ConnectionPhase::Closed);
    })
    .await;
}

#[tokio::test]
async fn test_close_unblocks_pending_recv() {
    within(async {
        let f = setup();
        let (client, server) = open(&f, StreamConfig::default()).await;
        let server = Arc::new(server);

        let reader = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                server.recv(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close(false);

        let result = reader.await.unwrap();
        assert!(matches!(
            result,
            Err(SspError::Connection(ConnectionError::Closed))
        ));

        // The peer was reset.
        let mut buf = [0u8; 16];
        assert!(matches!(
            client.recv(&mut buf).await,
            Err(SspError::Connection(ConnectionError::Reset))
        ));
    })
    .await;
}

#[tokio::test]
async fn test_close_unblocks_pending_send() {
    within(async {
        let f = setup();
        let config = StreamConfig::builder()
            .recv_window(4)
            .max_unit_size(512)
            .build();
        let (client, _server) = open(&f, config).await;
        let client = Arc::new(client);

        // The server never reads, so the window closes after 2 KiB.
        let writer = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_all(&pattern(64 * 1024)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());
        assert!(client.stats().bytes_sent <= 2048);

        client.close(false);
        let result = writer.await.unwrap();
        assert!(matches!(
            result,
            Err(SspError::Connection(ConnectionError::Closed))
        ));
    })
    .await;
}

#[tokio::test]
async fn test_shutdown_unblocks_pending_connect() {
    within(async {
        let f = setup();
        let config = StreamConfig::builder()
            .handshake(Duration::from_secs(5), 5)
            .build();
        let remote = ScionSocketAddr::new(f.b_addr, 9000);
        let connecting = {
            let a = f.a.clone();
            tokio::spawn(async move { a.connect(remote, config).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!connecting.is_finished());

        f.a.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), connecting)
            .await
            .expect("connect still blocked after shutdown")
            .unwrap();
        assert!(matches!(
            result,
            Err(SspError::Connection(ConnectionError::Closed))
        ));
    })
    .await;
}

#[tokio::test]
async fn test_recv_timeout() {
    within(async {
        let f = setup();
        let (client, _server) = open(&f, StreamConfig::default()).await;
        client.set_timeout(Some(Duration::from_millis(30)));

        let mut buf = [0u8; 4];
        assert!(matches!(
            client.recv(&mut buf).await,
            Err(SspError::Connection(ConnectionError::TimedOut))
        ));
        assert_eq!(client.phase(), ConnectionPhase::Established);
    })
    .await;
}

#[tokio::test]
async fn test_connect_without_path_sends_nothing() {
    within(async {
        let f = setup();
        let unreachable = ScionSocketAddr::new(ScionAddr::new(ia(99), B.parse().unwrap()), 8000);
        let result = f.a.connect(unreachable, StreamConfig::default()).await;
        assert!(matches!(
            result,
            Err(SspError::Connection(ConnectionError::NoPathAvailable))
        ));
        assert_eq!(f.net.stats().forwarded, 0);
    })
    .await;
}

#[tokio::test]
async fn test_failover_after_path_failure() {
    within(async {
        let f = setup();
        let config = StreamConfig::builder()
            .strategy(SelectionStrategy::PrimaryStandby)
            .probing(Duration::from_millis(50), 2)
            .rto_bounds(Duration::from_millis(20), Duration::from_secs(1))
            .build();
        let (client, server) = open(&f, config).await;

        client.send_all(b"warm up").await.unwrap();
        let mut buf = [0u8; 7];
        server.recv_exact(&mut buf).await.unwrap();

        let primary = client
            .stats()
            .paths
            .iter()
            .max_by_key(|p| p.state.counters.sent)
            .map(|p| p.state.id)
            .unwrap();
        f.net.set_path_down(primary, true);

        let data = pattern(16 * 1024);
        let mut received = vec![0u8; data.len()];
        let (sent, read) = tokio::join!(client.send_all(&data), server.recv_exact(&mut received));
        sent.unwrap();
        read.unwrap();
        assert_eq!(received, data);

        let standby_used = client
            .stats()
            .paths
            .iter()
            .any(|p| p.state.id != primary && p.state.counters.sent > 0);
        assert!(standby_used);
        assert!(f.net.stats().path_down > 0);
    })
    .await;
}

#[tokio::test]
async fn test_blacklist_applies_live() {
    within(async {
        let f = setup();
        let (client, server) = open(&f, StreamConfig::default()).await;

        let avoid_12 = PathConstraints {
            isd_as_blacklist: HashSet::from([ia(12)]),
            ..PathConstraints::default()
        };
        client.set_policy(avoid_12.clone());
        server.set_policy(avoid_12);
        // Let handshake-time probe replies settle.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = path_sent(&client, f.paths[0].id());

        let data = pattern(8 * 1024);
        let mut received = vec![0u8; data.len()];
        let (sent, read) = tokio::join!(client.send_all(&data), server.recv_exact(&mut received));
        sent.unwrap();
        read.unwrap();

        assert_eq!(path_sent(&client, f.paths[0].id()), before);
        assert!(path_sent(&client, f.paths[1].id()) > 0);
    })
    .await;
}

fn path_sent(stream: &SspStream, id: PathId) -> u64 {
    stream
        .stats()
        .paths
        .iter()
        .find(|p| p.state.id == id)
        .map_or(0, |p| p.state.counters.sent)
}

#[tokio::test]
async fn test_datagram_with_traceroute() {
    within(async {
        let f = setup();
        let server = f.b.bind_datagram(53).unwrap();
        let client = f.a.bind_datagram(0).unwrap();
        let remote = server.local_addr();

        let traceroute = Traceroute::with_capacity(4).unwrap();
        client
            .send_via(b"query", remote, &f.paths[0], vec![traceroute])
            .unwrap();

        let request = server.recv_datagram().await.unwrap();
        assert_eq!(request.data, b"query");
        assert_eq!(request.src, client.local_addr());
        let hops = request.traceroute.unwrap();
        let ifids: Vec<u16> = hops.iter().map(|h| h.ifid).collect();
        assert_eq!(ifids, vec![1, 3, 4]);

        server
            .send_via(b"answer", request.src, &request.path.reverse(), Vec::new())
            .unwrap();
        let mut buf = [0u8; 3];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ans");
        assert_eq!(from, remote);

        client.send_to(b"policy routed", remote).await.unwrap();
        let routed = server.recv_datagram().await.unwrap();
        assert_eq!(routed.data, b"policy routed");
        assert!(routed.traceroute.is_none());
    })
    .await;
}

#[tokio::test]
async fn test_port_registration_is_exclusive() {
    within(async {
        let f = setup();
        let _listener = f.b.listen(8000, StreamConfig::default()).unwrap();
        assert!(matches!(
            f.b.listen(8000, StreamConfig::default()),
            Err(SspError::Dispatch(DispatchError::AlreadyBound { port: 8000, .. }))
        ));
        // Other protocol, same port.
        f.b.bind_datagram(8000).unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_shutdown_fails_open_streams() {
    within(async {
        let f = setup();
        let (client, _server) = open(&f, StreamConfig::default()).await;

        f.a.shutdown();
        let mut buf = [0u8; 4];
        assert!(client.recv(&mut buf).await.is_err());
        assert!(client.closed().await.is_ok());
        assert!(matches!(
            f.a.bind(0),
            Err(SspError::Dispatch(DispatchError::Shutdown))
        ));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out_without_listener() {
    within(async {
        let f = setup();
        let config = StreamConfig::builder()
            .handshake(Duration::from_millis(100), 2)
            .build();
        let remote = ScionSocketAddr::new(f.b_addr, 9000);
        let result = f.a.connect(remote, config).await;
        assert!(matches!(
            result,
            Err(SspError::Connection(ConnectionError::HandshakeTimeout { attempts: 3 }))
        ));
        assert_eq!(f.b.dispatcher().stats().no_target, 3);
    })
    .await;
}

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::*;
use crate::bus::MessageHandlerFn;
use crate::gossip::GossipConfig;
use crate::media::{Cluster, MediaConfig, MediaMetadata, PlaybackSink};
use crate::origin::ByteRange;
use crate::transport::memory::MemoryRouter;

macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !$cond {
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

async fn spawn_peer_with(router: &Arc<MemoryRouter>, id: &str, mut config: PeerConfig) -> Peer {
    config.peer_id = Some(id.to_owned());
    let peer = Peer::new(
        config,
        Arc::new(router.connector(id)),
        Arc::new(router.signaling(Some(id))),
        None,
    )
    .expect("peer construction");
    peer.start().await.expect("peer start");
    peer
}

async fn spawn_peer(router: &Arc<MemoryRouter>, id: &str) -> Peer {
    spawn_peer_with(router, id, PeerConfig::default()).await
}

fn recording_listener(log: Arc<Mutex<Vec<Message>>>) -> MessageHandlerFn {
    Box::new(move |m: Message| {
        let log = Arc::clone(&log);
        Box::pin(async move {
            log.lock().await.push(m);
        })
    })
}

/// The larger id must ask: the signaling tier discards request-peers from
/// ids ordered before the receiver's.
async fn connect(larger: &Peer, smaller_id: &str) {
    larger
        .request_peer(Some(smaller_id))
        .await
        .expect("request-peer");
    wait_until!(
        "handshake",
        larger.open_remotes().await.contains(&smaller_id.to_owned())
    );
}

#[tokio::test]
async fn test_handshake_over_signaling() {
    let router = MemoryRouter::new();
    let a = spawn_peer(&router, "a").await;
    let b = spawn_peer(&router, "b").await;

    b.request_peer(Some("a")).await.expect("request-peer");

    wait_until!("a sees b", a.open_remotes().await == vec!["b".to_owned()]);
    wait_until!("b sees a", b.open_remotes().await == vec!["a".to_owned()]);
    assert_eq!(
        a.connection_state("b").await,
        Some(crate::connection::ConnectionState::Open)
    );

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_identity_adopted_from_first_view() {
    let router = MemoryRouter::new();
    let peer = Peer::new(
        PeerConfig::default(),
        Arc::new(router.connector("peer-1")),
        Arc::new(router.signaling(None)),
        None,
    )
    .unwrap();
    peer.start().await.unwrap();

    wait_until!("assigned id", peer.id().await == "peer-1");

    peer.close().await.unwrap();
}

#[tokio::test]
async fn test_three_peer_mesh_forward() {
    let router = MemoryRouter::new();
    let a = spawn_peer(&router, "a").await;
    let b = spawn_peer(&router, "b").await;
    let c = spawn_peer(&router, "c").await;

    // A <-> B and B <-> C only.
    connect(&b, "a").await;
    connect(&c, "b").await;
    wait_until!("a-b open", a.open_remotes().await.contains(&"b".to_owned()));
    wait_until!("b-c open", b.open_remotes().await.contains(&"c".to_owned()));

    let seen_at_c = Arc::new(Mutex::new(vec![]));
    c.bus()
        .on(
            MessageType::RequestPeer,
            recording_listener(Arc::clone(&seen_at_c)),
        )
        .await;

    a.send(Message::forwardable(
        MessageType::RequestPeer,
        "a",
        "c",
        3,
    ))
    .await
    .expect("broadcast towards c");

    wait_until!("c observes the request", !seen_at_c.lock().await.is_empty());

    let seen = seen_at_c.lock().await;
    assert_eq!(seen[0].from, "a");
    assert_eq!(seen[0].ttl, Some(2), "one forward hop decrements once");
    assert_eq!(seen[0].forward_by, Some(vec!["b".to_owned()]));

    a.close().await.unwrap();
    b.close().await.unwrap();
    c.close().await.unwrap();
}

#[tokio::test]
async fn test_queued_until_connected() {
    let router = MemoryRouter::new();
    let a = spawn_peer(&router, "a").await;
    let b = spawn_peer(&router, "b").await;

    let requests_at_a = Arc::new(Mutex::new(vec![]));
    a.bus()
        .on(
            MessageType::RequestPeer,
            recording_listener(Arc::clone(&requests_at_a)),
        )
        .await;
    let parts_at_a = Arc::new(Mutex::new(vec![]));
    a.bus()
        .on(
            MessageType::MediaRequestPart,
            recording_listener(Arc::clone(&parts_at_a)),
        )
        .await;

    let outcome = b
        .send(
            Message::new(MessageType::MediaRequestPart, "b", "a")
                .with_url("http://o/v.webm")
                .with_number("0"),
        )
        .await
        .expect("send");
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(b.pending_messages().await, 1);

    // The missing connection was requested alongside the enqueue and the
    // queue drains the moment it opens.
    wait_until!("a heard the request-peer", !requests_at_a.lock().await.is_empty());
    wait_until!("queue drained", b.pending_messages().await == 0);
    wait_until!("message arrived", !parts_at_a.lock().await.is_empty());

    assert_eq!(parts_at_a.lock().await[0].number.as_deref(), Some("0"));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_timeout_fires_callback_once() {
    let router = MemoryRouter::new();
    let peer = spawn_peer(&router, "a").await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let on_timeout: OnTimeoutFn = Box::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    });

    let outcome = peer
        .send_with_timeout(
            Message::new(MessageType::MediaRequestPart, "a", "ghost").with_number("0"),
            Duration::from_millis(1500),
            on_timeout,
        )
        .await
        .expect("send");
    assert_eq!(outcome, SendOutcome::Queued);

    let settle = || async {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    };

    settle().await;
    assert_eq!(peer.pending_messages().await, 1);

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(peer.pending_messages().await, 1, "1000 < 1500: retained");
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(peer.pending_messages().await, 0, "2000 > 1500: expired");
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(2000)).await;
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1, "the callback fires once");

    peer.close().await.unwrap();
}

#[tokio::test]
async fn test_simultaneous_open_smaller_id_yields() {
    let router = MemoryRouter::new();
    let a = spawn_peer(&router, "a").await;

    // Our own offer to b is in flight...
    a.internal.clone()
        .on_request_peer(Message::forwardable(MessageType::RequestPeer, "b", "a", 3))
        .await;
    let ours = a.internal.registry.get_live("b").await.expect("own offer");
    assert!(ours.initiated_offer());

    // ...when b's offer crosses it. "a" < "b": we yield and answer.
    a.internal.clone()
        .on_offer(
            Message::forwardable(MessageType::Offer, "b", "a", 3)
                .with_data(serde_json::Value::String("sdp:offer:b:a".to_owned())),
        )
        .await;

    let replaced = a.internal.registry.get_live("b").await.expect("answered");
    assert!(
        !replaced.initiated_offer(),
        "the yielding side becomes the answerer"
    );
    assert!(replaced.remote_described());

    a.close().await.unwrap();
}

#[tokio::test]
async fn test_simultaneous_open_larger_id_keeps_offer() {
    let router = MemoryRouter::new();
    let c = spawn_peer(&router, "c").await;

    c.internal.clone()
        .on_request_peer(Message::forwardable(MessageType::RequestPeer, "b", "c", 3))
        .await;
    c.internal.clone()
        .on_offer(
            Message::forwardable(MessageType::Offer, "b", "c", 3)
                .with_data(serde_json::Value::String("sdp:offer:b:c".to_owned())),
        )
        .await;

    let kept = c.internal.registry.get_live("b").await.expect("our offer");
    assert!(kept.initiated_offer(), "the larger id ignores the rival offer");
    assert!(!kept.remote_described());

    c.close().await.unwrap();
}

#[tokio::test]
async fn test_early_candidates_buffered_until_offer() {
    let router = MemoryRouter::new();
    let a = spawn_peer(&router, "a").await;

    a.internal.clone()
        .on_remote_candidate(
            Message::forwardable(MessageType::IceCandidate, "z", "a", 3)
                .with_data(serde_json::Value::String("candidate:z:0".to_owned())),
        )
        .await;
    assert_eq!(a.internal.registry.pending_candidate_count("z").await, 1);

    a.internal.clone()
        .on_offer(
            Message::forwardable(MessageType::Offer, "z", "a", 3)
                .with_data(serde_json::Value::String("sdp:offer:z:a".to_owned())),
        )
        .await;

    assert_eq!(
        a.internal.registry.pending_candidate_count("z").await,
        0,
        "buffered candidates drain with the remote description"
    );

    a.close().await.unwrap();
}

#[tokio::test]
async fn test_send_after_close() {
    let router = MemoryRouter::new();
    let peer = spawn_peer(&router, "a").await;
    peer.close().await.unwrap();
    peer.close().await.unwrap();

    let err = peer
        .send(Message::new(MessageType::MediaRequestHead, "a", "b"))
        .await;
    assert_eq!(err, Err(crate::Error::ErrClosed));
}

fn fast_gossip() -> GossipConfig {
    GossipConfig {
        gossip_period: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_gossip_converges_across_the_mesh() {
    let router = MemoryRouter::new();
    let mut config_a = PeerConfig::default();
    config_a.gossip = Some(fast_gossip());
    let mut config_b = PeerConfig::default();
    config_b.gossip = Some(fast_gossip());

    let a = spawn_peer_with(&router, "a", config_a).await;
    let b = spawn_peer_with(&router, "b", config_b).await;

    // b bootstraps knowing a (first-view); gossip builds the rest: the
    // exchange request queues, a request-peer opens the channel, and the
    // buffers flow.
    wait_until!("a learns b", {
        let view = a.gossip().unwrap().view().await;
        view.iter().any(|d| d.id == "b")
    });
    wait_until!("b learns a", {
        let view = b.gossip().unwrap().view().await;
        view.iter().any(|d| d.id == "a")
    });

    let view = a.gossip().unwrap().view().await;
    assert!(view.iter().all(|d| d.id != "a"), "own id never in view");
    assert!(view.len() <= 10);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

struct StubOrigin {
    metadata: serde_json::Value,
    bytes: Bytes,
    range_fetches: AtomicUsize,
}

impl StubOrigin {
    fn new(metadata: &MediaMetadata, bytes: Bytes) -> Arc<Self> {
        Arc::new(StubOrigin {
            metadata: serde_json::to_value(metadata).unwrap(),
            bytes,
            range_fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl crate::origin::OriginClient for StubOrigin {
    async fn fetch_json(&self, _url: &str) -> crate::error::Result<serde_json::Value> {
        Ok(self.metadata.clone())
    }

    async fn fetch_range(&self, _url: &str, range: ByteRange) -> crate::error::Result<Bytes> {
        self.range_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .bytes
            .slice(range.start as usize..(range.end + 1) as usize))
    }

    async fn fetch(&self, _url: &str) -> crate::error::Result<Bytes> {
        Ok(self.bytes.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    head: Mutex<Option<Bytes>>,
    appended: Mutex<Vec<Bytes>>,
    ended: AtomicBool,
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn init(&self, head: Bytes) -> crate::error::Result<()> {
        *self.head.lock().await = Some(head);
        Ok(())
    }

    async fn append(&self, data: Bytes) -> crate::error::Result<()> {
        self.appended.lock().await.push(data);
        Ok(())
    }

    async fn end_of_stream(&self) -> crate::error::Result<()> {
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn test_metadata() -> (MediaMetadata, Bytes) {
    let bytes: Bytes = (0u8..90).collect::<Vec<u8>>().into();
    let metadata = MediaMetadata {
        size: 90,
        duration: 9.0,
        clusters: vec![
            Cluster {
                offset: 30,
                timecode: 0.0,
            },
            Cluster {
                offset: 50,
                timecode: 3.0,
            },
            Cluster {
                offset: 70,
                timecode: 6.0,
            },
        ],
    };
    (metadata, bytes)
}

#[tokio::test]
async fn test_media_parts_flow_peer_to_peer() {
    let url = "http://origin.invalid/v.webm";
    let meta_url = "http://origin.invalid/v.json";
    let (metadata, bytes) = test_metadata();

    let router = MemoryRouter::new();

    // Seeder: small chunks so serving exercises chunking.
    let mut seeder_config = PeerConfig::default();
    seeder_config.gossip = Some(fast_gossip());
    seeder_config.media = Some(MediaConfig {
        chunk_size: 16,
        ..Default::default()
    });
    let seeder_origin = StubOrigin::new(&metadata, bytes.clone());
    let seeder = {
        let mut config = seeder_config;
        config.peer_id = Some("a".to_owned());
        let peer = Peer::new(
            config,
            Arc::new(router.connector("a")),
            Arc::new(router.signaling(Some("a"))),
            Some(Arc::clone(&seeder_origin) as Arc<dyn crate::origin::OriginClient>),
        )
        .unwrap();
        peer.start().await.unwrap();
        peer
    };

    let seeder_sink = Arc::new(RecordingSink::default());
    seeder
        .media()
        .unwrap()
        .add(url, meta_url, Arc::clone(&seeder_sink) as Arc<dyn PlaybackSink>)
        .await
        .unwrap();
    wait_until!("seeder complete", seeder.media().unwrap().is_complete(url).await);

    // Leecher: joins, learns through gossip what the seeder holds, then
    // pulls every part over the mesh. Its origin only serves the head.
    let mut leecher_config = PeerConfig::default();
    leecher_config.gossip = Some(fast_gossip());
    // Explicit load below, once the availability table is in place.
    leecher_config.media = Some(MediaConfig {
        autoload: false,
        ..Default::default()
    });
    let leecher_origin = StubOrigin::new(&metadata, bytes.clone());
    let leecher = {
        let mut config = leecher_config;
        config.peer_id = Some("b".to_owned());
        let peer = Peer::new(
            config,
            Arc::new(router.connector("b")),
            Arc::new(router.signaling(Some("b"))),
            Some(Arc::clone(&leecher_origin) as Arc<dyn crate::origin::OriginClient>),
        )
        .unwrap();
        peer.start().await.unwrap();
        peer
    };

    let leecher_sink = Arc::new(RecordingSink::default());
    leecher
        .media()
        .unwrap()
        .add(url, meta_url, Arc::clone(&leecher_sink) as Arc<dyn PlaybackSink>)
        .await
        .unwrap();

    wait_until!(
        "leecher sees the seeder's parts",
        leecher.media().unwrap().remotes(url).await.get("a") == Some(&vec![0, 1, 2])
    );
    leecher.media().unwrap().load(url).await.unwrap();

    wait_until!("leecher complete", leecher.media().unwrap().is_complete(url).await);

    assert_eq!(
        *leecher_sink.head.lock().await,
        Some(bytes.slice(0..30)),
        "head initializes the sink"
    );
    let appended = leecher_sink.appended.lock().await;
    assert_eq!(appended.len(), 3);
    assert_eq!(appended[0], bytes.slice(30..50));
    assert_eq!(appended[1], bytes.slice(50..70));
    assert_eq!(appended[2], bytes.slice(70..90));
    assert!(leecher_sink.ended.load(Ordering::SeqCst));

    assert_eq!(
        leecher_origin.range_fetches.load(Ordering::SeqCst),
        1,
        "only the head came from the origin"
    );

    seeder.close().await.unwrap();
    leecher.close().await.unwrap();
}

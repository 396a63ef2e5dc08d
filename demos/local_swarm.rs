use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use meshcast::media::{Cluster, MediaConfig, MediaMetadata, PlaybackSink};
use meshcast::origin::{ByteRange, OriginClient};
use meshcast::peer::{Peer, PeerConfig};
use meshcast::gossip::GossipConfig;
use meshcast::transport::memory::MemoryRouter;

const URL: &str = "http://origin.local/demo.webm";
const META_URL: &str = "http://origin.local/demo.json";

struct DemoOrigin {
    metadata: serde_json::Value,
    bytes: Bytes,
}

#[async_trait]
impl OriginClient for DemoOrigin {
    async fn fetch_json(&self, _url: &str) -> meshcast::Result<serde_json::Value> {
        Ok(self.metadata.clone())
    }

    async fn fetch_range(&self, _url: &str, range: ByteRange) -> meshcast::Result<Bytes> {
        Ok(self
            .bytes
            .slice(range.start as usize..(range.end + 1) as usize))
    }

    async fn fetch(&self, _url: &str) -> meshcast::Result<Bytes> {
        Ok(self.bytes.clone())
    }
}

struct PrintSink {
    name: &'static str,
    received: Mutex<usize>,
}

#[async_trait]
impl PlaybackSink for PrintSink {
    async fn init(&self, head: Bytes) -> meshcast::Result<()> {
        println!("[{}] head: {} bytes", self.name, head.len());
        Ok(())
    }

    async fn append(&self, data: Bytes) -> meshcast::Result<()> {
        let mut received = self.received.lock().await;
        *received += data.len();
        println!("[{}] +{} bytes ({} total)", self.name, data.len(), received);
        Ok(())
    }

    async fn end_of_stream(&self) -> meshcast::Result<()> {
        println!("[{}] end of stream", self.name);
        Ok(())
    }
}

fn demo_media() -> (MediaMetadata, Bytes) {
    let bytes: Bytes = (0..4096u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    let metadata = MediaMetadata {
        size: 4096,
        duration: 8.0,
        clusters: (0..8)
            .map(|i| Cluster {
                offset: 512 + i * 448,
                timecode: i as f64,
            })
            .collect(),
    };
    (metadata, bytes)
}

fn config(seed: bool) -> PeerConfig {
    PeerConfig {
        gossip: Some(GossipConfig {
            gossip_period: Duration::from_millis(250),
            ..Default::default()
        }),
        media: Some(MediaConfig {
            chunk_size: if seed { 300 } else { MediaConfig::default().chunk_size },
            // Viewers load explicitly, once gossip has told them who holds
            // what; the seeder starts right away.
            autoload: seed,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let (metadata, bytes) = demo_media();
    let router = MemoryRouter::new();

    let origin = Arc::new(DemoOrigin {
        metadata: serde_json::to_value(&metadata)?,
        bytes,
    });

    // The seeder pulls everything from the origin first.
    let seeder = Peer::new(
        config(true),
        Arc::new(router.connector("seeder")),
        Arc::new(router.signaling(Some("seeder"))),
        Some(Arc::clone(&origin) as Arc<dyn OriginClient>),
    )?;
    seeder.start().await?;
    let seeder_sink = Arc::new(PrintSink {
        name: "seeder",
        received: Mutex::new(0),
    });
    seeder
        .media()
        .expect("media enabled")
        .add(URL, META_URL, seeder_sink)
        .await?;
    while !seeder.media().expect("media enabled").is_complete(URL).await {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("[seeder] complete, joining viewers");

    // Viewers learn what the seeder holds through gossip and fetch the
    // parts over the mesh.
    let mut viewers = vec![];
    for name in ["viewer-1", "viewer-2"] {
        let viewer = Peer::new(
            config(false),
            Arc::new(router.connector(name)),
            Arc::new(router.signaling(Some(name))),
            Some(Arc::clone(&origin) as Arc<dyn OriginClient>),
        )?;
        viewer.start().await?;
        viewers.push(viewer);
    }

    for (i, viewer) in viewers.iter().enumerate() {
        let media = viewer.media().expect("media enabled");
        let sink = Arc::new(PrintSink {
            name: if i == 0 { "viewer-1" } else { "viewer-2" },
            received: Mutex::new(0),
        });
        media.add(URL, META_URL, sink).await?;
        loop {
            let remotes = media.remotes(URL).await;
            if remotes.values().any(|parts| parts.len() == 8) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        media.load(URL).await?;
    }

    for viewer in &viewers {
        while !viewer.media().expect("media enabled").is_complete(URL).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    println!("swarm done");

    seeder.close().await?;
    for viewer in viewers {
        viewer.close().await?;
    }
    Ok(())
}

#[cfg(test)]
mod media_test;

pub mod media;
pub mod media_config;
pub mod metadata;
pub mod part;
pub mod sink;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

pub use media::{Media, PartSource};
pub use media_config::MediaConfig;
pub use metadata::{Cluster, MediaMetadata};
pub use part::{chunk_bytes, Part, PartRef, PartStatus};
pub use sink::PlaybackSink;

use crate::bus::{ListenerId, MessageBus};
use crate::error::{Error, Result};
use crate::gossip::{DescriptorUpdate, View};
use crate::message::{Message, MessageType, PeerId};
use crate::origin::OriginClient;

/// Drives the metadata -> head -> parts state machine for every tracked
/// URL, picks a source per part with the origin as last resort, chunks
/// outgoing parts under the transport MTU and reassembles incoming ones.
///
/// It also plays the view-integrator role: every `gossip:view-update`
/// snapshot is projected into the per-media remote-availability tables,
/// and every part this node starts holding is published back into the own
/// descriptor via `gossip:descriptor-update`.
pub struct MediaFetcher {
    internal: Arc<MediaInternal>,
    listener_ids: Mutex<Vec<(MessageType, ListenerId)>>,
}

struct MediaEntry {
    media: Media,
    sink: Arc<dyn PlaybackSink>,
    /// One append task per media at a time.
    appending: bool,
    /// Autoload requested before the peer id was known.
    autoload_pending: bool,
}

pub(crate) struct MediaInternal {
    config: MediaConfig,
    bus: Arc<MessageBus>,
    outbound: mpsc::UnboundedSender<Message>,
    origin: Arc<dyn OriginClient>,
    self_id: Mutex<PeerId>,
    medias: Mutex<HashMap<String, MediaEntry>>,
}

impl MediaFetcher {
    pub fn new(
        config: MediaConfig,
        bus: Arc<MessageBus>,
        outbound: mpsc::UnboundedSender<Message>,
        origin: Arc<dyn OriginClient>,
    ) -> Self {
        MediaFetcher {
            internal: Arc::new(MediaInternal {
                config,
                bus,
                outbound,
                origin,
                self_id: Mutex::new(String::new()),
                medias: Mutex::new(HashMap::new()),
            }),
            listener_ids: Mutex::new(vec![]),
        }
    }

    /// Adopts the identity assigned by the signaling service and kicks off
    /// any media added before it was known.
    pub async fn set_self_id(&self, id: &str) {
        *self.internal.self_id.lock().await = id.to_owned();

        let pending: Vec<String> = {
            let mut medias = self.internal.medias.lock().await;
            medias
                .iter_mut()
                .filter(|(_, e)| e.autoload_pending)
                .map(|(url, e)| {
                    e.autoload_pending = false;
                    url.clone()
                })
                .collect()
        };
        for url in pending {
            self.internal
                .dispatch_local(MessageType::MediaRequestMetadata, &url)
                .await;
        }
    }

    /// Starts tracking `url`, whose metadata document lives at `meta_url`,
    /// feeding `sink` as parts come in.
    pub async fn add(
        &self,
        url: &str,
        meta_url: &str,
        sink: Arc<dyn PlaybackSink>,
    ) -> Result<()> {
        let id_known = !self.internal.self_id.lock().await.is_empty();
        let autoload = self.internal.config.autoload;
        {
            let mut medias = self.internal.medias.lock().await;
            medias.insert(
                url.to_owned(),
                MediaEntry {
                    media: Media::new(url, meta_url),
                    sink,
                    appending: false,
                    autoload_pending: autoload && !id_known,
                },
            );
        }
        if autoload && id_known {
            self.internal
                .dispatch_local(MessageType::MediaRequestMetadata, url)
                .await;
        }
        Ok(())
    }

    /// Explicit start for a media added with autoload off.
    pub async fn load(&self, url: &str) -> Result<()> {
        let medias = self.internal.medias.lock().await;
        if !medias.contains_key(url) {
            return Err(Error::ErrUnknownMedia);
        }
        drop(medias);
        self.internal
            .dispatch_local(MessageType::MediaRequestMetadata, url)
            .await;
        Ok(())
    }

    pub async fn tracked_urls(&self) -> Vec<String> {
        let medias = self.internal.medias.lock().await;
        let mut urls: Vec<String> = medias.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub async fn is_complete(&self, url: &str) -> bool {
        let medias = self.internal.medias.lock().await;
        medias.get(url).map_or(false, |e| e.media.complete)
    }

    pub async fn part_statuses(&self, url: &str) -> Vec<PartStatus> {
        let medias = self.internal.medias.lock().await;
        medias.get(url).map_or(vec![], |e| {
            e.media.parts.iter().map(|p| p.status).collect()
        })
    }

    pub async fn remotes(&self, url: &str) -> HashMap<PeerId, Vec<u32>> {
        let medias = self.internal.medias.lock().await;
        medias.get(url).map_or_else(HashMap::new, |e| e.media.remotes.clone())
    }

    /// Registers the media handlers and the view integrator on the bus.
    pub async fn start(&self) {
        let mut ids = self.listener_ids.lock().await;

        macro_rules! handler {
            ($kind:expr, $method:ident) => {{
                let internal = Arc::clone(&self.internal);
                ids.push((
                    $kind,
                    self.internal
                        .bus
                        .on(
                            $kind,
                            Box::new(move |m| {
                                let internal = Arc::clone(&internal);
                                Box::pin(async move { internal.$method(m).await })
                            }),
                        )
                        .await,
                ));
            }};
        }

        handler!(MessageType::MediaRequestMetadata, on_request_metadata);
        handler!(MessageType::MediaMetadata, on_metadata);
        handler!(MessageType::MediaRequestHead, on_request_head);
        handler!(MessageType::MediaHead, on_head);
        handler!(MessageType::MediaRequestPart, on_request_part);
        handler!(MessageType::MediaPart, on_part);
        handler!(MessageType::GossipViewUpdate, on_view_update);
    }

    pub async fn close(&self) {
        let bus = &self.internal.bus;
        for (kind, id) in self.listener_ids.lock().await.drain(..) {
            bus.remove_listener(kind, id).await;
        }
    }
}

impl MediaInternal {
    async fn self_id(&self) -> Option<PeerId> {
        let id = self.self_id.lock().await.clone();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    async fn dispatch_local(&self, kind: MessageType, url: &str) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        self.bus
            .dispatch(Message::new(kind, self_id.clone(), self_id).with_url(url))
            .await;
    }

    fn url_of(m: &Message) -> Option<String> {
        match m.url {
            Some(ref url) => Some(url.clone()),
            None => {
                log::warn!("dropping {} without url", m.kind);
                None
            }
        }
    }

    /// `media:request-metadata`: locally, fetch the metadata document from
    /// the origin; from a remote, answer with ours if we hold it.
    async fn on_request_metadata(self: Arc<Self>, m: Message) {
        let url = match Self::url_of(&m) {
            Some(u) => u,
            None => return,
        };
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };

        if m.from != self_id {
            let metadata = {
                let medias = self.medias.lock().await;
                medias.get(&url).and_then(|e| e.media.metadata.clone())
            };
            if let Some(metadata) = metadata {
                match serde_json::to_value(&metadata) {
                    Ok(data) => {
                        let answer = Message::new(MessageType::MediaMetadata, self_id, m.from)
                            .with_url(&url)
                            .with_data(data);
                        let _ = self.outbound.send(answer);
                    }
                    Err(err) => log::error!("failed to encode metadata: {}", err),
                }
            }
            return;
        }

        let meta_url = {
            let medias = self.medias.lock().await;
            match medias.get(&url) {
                Some(e) => e.media.meta_url.clone(),
                None => {
                    log::warn!("metadata requested for untracked url {}", url);
                    return;
                }
            }
        };

        let internal = Arc::clone(&self);
        tokio::spawn(async move {
            match internal.origin.fetch_json(&meta_url).await {
                Ok(json) => {
                    internal
                        .bus
                        .dispatch(
                            Message::new(MessageType::MediaMetadata, self_id.clone(), self_id)
                                .with_url(&url)
                                .with_data(json),
                        )
                        .await;
                }
                Err(err) => log::warn!("metadata fetch for {} failed: {}", url, err),
            }
        });
    }

    /// `media:metadata`: lay out the parts and move on to the head.
    async fn on_metadata(self: Arc<Self>, m: Message) {
        let url = match Self::url_of(&m) {
            Some(u) => u,
            None => return,
        };
        let metadata: MediaMetadata = match m.data_as() {
            Ok(md) => md,
            Err(err) => {
                log::warn!("bad metadata payload for {}: {}", url, err);
                return;
            }
        };

        {
            let mut medias = self.medias.lock().await;
            let entry = match medias.get_mut(&url) {
                Some(e) => e,
                None => {
                    log::warn!("metadata for untracked url {}", url);
                    return;
                }
            };
            if entry.media.metadata.is_some() {
                return;
            }
            log::debug!(
                "metadata for {}: {} clusters, {} bytes",
                url,
                metadata.part_count(),
                metadata.size
            );
            entry.media.init_parts(metadata);
        }

        self.dispatch_local(MessageType::MediaRequestHead, &url).await;
    }

    /// `media:request-head`: locally, range-fetch the prefix before the
    /// first cluster; from a remote, serve our copy if present.
    async fn on_request_head(self: Arc<Self>, m: Message) {
        let url = match Self::url_of(&m) {
            Some(u) => u,
            None => return,
        };
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };

        if m.from != self_id {
            let head = {
                let medias = self.medias.lock().await;
                medias.get(&url).and_then(|e| e.media.head.clone())
            };
            if let Some(head) = head {
                let answer = Message::new(MessageType::MediaHead, self_id, m.from)
                    .with_url(&url)
                    .with_data(Message::bytes_as_value(&head));
                let _ = self.outbound.send(answer);
            }
            return;
        }

        let range = {
            let medias = self.medias.lock().await;
            match medias.get(&url).and_then(|e| e.media.metadata.as_ref()) {
                Some(metadata) => metadata.head_range(),
                None => {
                    log::warn!("head requested before metadata for {}", url);
                    return;
                }
            }
        };

        match range {
            // First cluster at byte zero: nothing precedes it.
            None => {
                self.bus
                    .dispatch(
                        Message::new(MessageType::MediaHead, self_id.clone(), self_id)
                            .with_url(&url)
                            .with_data(Message::bytes_as_value(&[])),
                    )
                    .await;
            }
            Some(range) => {
                let internal = Arc::clone(&self);
                let media_url = url.clone();
                tokio::spawn(async move {
                    match internal.origin.fetch_range(&media_url, range).await {
                        Ok(bytes) => {
                            let msg = Message::new(
                                MessageType::MediaHead,
                                self_id.clone(),
                                self_id,
                            )
                            .with_url(&media_url)
                            .with_data(Message::bytes_as_value(&bytes));
                            internal.bus.dispatch(msg).await;
                        }
                        Err(err) => log::warn!("head fetch for {} failed: {}", media_url, err),
                    }
                });
            }
        }
    }

    /// `media:head`: initialize the sink, then open the request pipeline.
    async fn on_head(self: Arc<Self>, m: Message) {
        let url = match Self::url_of(&m) {
            Some(u) => u,
            None => return,
        };
        let head = match m.data_as_bytes() {
            Ok(b) => b,
            Err(err) => {
                log::warn!("bad head payload for {}: {}", url, err);
                return;
            }
        };

        let sink = {
            let mut medias = self.medias.lock().await;
            let entry = match medias.get_mut(&url) {
                Some(e) => e,
                None => {
                    log::warn!("head for untracked url {}", url);
                    return;
                }
            };
            if entry.media.head.is_some() {
                return;
            }
            entry.media.head = Some(head.clone());
            Arc::clone(&entry.sink)
        };

        if let Err(err) = sink.init(head).await {
            log::warn!("sink init for {} failed: {}", url, err);
        }

        self.ask_for_next_parts(&url, self.config.concurrent_parts)
            .await;
    }

    /// `media:request-part` from a remote: chunk our copy under the MTU
    /// and answer one `media:part` per chunk.
    async fn on_request_part(self: Arc<Self>, m: Message) {
        let url = match Self::url_of(&m) {
            Some(u) => u,
            None => return,
        };
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        let part_number = match m.number.as_deref().map(str::parse::<PartRef>) {
            Some(Ok(pr)) => pr.part_number(),
            _ => {
                log::warn!("dropping part request with bad number from {}", m.from);
                return;
            }
        };

        let bytes = {
            let medias = self.medias.lock().await;
            medias.get(&url).and_then(|e| {
                e.media
                    .parts
                    .get(part_number as usize)
                    .and_then(|p| p.bytes().cloned())
            })
        };
        let bytes = match bytes {
            Some(b) => b,
            None => {
                log::debug!(
                    "{} asked for part {} of {} which we do not hold",
                    m.from,
                    part_number,
                    url
                );
                return;
            }
        };

        let chunks = chunk_bytes(&bytes, self.config.chunk_size);
        let total = chunks.len() as u32;
        log::trace!(
            "serving part {} of {} to {} in {} chunks",
            part_number,
            url,
            m.from,
            total
        );
        for (index, chunk) in chunks.into_iter().enumerate() {
            let reference = PartRef::Chunk {
                part: part_number,
                index: index as u32,
                total,
            };
            let answer = Message::new(MessageType::MediaPart, self_id.clone(), m.from.clone())
                .with_url(&url)
                .with_number(reference.to_string())
                .with_data(Message::bytes_as_value(&chunk));
            let _ = self.outbound.send(answer);
        }
    }

    /// `media:part`: collect a chunk (or a whole part), and once complete
    /// feed the append loop and ask for the next part.
    async fn on_part(self: Arc<Self>, m: Message) {
        let url = match Self::url_of(&m) {
            Some(u) => u,
            None => return,
        };
        let reference: PartRef = match m.number.as_deref().map(str::parse) {
            Some(Ok(pr)) => pr,
            _ => {
                log::warn!("dropping part with bad number from {}", m.from);
                return;
            }
        };
        let data = match m.data_as_bytes() {
            Ok(b) => b,
            Err(err) => {
                log::warn!("bad part payload from {}: {}", m.from, err);
                return;
            }
        };

        let became_available = {
            let mut medias = self.medias.lock().await;
            let entry = match medias.get_mut(&url) {
                Some(e) => e,
                None => {
                    log::warn!("part for untracked url {}", url);
                    return;
                }
            };
            let part = match entry.media.parts.get_mut(reference.part_number() as usize) {
                Some(p) => p,
                None => {
                    log::warn!("part {} out of range for {}", reference.part_number(), url);
                    return;
                }
            };
            if part.status != PartStatus::Pending {
                log::warn!(
                    "{}: part {} is {}, not pending, dropping payload from {}",
                    Error::ErrUnexpectedPart(reference.part_number()),
                    reference.part_number(),
                    part.status,
                    m.from
                );
                return;
            }
            match reference {
                PartRef::Whole(_) => {
                    part.accept_whole(data);
                    true
                }
                PartRef::Chunk { index, total, .. } => {
                    match part.accept_chunk(index, total, data) {
                        Ok(done) => done,
                        Err(err) => {
                            log::warn!("chunk {} rejected: {}", reference, err);
                            false
                        }
                    }
                }
            }
        };

        if became_available {
            log::debug!("part {} of {} complete", reference.part_number(), url);
            self.try_append(&url).await;
            self.ask_for_next_parts(&url, 1).await;
        }
    }

    /// The view integrator: project the RPS view into each media's
    /// remote-availability table, replacing it wholesale.
    async fn on_view_update(self: Arc<Self>, m: Message) {
        let view: View = match m.data_as() {
            Ok(v) => v,
            Err(err) => {
                log::warn!("bad view snapshot: {}", err);
                return;
            }
        };

        let mut medias = self.medias.lock().await;
        for (url, entry) in medias.iter_mut() {
            entry.media.remotes = view
                .iter()
                .filter(|d| d.advertises(url))
                .map(|d| (d.id.clone(), d.parts_for(url).unwrap_or_default()))
                .collect();
        }
    }

    /// Picks up to `n` parts to request and dispatches each to its source.
    /// Requests to remotes get a deadline; when it expires with the part
    /// still pending, the origin takes over and the late peer answer is
    /// dropped by the not-pending guard.
    async fn ask_for_next_parts(self: &Arc<Self>, url: &str, n: usize) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };

        let requests = {
            let mut medias = self.medias.lock().await;
            match medias.get_mut(url) {
                Some(entry) => entry.media.next_parts_to_download(n),
                None => return,
            }
        };

        for (source, part_number) in requests {
            match source {
                PartSource::Remote(remote) => {
                    log::debug!("requesting part {} of {} from {}", part_number, url, remote);
                    let request =
                        Message::new(MessageType::MediaRequestPart, self_id.clone(), remote)
                            .with_url(url)
                            .with_number(part_number.to_string());
                    let _ = self.outbound.send(request);

                    let internal = Arc::clone(self);
                    let url = url.to_owned();
                    let timeout = self.config.download_timeout;
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        internal.origin_fallback(&url, part_number).await;
                    });
                }
                PartSource::Origin => {
                    let internal = Arc::clone(self);
                    let url = url.to_owned();
                    tokio::spawn(async move {
                        internal.origin_fetch_part(&url, part_number).await;
                    });
                }
            }
        }
    }

    /// Deadline handler for a part requested from a remote.
    async fn origin_fallback(self: &Arc<Self>, url: &str, part_number: u32) {
        let still_pending = {
            let medias = self.medias.lock().await;
            medias.get(url).map_or(false, |e| {
                e.media
                    .parts
                    .get(part_number as usize)
                    .map_or(false, |p| p.status == PartStatus::Pending)
            })
        };
        if !still_pending {
            return;
        }
        log::debug!(
            "part {} of {} timed out on its peer, falling back to origin",
            part_number,
            url
        );
        self.origin_fetch_part(url, part_number).await;
    }

    /// Range-fetches one part from the origin and re-dispatches it locally
    /// as a `media:part`. A failure rolls the part back to `Needed` so a
    /// later scheduling pass retries it.
    async fn origin_fetch_part(self: &Arc<Self>, url: &str, part_number: u32) {
        let range = {
            let medias = self.medias.lock().await;
            medias
                .get(url)
                .and_then(|e| e.media.metadata.as_ref())
                .and_then(|md| md.part_range(part_number as usize))
        };
        let range = match range {
            Some(r) => r,
            None => {
                log::warn!("no byte range for part {} of {}", part_number, url);
                return;
            }
        };

        match self.origin.fetch_range(url, range).await {
            Ok(bytes) => {
                let self_id = match self.self_id().await {
                    Some(id) => id,
                    None => return,
                };
                self.bus
                    .dispatch(
                        Message::new(MessageType::MediaPart, self_id.clone(), self_id)
                            .with_url(url)
                            .with_number(part_number.to_string())
                            .with_data(Message::bytes_as_value(&bytes)),
                    )
                    .await;
            }
            Err(err) => {
                log::warn!(
                    "origin fetch of part {} of {} failed: {}",
                    part_number,
                    url,
                    err
                );
                let mut medias = self.medias.lock().await;
                if let Some(part) = medias
                    .get_mut(url)
                    .and_then(|e| e.media.parts.get_mut(part_number as usize))
                {
                    if part.status == PartStatus::Pending {
                        part.status = PartStatus::Needed;
                    }
                }
            }
        }
    }

    /// Starts the per-media append task unless one is already running.
    async fn try_append(self: &Arc<Self>, url: &str) {
        let spawn_loop = {
            let mut medias = self.medias.lock().await;
            match medias.get_mut(url) {
                Some(entry) if !entry.appending => {
                    let has_available = entry
                        .media
                        .parts
                        .iter()
                        .any(|p| p.status == PartStatus::Available);
                    if has_available {
                        entry.appending = true;
                    }
                    has_available
                }
                _ => false,
            }
        };

        if spawn_loop {
            let internal = Arc::clone(self);
            let url = url.to_owned();
            tokio::spawn(async move {
                internal.append_loop(&url).await;
            });
        }
    }

    /// Appends available parts in order until none is left; ends the
    /// stream once every part has been added.
    async fn append_loop(self: &Arc<Self>, url: &str) {
        enum Step {
            Append(u32, Bytes, Arc<dyn PlaybackSink>),
            EndOfStream(Arc<dyn PlaybackSink>),
            Done,
        }

        loop {
            let step = {
                let mut medias = self.medias.lock().await;
                let entry = match medias.get_mut(url) {
                    Some(e) => e,
                    None => return,
                };
                match entry.media.take_lowest_available() {
                    Some((number, bytes)) => Step::Append(number, bytes, Arc::clone(&entry.sink)),
                    None => {
                        entry.appending = false;
                        if entry.media.all_added() && !entry.media.complete {
                            entry.media.complete = true;
                            Step::EndOfStream(Arc::clone(&entry.sink))
                        } else {
                            Step::Done
                        }
                    }
                }
            };

            match step {
                Step::Append(number, bytes, sink) => {
                    self.publish_held_parts(url).await;
                    log::trace!("appending part {} of {}", number, url);
                    if let Err(err) = sink.append(bytes).await {
                        log::warn!("sink append for {} failed: {}", url, err);
                    }
                }
                Step::EndOfStream(sink) => {
                    log::debug!("{} complete", url);
                    if let Err(err) = sink.end_of_stream().await {
                        log::warn!("sink end-of-stream for {} failed: {}", url, err);
                    }
                    return;
                }
                Step::Done => return,
            }
        }
    }

    /// Publishes the held-parts list into the gossip descriptor so other
    /// nodes learn what this one can serve.
    async fn publish_held_parts(&self, url: &str) {
        let self_id = match self.self_id().await {
            Some(id) => id,
            None => return,
        };
        let held = {
            let medias = self.medias.lock().await;
            match medias.get(url) {
                Some(e) => e.media.held_parts(),
                None => return,
            }
        };

        let update = DescriptorUpdate {
            path: vec!["media".to_owned(), url.to_owned()],
            value: serde_json::json!(held),
        };
        match serde_json::to_value(&update) {
            Ok(data) => {
                self.bus
                    .dispatch(
                        Message::new(
                            MessageType::GossipDescriptorUpdate,
                            self_id.clone(),
                            self_id,
                        )
                        .with_data(data),
                    )
                    .await;
            }
            Err(err) => log::error!("failed to encode descriptor update: {}", err),
        }
    }
}

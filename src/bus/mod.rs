#[cfg(test)]
mod bus_test;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::message::{Message, MessageType, PeerId};

pub type MessageHandlerFn = Box<
    dyn (FnMut(Message) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

/// Token returned at registration. Listeners form a set keyed by token, so
/// the same registration can never be present twice.
pub type ListenerId = u64;

struct Listener {
    id: ListenerId,
    /// `Some(id)` restricts a one-shot listener to messages from that peer;
    /// messages from anyone else pass through without consuming it.
    only_from: Option<PeerId>,
    once: bool,
    handler: Arc<Mutex<MessageHandlerFn>>,
}

/// In-process publish/subscribe keyed by message type.
///
/// Dispatch snapshots the matching listeners under lock, then awaits each
/// handler sequentially in registration order, so a dispatched message runs
/// to completion before the next one starts and ordering stays reproducible.
#[derive(Default)]
pub struct MessageBus {
    listeners: Mutex<HashMap<MessageType, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        MessageBus::default()
    }

    pub async fn on(&self, kind: MessageType, handler: MessageHandlerFn) -> ListenerId {
        self.register(kind, None, false, handler).await
    }

    /// Registers a listener that is removed right before its first
    /// invocation.
    pub async fn once(&self, kind: MessageType, handler: MessageHandlerFn) -> ListenerId {
        self.register(kind, None, true, handler).await
    }

    /// One-shot listener that only fires for messages whose `from` matches.
    /// The gossip active thread uses this to await the answer of the one
    /// remote it is exchanging with.
    pub async fn once_from(
        &self,
        kind: MessageType,
        from: impl Into<PeerId>,
        handler: MessageHandlerFn,
    ) -> ListenerId {
        self.register(kind, Some(from.into()), true, handler).await
    }

    async fn register(
        &self,
        kind: MessageType,
        only_from: Option<PeerId>,
        once: bool,
        handler: MessageHandlerFn,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self.listeners.lock().await;
        listeners.entry(kind).or_default().push(Listener {
            id,
            only_from,
            once,
            handler: Arc::new(Mutex::new(handler)),
        });
        id
    }

    pub async fn remove_listener(&self, kind: MessageType, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().await;
        match listeners.get_mut(&kind) {
            Some(regs) => {
                let before = regs.len();
                regs.retain(|l| l.id != id);
                regs.len() != before
            }
            None => false,
        }
    }

    pub async fn remove_all_listeners(&self, kind: Option<MessageType>) {
        let mut listeners = self.listeners.lock().await;
        match kind {
            Some(k) => {
                listeners.remove(&k);
            }
            None => listeners.clear(),
        }
    }

    pub async fn listener_count(&self, kind: MessageType) -> usize {
        let listeners = self.listeners.lock().await;
        listeners.get(&kind).map_or(0, |regs| regs.len())
    }

    /// Validates the envelope and hands the message to every listener
    /// registered for its type. Malformed messages are dropped.
    pub async fn dispatch(&self, message: Message) {
        if let Err(err) = message.validate() {
            log::warn!("dropping malformed {} message: {}", message.kind, err);
            return;
        }

        let to_invoke = {
            let mut listeners = self.listeners.lock().await;
            let regs = match listeners.get_mut(&message.kind) {
                Some(regs) => regs,
                None => return,
            };

            let mut to_invoke = vec![];
            let mut consumed = vec![];
            for l in regs.iter() {
                if let Some(ref from) = l.only_from {
                    if *from != message.from {
                        continue;
                    }
                }
                to_invoke.push(Arc::clone(&l.handler));
                if l.once {
                    consumed.push(l.id);
                }
            }
            // One-shot listeners leave the set before their handler runs.
            regs.retain(|l| !consumed.contains(&l.id));
            to_invoke
        };

        log::trace!(
            "dispatch {} from {} to {} ({} listeners)",
            message.kind,
            message.from,
            message.to,
            to_invoke.len()
        );

        for handler in to_invoke {
            let mut f = handler.lock().await;
            (*f)(message.clone()).await;
        }
    }
}

use std::sync::Arc;

use tokio::sync::Mutex;

use super::*;

fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> MessageHandlerFn {
    let tag = tag.to_owned();
    Box::new(move |m: Message| {
        let log = Arc::clone(&log);
        let tag = tag.clone();
        Box::pin(async move {
            log.lock().await.push(format!("{}:{}", tag, m.from));
        })
    })
}

fn probe(kind: MessageType, from: &str) -> Message {
    Message::new(kind, from, "self")
}

#[tokio::test]
async fn test_dispatch_registration_order() {
    let bus = MessageBus::new();
    let log = Arc::new(Mutex::new(vec![]));

    bus.on(
        MessageType::MediaPart,
        recording_handler(Arc::clone(&log), "first"),
    )
    .await;
    bus.on(
        MessageType::MediaPart,
        recording_handler(Arc::clone(&log), "second"),
    )
    .await;

    bus.dispatch(probe(MessageType::MediaPart, "a")).await;

    assert_eq!(*log.lock().await, vec!["first:a", "second:a"]);
}

#[tokio::test]
async fn test_once_fires_a_single_time() {
    let bus = MessageBus::new();
    let log = Arc::new(Mutex::new(vec![]));

    bus.once(
        MessageType::Connected,
        recording_handler(Arc::clone(&log), "once"),
    )
    .await;

    bus.dispatch(probe(MessageType::Connected, "a")).await;
    bus.dispatch(probe(MessageType::Connected, "b")).await;

    assert_eq!(*log.lock().await, vec!["once:a"]);
    assert_eq!(bus.listener_count(MessageType::Connected).await, 0);
}

#[tokio::test]
async fn test_once_from_ignores_other_senders() {
    let bus = MessageBus::new();
    let log = Arc::new(Mutex::new(vec![]));

    bus.once_from(
        MessageType::GossipAnswerExchange,
        "expected",
        recording_handler(Arc::clone(&log), "answer"),
    )
    .await;

    bus.dispatch(probe(MessageType::GossipAnswerExchange, "interloper"))
        .await;
    assert!(log.lock().await.is_empty(), "wrong sender must not consume");
    assert_eq!(
        bus.listener_count(MessageType::GossipAnswerExchange).await,
        1
    );

    bus.dispatch(probe(MessageType::GossipAnswerExchange, "expected"))
        .await;
    assert_eq!(*log.lock().await, vec!["answer:expected"]);
    assert_eq!(
        bus.listener_count(MessageType::GossipAnswerExchange).await,
        0
    );
}

#[tokio::test]
async fn test_remove_listener() {
    let bus = MessageBus::new();
    let log = Arc::new(Mutex::new(vec![]));

    let id = bus
        .on(
            MessageType::MediaHead,
            recording_handler(Arc::clone(&log), "gone"),
        )
        .await;

    assert!(bus.remove_listener(MessageType::MediaHead, id).await);
    assert!(!bus.remove_listener(MessageType::MediaHead, id).await);

    bus.dispatch(probe(MessageType::MediaHead, "a")).await;
    assert!(log.lock().await.is_empty());
}

#[tokio::test]
async fn test_remove_all_listeners() {
    let bus = MessageBus::new();
    let log = Arc::new(Mutex::new(vec![]));

    bus.on(
        MessageType::MediaPart,
        recording_handler(Arc::clone(&log), "a"),
    )
    .await;
    bus.on(
        MessageType::Connected,
        recording_handler(Arc::clone(&log), "b"),
    )
    .await;

    bus.remove_all_listeners(Some(MessageType::MediaPart)).await;
    assert_eq!(bus.listener_count(MessageType::MediaPart).await, 0);
    assert_eq!(bus.listener_count(MessageType::Connected).await, 1);

    bus.remove_all_listeners(None).await;
    assert_eq!(bus.listener_count(MessageType::Connected).await, 0);
}

#[tokio::test]
async fn test_malformed_message_dropped() {
    let bus = MessageBus::new();
    let log = Arc::new(Mutex::new(vec![]));

    bus.on(
        MessageType::RequestPeer,
        recording_handler(Arc::clone(&log), "never"),
    )
    .await;

    // Forwardable type without ttl/forwardBy fails validation.
    bus.dispatch(Message::new(MessageType::RequestPeer, "a", "-1"))
        .await;

    assert!(log.lock().await.is_empty());
}

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::registry::ConnectionRegistry;
use super::*;
use crate::error::Result;
use crate::message::MessageType;
use crate::transport::TransportConnection;

#[derive(Default)]
struct StubTransport {
    sent: Mutex<Vec<Bytes>>,
    remote_desc: Mutex<Option<String>>,
    candidates: Mutex<Vec<String>>,
}

#[async_trait]
impl TransportConnection for StubTransport {
    async fn create_offer(&self) -> Result<String> {
        Ok("offer".to_owned())
    }
    async fn create_answer(&self) -> Result<String> {
        Ok("answer".to_owned())
    }
    async fn set_local_description(&self, _sdp: &str) -> Result<()> {
        Ok(())
    }
    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        *self.remote_desc.lock().await = Some(sdp.to_owned());
        Ok(())
    }
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        self.candidates.lock().await.push(candidate.to_owned());
        Ok(())
    }
    async fn send(&self, payload: Bytes) -> Result<()> {
        self.sent.lock().await.push(payload);
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_connection_state_strings() {
    let cases = vec![
        ("connecting", ConnectionState::Connecting),
        ("open", ConnectionState::Open),
        ("close", ConnectionState::Closed),
    ];
    for (raw, state) in cases {
        assert_eq!(ConnectionState::from(raw), state);
        assert_eq!(state.to_string(), raw);
    }
    assert_eq!(
        ConnectionState::from("bogus"),
        ConnectionState::Unspecified
    );
}

#[test]
fn test_connection_state_from_u8() {
    for state in [
        ConnectionState::Connecting,
        ConnectionState::Open,
        ConnectionState::Closed,
    ] {
        assert_eq!(ConnectionState::from(state as u8), state);
    }
}

#[tokio::test]
async fn test_send_refused_until_open() -> Result<()> {
    let transport = Arc::new(StubTransport::default());
    let conn = Connection::new("b", Arc::clone(&transport) as Arc<dyn TransportConnection>);
    let m = Message::new(MessageType::MediaRequestHead, "a", "b");

    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(conn.send_message(&m).await, Err(Error::ErrUnknownTransport));

    conn.set_state(ConnectionState::Open);
    conn.send_message(&m).await?;
    assert_eq!(transport.sent.lock().await.len(), 1);

    conn.close().await?;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.send_message(&m).await, Err(Error::ErrUnknownTransport));

    Ok(())
}

#[tokio::test]
async fn test_registry_live_and_open_filters() {
    let registry = ConnectionRegistry::new();
    let conn = Arc::new(Connection::new(
        "b",
        Arc::new(StubTransport::default()) as Arc<dyn TransportConnection>,
    ));
    registry.insert(Arc::clone(&conn)).await;

    assert!(registry.get_live("b").await.is_some());
    assert!(registry.get_open("b").await.is_none());

    conn.set_state(ConnectionState::Open);
    assert!(registry.get_open("b").await.is_some());
    assert_eq!(registry.open_remotes().await, vec!["b"]);

    conn.set_state(ConnectionState::Closed);
    assert!(registry.get_live("b").await.is_none());
    assert!(registry.open_remotes().await.is_empty());
}

#[tokio::test]
async fn test_registry_excludes_signal_from_broadcast_set() {
    let registry = ConnectionRegistry::new();
    let transport = Arc::new(StubTransport::default());
    let signalish = Arc::new(Connection::new(
        crate::transport::SIGNAL_ID,
        transport as Arc<dyn TransportConnection>,
    ));
    signalish.set_state(ConnectionState::Open);
    registry.set_signal(signalish).await;

    assert!(registry.signal().await.is_some());
    assert!(registry.open_connections().await.is_empty());
}

#[tokio::test]
async fn test_candidates_buffered_then_drained_on_remote_description() -> Result<()> {
    let registry = ConnectionRegistry::new();

    // Candidates show up before any connection object exists.
    registry.buffer_candidate("b", "cand-0".to_owned()).await;
    registry.buffer_candidate("b", "cand-1".to_owned()).await;
    assert_eq!(registry.pending_candidate_count("b").await, 2);

    let transport = Arc::new(StubTransport::default());
    let conn = Arc::new(Connection::new(
        "b",
        Arc::clone(&transport) as Arc<dyn TransportConnection>,
    ));
    registry.insert(Arc::clone(&conn)).await;

    registry.apply_remote_description(&conn, "offer-sdp").await?;

    assert_eq!(
        *transport.remote_desc.lock().await,
        Some("offer-sdp".to_owned())
    );
    assert_eq!(
        *transport.candidates.lock().await,
        vec!["cand-0", "cand-1"]
    );
    assert_eq!(registry.pending_candidate_count("b").await, 0);

    Ok(())
}

#[tokio::test]
async fn test_signal_adapter_refuses_negotiation() {
    struct NullLink;

    #[async_trait]
    impl crate::transport::SignalingLink for NullLink {
        async fn attach(
            &self,
            _events: tokio::sync::mpsc::Sender<crate::transport::TransportEvent>,
        ) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _payload: Bytes) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    let conn = Connection::signal(Arc::new(NullLink));
    assert!(conn.is_signal());
    assert!(conn.is_open(), "signal entry is born open");
    assert_eq!(
        conn.transport().create_offer().await,
        Err(Error::ErrSignalingNegotiation)
    );
}

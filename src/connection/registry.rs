use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{Connection, ConnectionState};
use crate::error::Result;
use crate::message::PeerId;
use crate::transport::SIGNAL_ID;

/// Tracks every per-remote connection state machine, the distinguished
/// `signal` entry included, plus the per-remote buffer of ICE candidates
/// that arrived before the remote description.
///
/// The candidate buffer lives here rather than on the `Connection` because
/// candidates can arrive before the connection object exists and must
/// survive a tie-break replacing it.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<PeerId, Arc<Connection>>>,
    pending_candidates: Mutex<HashMap<PeerId, Vec<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Installs a connection, replacing whatever was there. At most one
    /// non-closed connection per remote exists at any time.
    pub async fn insert(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.lock().await;
        connections.insert(conn.remote_id().to_owned(), conn);
    }

    pub async fn get(&self, remote: &str) -> Option<Arc<Connection>> {
        let connections = self.connections.lock().await;
        connections.get(remote).cloned()
    }

    /// The connection to `remote` unless it is already closed.
    pub async fn get_live(&self, remote: &str) -> Option<Arc<Connection>> {
        self.get(remote)
            .await
            .filter(|c| c.state() != ConnectionState::Closed)
    }

    pub async fn get_open(&self, remote: &str) -> Option<Arc<Connection>> {
        self.get(remote).await.filter(|c| c.is_open())
    }

    pub async fn remove(&self, remote: &str) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        connections.remove(remote)
    }

    pub async fn set_signal(&self, conn: Arc<Connection>) {
        self.insert(conn).await;
    }

    pub async fn signal(&self) -> Option<Arc<Connection>> {
        self.get_open(SIGNAL_ID).await
    }

    /// Open mesh connections, signaling excluded, in insertion-independent
    /// sorted order so broadcast fan-out is reproducible.
    pub async fn open_connections(&self) -> Vec<Arc<Connection>> {
        let connections = self.connections.lock().await;
        let mut open: Vec<Arc<Connection>> = connections
            .values()
            .filter(|c| c.is_open() && !c.is_signal())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.remote_id().cmp(b.remote_id()));
        open
    }

    pub async fn open_remotes(&self) -> Vec<PeerId> {
        self.open_connections()
            .await
            .iter()
            .map(|c| c.remote_id().to_owned())
            .collect()
    }

    /// Parks a candidate that arrived before the remote description.
    pub async fn buffer_candidate(&self, remote: &str, candidate: String) {
        let mut pending = self.pending_candidates.lock().await;
        pending.entry(remote.to_owned()).or_default().push(candidate);
    }

    pub async fn drain_candidates(&self, remote: &str) -> Vec<String> {
        let mut pending = self.pending_candidates.lock().await;
        pending.remove(remote).unwrap_or_default()
    }

    pub async fn pending_candidate_count(&self, remote: &str) -> usize {
        let pending = self.pending_candidates.lock().await;
        pending.get(remote).map_or(0, |v| v.len())
    }

    /// Applies the remote description and immediately feeds the transport
    /// every buffered candidate, clearing the buffer.
    pub async fn apply_remote_description(&self, conn: &Arc<Connection>, sdp: &str) -> Result<()> {
        conn.transport().set_remote_description(sdp).await?;
        conn.mark_remote_described();
        for candidate in self.drain_candidates(conn.remote_id()).await {
            conn.transport().add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }

    /// Tears down the connection to `remote`, if any, and forgets its
    /// buffered candidates. Used both for handshake failures and shutdown.
    pub async fn teardown(&self, remote: &str) {
        if let Some(conn) = self.remove(remote).await {
            if let Err(err) = conn.close().await {
                log::debug!("closing connection to {}: {}", remote, err);
            }
        }
        let mut pending = self.pending_candidates.lock().await;
        pending.remove(remote);
    }

    pub async fn close_all(&self) {
        let remotes: Vec<PeerId> = {
            let connections = self.connections.lock().await;
            connections.keys().cloned().collect()
        };
        for remote in remotes {
            self.teardown(&remote).await;
        }
    }
}

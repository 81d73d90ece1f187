//! Pure-data registry of connected peers. The coordinator owns the only
//! instance; peer tasks never touch it.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::p2p::Message;

/// Monotonically assigned per-connection id; never reused, so state from a
/// closed connection cannot leak into a reconnect.
pub type PeerId = u64;

pub struct PeerState {
    pub addr: SocketAddr,
    pub handshake: bool,
    pub version: i32,
    pub user_agent: String,
    /// Best height the peer has claimed, via `version` or block announcements.
    pub start_height: i32,
    /// Outbound queue drained by the peer's write task.
    pub sender: mpsc::Sender<Message>,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerState>,
}

impl PeerRegistry {
    pub fn insert(&mut self, peer: PeerId, state: PeerState) {
        self.peers.insert(peer, state);
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<PeerState> {
        self.peers.remove(&peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<&PeerState> {
        self.peers.get(&peer)
    }

    pub fn set_handshake(&mut self, peer: PeerId, done: bool) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.handshake = done;
        }
    }

    /// Raises the peer's known height; announcements never lower it.
    pub fn update_height(&mut self, peer: PeerId, height: i32) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.start_height = state.start_height.max(height);
        }
    }

    pub fn keys(&self) -> Vec<PeerId> {
        let mut keys: Vec<PeerId> = self.peers.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Highest height any handshaked peer has claimed; zero with no peers.
    pub fn best_height(&self) -> i32 {
        self.peers
            .values()
            .filter(|state| state.handshake)
            .map(|state| state.start_height)
            .max()
            .unwrap_or(0)
    }
}

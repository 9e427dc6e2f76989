//! Session registry shared by the game and chat channels
//!
//! Maps a transport peer address to a stable integer identity. The game
//! channel uses a bounded registry whose ids come from the pool
//! `1..=room_cap`; the chat channel uses an unbounded registry with
//! monotonically increasing ids and also records each peer's display name.
//!
//! The registry itself is a plain data structure. Callers wrap it in a single
//! lock and copy what they need out of it (see [`SessionRegistry::all`])
//! before doing any network I/O.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

/// Display name of a chat session that has not sent `CONNECT` yet.
pub const DEFAULT_DISPLAY_NAME: &str = "Unknown";

/// One known peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    /// Stable identity, starting at 1
    pub id: u32,
    /// Transport address, the natural key of the session
    pub peer: SocketAddr,
    /// Chat display name
    pub display_name: String,
    /// Simulation tick of the last message received from this peer
    pub last_seen_tick: Option<u64>,
}

impl ClientSession {
    pub fn new(id: u32, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            last_seen_tick: None,
        }
    }

    /// Returns true if nothing was heard from this peer for more than
    /// `timeout` ticks. Sessions never seen on a tick are measured from tick 0.
    pub fn is_idle(&self, now_tick: u64, timeout: u64) -> bool {
        now_tick.saturating_sub(self.last_seen_tick.unwrap_or(0)) > timeout
    }
}

/// Outcome of a successful [`SessionRegistry::assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub id: u32,
    /// False when the peer already had this id.
    pub is_new: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    #[error("room is full")]
    RoomFull,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SocketAddr, ClientSession>,
    /// Next id for unbounded registries
    next_id: u32,
    /// Size of the id pool, `None` for unbounded
    capacity: Option<u32>,
}

impl SessionRegistry {
    /// Registry handing out ids from `1..=capacity`.
    pub fn bounded(capacity: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            capacity: Some(capacity),
        }
    }

    /// Registry without a cap; ids are never reused.
    pub fn unbounded() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            capacity: None,
        }
    }

    /// Returns the id of `peer`, assigning one on first contact.
    ///
    /// Bounded registries hand out the lowest id not held by a live session,
    /// so without evictions ids are assigned 1, 2, ... in arrival order.
    pub fn assign(&mut self, peer: SocketAddr) -> Result<Assignment, Rejected> {
        if let Some(session) = self.sessions.get(&peer) {
            return Ok(Assignment {
                id: session.id,
                is_new: false,
            });
        }

        let id = match self.capacity {
            Some(capacity) => (1..=capacity)
                .find(|id| !self.sessions.values().any(|s| s.id == *id))
                .ok_or(Rejected::RoomFull)?,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };

        info!("Session {} assigned to {}", id, peer);
        self.sessions.insert(peer, ClientSession::new(id, peer));
        Ok(Assignment { id, is_new: true })
    }

    pub fn lookup(&self, peer: &SocketAddr) -> Option<u32> {
        self.sessions.get(peer).map(|session| session.id)
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&ClientSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &SocketAddr) -> Option<&mut ClientSession> {
        self.sessions.get_mut(peer)
    }

    /// Records activity of a known peer.
    pub fn touch(&mut self, peer: &SocketAddr, tick: u64) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.last_seen_tick = Some(tick);
        }
    }

    /// Point-in-time copy of every (address, id) pair, sorted by id.
    pub fn all(&self) -> Vec<(SocketAddr, u32)> {
        let mut all: Vec<(SocketAddr, u32)> = self
            .sessions
            .values()
            .map(|session| (session.peer, session.id))
            .collect();
        all.sort_by_key(|(_, id)| *id);
        all
    }

    pub fn remove(&mut self, peer: &SocketAddr) -> Option<ClientSession> {
        let removed = self.sessions.remove(peer);
        if let Some(session) = &removed {
            info!("Session {} released by {}", session.id, peer);
        }
        removed
    }

    /// Removes sessions silent for more than `timeout` ticks and returns them.
    pub fn evict_idle(&mut self, now_tick: u64, timeout: u64) -> Vec<ClientSession> {
        let idle: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|session| session.is_idle(now_tick, timeout))
            .map(|session| session.peer)
            .collect();

        idle.iter().filter_map(|peer| self.remove(peer)).collect()
    }

    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

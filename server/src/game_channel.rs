//! Unreliable game channel (UDP)
//!
//! Every datagram carries exactly one text message. The receive loop
//! admits peers, records their latest input (or reported position in
//! client-authoritative mode) and never blocks the tick; the tick loop calls
//! [`GameChannel::broadcast_state`] once per step.
//!
//! Shared maps are each behind one lock. Locks are held only while copying
//! into or out of a map, never across a `send_to`.

use crate::config::GameMode;
use crate::game::Snapshot;
use crate::lifecycle::Shutdown;
use crate::session::{Assignment, ClientSession, Rejected, SessionRegistry};
use log::{debug, info, warn};
use shared::{decode, encode, Message, Vector2, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

/// Cheap to clone; every clone shares the socket and the maps.
#[derive(Clone)]
pub struct GameChannel {
    socket: Arc<UdpSocket>,
    mode: GameMode,
    registry: Arc<RwLock<SessionRegistry>>,
    /// Latest vertical input per player id, last write wins
    inputs: Arc<RwLock<HashMap<u32, f32>>>,
    /// Latest self-reported paddle position per player id
    reported: Arc<RwLock<HashMap<u32, Vector2>>>,
    /// Tick stamped on sessions when they send something
    tick: Arc<AtomicU64>,
}

impl GameChannel {
    pub async fn bind(addr: &str, mode: GameMode, room_cap: u32) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(
            "Game channel listening on {} ({:?} mode, room of {})",
            socket.local_addr()?,
            mode,
            room_cap
        );

        Ok(Self {
            socket: Arc::new(socket),
            mode,
            registry: Arc::new(RwLock::new(SessionRegistry::bounded(room_cap))),
            inputs: Arc::new(RwLock::new(HashMap::new())),
            reported: Arc::new(RwLock::new(HashMap::new())),
            tick: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    pub fn set_tick(&self, tick: u64) {
        self.tick.store(tick, Ordering::Relaxed);
    }

    /// Receives datagrams until shutdown is requested.
    pub async fn run_receiver(self, mut shutdown: Shutdown) {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.wait() => break,
                received = self.socket.recv_from(&mut buffer) => received,
            };

            match received {
                Ok((len, peer)) => self.handle_datagram(&buffer[..len], peer).await,
                Err(e) => {
                    if shutdown.is_requested() {
                        break;
                    }
                    // e.g. ICMP port unreachable from a vanished peer
                    warn!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        info!("Game channel receiver stopped");
    }

    /// Decodes one datagram and dispatches it according to the mode.
    pub async fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        // Client-authoritative peers are admitted by any datagram, even one
        // that does not decode.
        let admitted = match self.mode {
            GameMode::ClientAuthoritative => self.on_hello(peer).await,
            GameMode::Authoritative => None,
        };

        let message = match decode(bytes) {
            Ok(message) => message,
            Err(e) if e.is_unknown_tag() => {
                debug!("Ignoring datagram from {}: {}", peer, e);
                return;
            }
            Err(e) => {
                warn!("Malformed datagram from {}: {}", peer, e);
                return;
            }
        };

        match (self.mode, message) {
            (GameMode::Authoritative, Message::Hello) => {
                self.on_hello(peer).await;
            }
            (GameMode::Authoritative, Message::Input(value)) => self.on_input(peer, value).await,
            (GameMode::ClientAuthoritative, Message::Position { x, y }) => {
                if let Some(id) = admitted {
                    self.on_position(peer, id, x, y).await;
                }
            }
            (_, other) => {
                debug!("Ignoring {:?} from {}", other, peer);
            }
        }
    }

    /// Assigns an id to a new peer and replies `ASSIGN:<id>`. Known peers are
    /// not answered again; peers beyond the room cap get no reply at all.
    async fn on_hello(&self, peer: SocketAddr) -> Option<u32> {
        let assignment = {
            let mut registry = self.registry.write().await;
            let assignment = registry.assign(peer);
            registry.touch(&peer, self.tick.load(Ordering::Relaxed));
            assignment
        };

        match assignment {
            Ok(Assignment { id, is_new: true }) => {
                info!("Player {} joined from {}", id, peer);
                self.send_to(&Message::Assign(id), peer).await;
                Some(id)
            }
            Ok(Assignment { id, is_new: false }) => Some(id),
            Err(Rejected::RoomFull) => {
                warn!("Room full, ignoring {}", peer);
                None
            }
        }
    }

    async fn on_input(&self, peer: SocketAddr, value: f32) {
        let id = {
            let mut registry = self.registry.write().await;
            registry.touch(&peer, self.tick.load(Ordering::Relaxed));
            registry.lookup(&peer)
        };

        let Some(id) = id else {
            debug!("Input from unassigned peer {}", peer);
            return;
        };

        self.inputs.write().await.insert(id, value);
    }

    async fn on_position(&self, peer: SocketAddr, id: u32, x: f32, y: f32) {
        self.reported.write().await.insert(id, Vector2::new(x, y));

        let relay = encode(&Message::PlayerState { id, x, y });
        for (addr, _) in self.peers().await {
            if addr != peer {
                self.send_raw(&relay, addr).await;
            }
        }
    }

    /// Copy of the latest input per player.
    pub async fn latest_inputs(&self) -> HashMap<u32, f32> {
        self.inputs.read().await.clone()
    }

    /// Copy of the latest self-reported paddle positions.
    pub async fn reported_positions(&self) -> HashMap<u32, Vector2> {
        self.reported.read().await.clone()
    }

    /// Point-in-time list of every assigned peer.
    pub async fn peers(&self) -> Vec<(SocketAddr, u32)> {
        self.registry.read().await.all()
    }

    /// Sends the paddles (authoritative mode) and the ball to every peer.
    pub async fn broadcast_state(&self, snapshot: &Snapshot) {
        let peers = self.peers().await;
        if peers.is_empty() {
            return;
        }

        let mut datagrams = Vec::with_capacity(snapshot.paddles.len() + 1);
        if self.mode == GameMode::Authoritative {
            for (id, position) in &snapshot.paddles {
                datagrams.push(encode(&Message::PlayerState {
                    id: *id,
                    x: position.x,
                    y: position.y,
                }));
            }
        }
        datagrams.push(encode(&Message::BallState {
            x: snapshot.ball.x,
            y: snapshot.ball.y,
        }));

        for datagram in &datagrams {
            for (addr, _) in &peers {
                self.send_raw(datagram, *addr).await;
            }
        }
    }

    pub async fn broadcast(&self, message: &Message) {
        let datagram = encode(message);
        for (addr, _) in self.peers().await {
            self.send_raw(&datagram, addr).await;
        }
    }

    /// Drops sessions that have been silent for more than `timeout` ticks,
    /// together with their stored input.
    pub async fn evict_idle(&self, now_tick: u64, timeout: u64) -> Vec<ClientSession> {
        let evicted = self.registry.write().await.evict_idle(now_tick, timeout);
        if !evicted.is_empty() {
            let mut inputs = self.inputs.write().await;
            let mut reported = self.reported.write().await;
            for session in &evicted {
                inputs.remove(&session.id);
                reported.remove(&session.id);
            }
        }
        evicted
    }

    async fn send_to(&self, message: &Message, addr: SocketAddr) -> bool {
        self.send_raw(&encode(message), addr).await
    }

    /// A failed send only affects its own destination.
    async fn send_raw(&self, data: &[u8], addr: SocketAddr) -> bool {
        match self.socket.send_to(data, addr).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Failed to send to {}: {}", addr, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::decode;
    use tokio::time::timeout;

    async fn channel(mode: GameMode, room_cap: u32) -> GameChannel {
        GameChannel::bind("127.0.0.1:0", mode, room_cap).await.unwrap()
    }

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv_message(socket: &UdpSocket) -> Option<Message> {
        let mut buf = [0u8; 256];
        match timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(decode(&buf[..len]).unwrap()),
            _ => None,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            tick: 1,
            paddles: vec![
                (1, Vector2::new(-8.0, 1.234)),
                (2, Vector2::new(8.0, -0.5)),
            ],
            ball: Vector2::new(0.5, 0.25),
        }
    }

    #[tokio::test]
    async fn test_hello_assigns_unique_ids_up_to_cap() {
        let game = channel(GameMode::Authoritative, 2).await;
        let clients = [peer().await, peer().await, peer().await];

        for client in &clients {
            game.handle_datagram(b"HELLO", client.local_addr().unwrap())
                .await;
        }

        assert_eq!(recv_message(&clients[0]).await, Some(Message::Assign(1)));
        assert_eq!(recv_message(&clients[1]).await, Some(Message::Assign(2)));
        assert_eq!(recv_message(&clients[2]).await, None);
        assert_eq!(game.peers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_hello_is_not_answered() {
        let game = channel(GameMode::Authoritative, 2).await;
        let client = peer().await;
        let addr = client.local_addr().unwrap();

        game.handle_datagram(b"HELLO", addr).await;
        game.handle_datagram(b"HELLO", addr).await;

        assert_eq!(recv_message(&client).await, Some(Message::Assign(1)));
        assert_eq!(recv_message(&client).await, None);
    }

    #[tokio::test]
    async fn test_input_requires_assignment() {
        let game = channel(GameMode::Authoritative, 2).await;
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        game.handle_datagram(b"INPUT:1.0", addr).await;
        assert!(game.latest_inputs().await.is_empty());
        assert!(game.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_input_keeps_previous_value() {
        let game = channel(GameMode::Authoritative, 2).await;
        let client = peer().await;
        let addr = client.local_addr().unwrap();

        game.handle_datagram(b"HELLO", addr).await;
        game.handle_datagram(b"INPUT:-0.25", addr).await;
        game.handle_datagram(b"INPUT:abc", addr).await;
        assert_approx_eq!(game.latest_inputs().await[&1], -0.25);

        game.handle_datagram(b"INPUT:0.5", addr).await;
        assert_approx_eq!(game.latest_inputs().await[&1], 0.5);
    }

    #[tokio::test]
    async fn test_input_last_write_wins() {
        let game = channel(GameMode::Authoritative, 2).await;
        let addr = peer().await.local_addr().unwrap();

        game.handle_datagram(b"HELLO", addr).await;
        for value in ["0.1", "0.9", "-0.3"] {
            game.handle_datagram(format!("INPUT:{value}").as_bytes(), addr)
                .await;
        }

        let inputs = game.latest_inputs().await;
        assert_eq!(inputs.len(), 1);
        assert_approx_eq!(inputs[&1], -0.3);
    }

    #[tokio::test]
    async fn test_position_ignored_in_authoritative_mode() {
        let game = channel(GameMode::Authoritative, 2).await;
        let addr = peer().await.local_addr().unwrap();

        game.handle_datagram(b"POS:1;2", addr).await;
        assert!(game.peers().await.is_empty());
        assert!(game.reported_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_position_relayed_to_other_peers() {
        let game = channel(GameMode::ClientAuthoritative, 2).await;
        let first = peer().await;
        let second = peer().await;

        game.handle_datagram(b"POS:-8;0", first.local_addr().unwrap())
            .await;
        assert_eq!(recv_message(&first).await, Some(Message::Assign(1)));

        game.handle_datagram(b"POS:8;1.5", second.local_addr().unwrap())
            .await;
        assert_eq!(recv_message(&second).await, Some(Message::Assign(2)));

        assert_eq!(
            recv_message(&first).await,
            Some(Message::PlayerState {
                id: 2,
                x: 8.0,
                y: 1.5
            })
        );
        // The reporting peer does not get its own position back.
        assert_eq!(recv_message(&second).await, None);
        assert_eq!(
            game.reported_positions().await.get(&2),
            Some(&Vector2::new(8.0, 1.5))
        );
    }

    #[tokio::test]
    async fn test_broadcast_state_authoritative() {
        let game = channel(GameMode::Authoritative, 2).await;
        let client = peer().await;
        game.handle_datagram(b"HELLO", client.local_addr().unwrap())
            .await;
        recv_message(&client).await;

        game.broadcast_state(&snapshot()).await;

        assert_eq!(
            recv_message(&client).await,
            Some(Message::PlayerState {
                id: 1,
                x: -8.0,
                y: 1.23
            })
        );
        assert_eq!(
            recv_message(&client).await,
            Some(Message::PlayerState {
                id: 2,
                x: 8.0,
                y: -0.5
            })
        );
        assert_eq!(
            recv_message(&client).await,
            Some(Message::BallState { x: 0.5, y: 0.25 })
        );
    }

    #[tokio::test]
    async fn test_broadcast_state_client_authoritative_sends_ball_only() {
        let game = channel(GameMode::ClientAuthoritative, 2).await;
        let client = peer().await;
        game.handle_datagram(b"HELLO", client.local_addr().unwrap())
            .await;
        recv_message(&client).await;

        game.broadcast_state(&snapshot()).await;

        assert_eq!(
            recv_message(&client).await,
            Some(Message::BallState { x: 0.5, y: 0.25 })
        );
        assert_eq!(recv_message(&client).await, None);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_broadcast() {
        let game = channel(GameMode::Authoritative, 2).await;
        // An IPv6 destination cannot be reached from the IPv4 socket.
        let unreachable: SocketAddr = "[::1]:40001".parse().unwrap();
        game.registry.write().await.assign(unreachable).unwrap();

        let client = peer().await;
        game.handle_datagram(b"HELLO", client.local_addr().unwrap())
            .await;
        assert_eq!(recv_message(&client).await, Some(Message::Assign(2)));

        game.broadcast(&Message::Score { left: 1, right: 0 }).await;
        assert_eq!(
            recv_message(&client).await,
            Some(Message::Score { left: 1, right: 0 })
        );
    }

    #[tokio::test]
    async fn test_evict_idle_clears_input() {
        let game = channel(GameMode::Authoritative, 2).await;
        let addr = peer().await.local_addr().unwrap();

        game.handle_datagram(b"HELLO", addr).await;
        game.handle_datagram(b"INPUT:1", addr).await;

        game.set_tick(500);
        let evicted = game.evict_idle(500, 100).await;

        assert_eq!(evicted.len(), 1);
        assert!(game.latest_inputs().await.is_empty());
        assert!(game.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_first_position_still_admits() {
        let game = channel(GameMode::ClientAuthoritative, 2).await;
        let first = peer().await;
        let addr = first.local_addr().unwrap();

        game.handle_datagram(b"POS:abc", addr).await;
        assert_eq!(recv_message(&first).await, Some(Message::Assign(1)));
        assert_eq!(game.peers().await, vec![(addr, 1)]);
        assert!(game.reported_positions().await.is_empty());

        game.handle_datagram(b"POS:-8;2", addr).await;
        assert_eq!(recv_message(&first).await, None);
        assert_eq!(
            game.reported_positions().await.get(&1),
            Some(&Vector2::new(-8.0, 2.0))
        );
    }

    #[tokio::test]
    async fn test_unknown_and_garbage_datagrams_are_ignored() {
        let game = channel(GameMode::Authoritative, 2).await;
        let addr = peer().await.local_addr().unwrap();

        game.handle_datagram(b"PING", addr).await;
        game.handle_datagram(&[0xff, 0x00, 0x13], addr).await;
        game.handle_datagram(b"", addr).await;

        assert!(game.peers().await.is_empty());
    }
}

//! Reliable chat relay (TCP)
//!
//! Each accepted connection gets a reader task and a writer task. The reader
//! decodes newline-terminated lines and updates the shared roster; the writer
//! drains a bounded queue of outgoing lines so a slow peer never blocks a
//! broadcast. A peer whose queue fills up stops receiving and is closed.
//!
//! `CHAT` lines are relayed verbatim to every connection except the one that
//! sent them. Clients are expected to show their own messages locally.

use crate::lifecycle::{join_with_timeout, Shutdown};
use crate::session::{Rejected, SessionRegistry};
use log::{debug, error, info, warn};
use shared::{decode_line, Message};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;

/// Lines buffered per connection before the peer is considered stalled.
pub const OUTBOUND_QUEUE: usize = 256;

/// What the reader should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Close,
}

/// Connected peers and the queue feeding each peer's writer task.
#[derive(Debug)]
struct ChatRoster {
    sessions: SessionRegistry,
    outbound: HashMap<SocketAddr, mpsc::Sender<String>>,
}

/// Shared chat state. Clones share the same roster.
#[derive(Debug, Clone)]
pub struct ChatRelay {
    roster: Arc<RwLock<ChatRoster>>,
}

impl Default for ChatRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatRelay {
    pub fn new() -> Self {
        Self {
            roster: Arc::new(RwLock::new(ChatRoster {
                sessions: SessionRegistry::unbounded(),
                outbound: HashMap::new(),
            })),
        }
    }

    /// Adds a connection to the roster. Lines for this peer are pushed to `tx`.
    pub async fn join(
        &self,
        peer: SocketAddr,
        tx: mpsc::Sender<String>,
    ) -> Result<u32, Rejected> {
        let mut roster = self.roster.write().await;
        let assignment = roster.sessions.assign(peer)?;
        roster.outbound.insert(peer, tx);
        Ok(assignment.id)
    }

    /// Removes a connection and tells everyone else it left.
    pub async fn leave(&self, peer: SocketAddr) {
        let removed = {
            let mut roster = self.roster.write().await;
            roster.outbound.remove(&peer);
            roster.sessions.remove(&peer)
        };

        if let Some(session) = removed {
            info!("{} ({}) left the chat", session.display_name, peer);
            let notice = Message::System(format!("{} left the chat", session.display_name));
            self.broadcast(&notice, None).await;
        }
    }

    pub async fn display_name(&self, peer: &SocketAddr) -> Option<String> {
        let roster = self.roster.read().await;
        roster
            .sessions
            .get(peer)
            .map(|session| session.display_name.clone())
    }

    pub async fn len(&self) -> usize {
        self.roster.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Handles one decoded line from `peer`.
    pub async fn process_line(&self, peer: SocketAddr, line: &str) -> LineOutcome {
        if line.is_empty() {
            return LineOutcome::Continue;
        }

        let message = match decode_line(line) {
            Ok(message) => message,
            Err(e) if e.is_unknown_tag() => {
                debug!("Ignoring chat line from {}: {}", peer, e);
                return LineOutcome::Continue;
            }
            Err(e) => {
                warn!("Malformed chat line from {}: {}", peer, e);
                return LineOutcome::Continue;
            }
        };

        match message {
            Message::Connect(name) => {
                {
                    let mut roster = self.roster.write().await;
                    if let Some(session) = roster.sessions.get_mut(&peer) {
                        session.display_name = name.clone();
                    }
                }
                info!("{} joined the chat from {}", name, peer);
                let notice = Message::System(format!("{} joined the chat", name));
                self.broadcast(&notice, Some(peer)).await;
                LineOutcome::Continue
            }
            Message::Chat { sender, .. } => {
                debug!("Relaying chat from {} ({})", sender, peer);
                self.broadcast_line(line, Some(peer)).await;
                LineOutcome::Continue
            }
            Message::Disconnect(name) => {
                debug!("{} ({}) sent DISCONNECT", name, peer);
                LineOutcome::Close
            }
            other => {
                debug!("Ignoring {:?} on chat channel from {}", other, peer);
                LineOutcome::Continue
            }
        }
    }

    pub async fn broadcast(&self, message: &Message, exclude: Option<SocketAddr>) {
        self.broadcast_line(&message.to_string(), exclude).await;
    }

    /// Queues `line` for every connection except `exclude`.
    ///
    /// The roster is copied before sending; a peer whose writer is gone is
    /// skipped and the rest still get the line. A peer with a full queue
    /// loses its queue, which ends its connection.
    pub async fn broadcast_line(&self, line: &str, exclude: Option<SocketAddr>) {
        let targets: Vec<(SocketAddr, mpsc::Sender<String>)> = {
            let roster = self.roster.read().await;
            roster
                .outbound
                .iter()
                .filter(|(peer, _)| Some(**peer) != exclude)
                .map(|(peer, tx)| (*peer, tx.clone()))
                .collect()
        };

        let mut stalled = Vec::new();
        for (peer, tx) in targets {
            match tx.try_send(line.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => debug!("Chat peer {} is gone, skipping", peer),
                Err(TrySendError::Full(_)) => {
                    warn!("Chat peer {} is not reading, dropping it", peer);
                    stalled.push((peer, tx));
                }
            }
        }

        if !stalled.is_empty() {
            let mut roster = self.roster.write().await;
            for (peer, tx) in stalled {
                if roster
                    .outbound
                    .get(&peer)
                    .is_some_and(|current| current.same_channel(&tx))
                {
                    roster.outbound.remove(&peer);
                }
            }
        }
    }

    /// Drops every outgoing queue, which ends all writer tasks.
    pub async fn close_all(&self) {
        let mut roster = self.roster.write().await;
        let count = roster.outbound.len();
        roster.outbound.clear();
        if count > 0 {
            info!("Closed {} chat connection(s)", count);
        }
    }

    /// Reads lines until EOF, a read error, `DISCONNECT`, or shutdown.
    pub async fn serve_lines<R>(&self, reader: R, peer: SocketAddr, mut shutdown: Shutdown)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();

        loop {
            let next = tokio::select! {
                _ = shutdown.wait() => break,
                next = lines.next_line() => next,
            };

            match next {
                Ok(Some(line)) => {
                    if self.process_line(peer, &line).await == LineOutcome::Close {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Chat peer {} closed the connection", peer);
                    break;
                }
                Err(e) => {
                    warn!("Error reading from chat peer {}: {}", peer, e);
                    break;
                }
            }
        }
    }

    /// Runs one accepted connection to completion.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: Shutdown) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);

        let id = match self.join(peer, tx).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Refusing chat connection from {}: {}", peer, e);
                return;
            }
        };
        info!("Chat connection {} from {}", id, peer);

        let mut writer = tokio::spawn(write_lines(write_half, rx));
        let writer_done = tokio::select! {
            _ = self.serve_lines(BufReader::new(read_half), peer, shutdown) => false,
            _ = &mut writer => true,
        };
        self.leave(peer).await;

        // The writer ends once `leave` drops its queue; a writer stuck on a
        // peer that never reads is aborted.
        if !writer_done {
            join_with_timeout("chat writer", Some(writer)).await;
        }
    }
}

/// Writes queued lines to `writer` until the queue closes or a write fails.
pub async fn write_lines<W>(mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let mut data = line.into_bytes();
        data.push(b'\n');
        if let Err(e) = writer.write_all(&data).await {
            debug!("Chat write failed: {}", e);
            return;
        }
    }

    let _ = writer.shutdown().await;
}

/// TCP listener plus the relay it feeds.
pub struct ChatChannel {
    listener: TcpListener,
    relay: ChatRelay,
}

impl ChatChannel {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Chat channel listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            relay: ChatRelay::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> ChatRelay {
        self.relay.clone()
    }

    /// Accepts connections until shutdown, then waits for their tasks.
    pub async fn run_acceptor(self, mut shutdown: Shutdown) {
        let Self { listener, relay } = self;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = relay.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            relay.handle_connection(stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => {
                        if shutdown.is_requested() {
                            break;
                        }
                        error!("Error accepting chat connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        info!("Chat channel stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;
    use tokio_test::io::Builder;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn shutdown() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown::new(rx))
    }

    async fn joined(relay: &ChatRelay, port: u16) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        relay.join(addr(port), tx).await.unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_chat_relayed_to_others_only() {
        let relay = ChatRelay::new();
        let mut a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;
        let mut c = joined(&relay, 9002).await;

        let outcome = relay.process_line(addr(9000), "CHAT|A|hi").await;

        assert_eq!(outcome, LineOutcome::Continue);
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec!["CHAT|A|hi"]);
        assert_eq!(drain(&mut c), vec!["CHAT|A|hi"]);
    }

    #[tokio::test]
    async fn test_chat_after_peer_left() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let b = joined(&relay, 9001).await;
        let mut c = joined(&relay, 9002).await;

        drop(b);
        relay.leave(addr(9001)).await;
        drain(&mut c);

        relay.process_line(addr(9000), "CHAT|A|hi").await;
        assert_eq!(drain(&mut c), vec!["CHAT|A|hi"]);
        assert_eq!(relay.len().await, 2);
    }

    #[tokio::test]
    async fn test_closed_writer_does_not_stop_broadcast() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let b = joined(&relay, 9001).await;
        let mut c = joined(&relay, 9002).await;

        // B's writer is gone but B is still in the roster.
        drop(b);
        relay.process_line(addr(9000), "CHAT|A|still here").await;

        assert_eq!(drain(&mut c), vec!["CHAT|A|still here"]);
    }

    #[tokio::test]
    async fn test_connect_sets_name_and_notifies_others() {
        let relay = ChatRelay::new();
        let mut a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;

        relay.process_line(addr(9000), "CONNECT|Alice").await;

        assert_eq!(relay.display_name(&addr(9000)).await.as_deref(), Some("Alice"));
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec!["SYSTEM|Alice joined the chat"]);
    }

    #[tokio::test]
    async fn test_leave_uses_last_known_name() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;

        relay.process_line(addr(9000), "CONNECT|Alice").await;
        relay.process_line(addr(9000), "CONNECT|Alicia").await;
        drain(&mut b);

        relay.leave(addr(9000)).await;
        assert_eq!(drain(&mut b), vec!["SYSTEM|Alicia left the chat"]);
    }

    #[tokio::test]
    async fn test_leave_without_connect_uses_default_name() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;

        relay.leave(addr(9000)).await;
        assert_eq!(drain(&mut b), vec!["SYSTEM|Unknown left the chat"]);

        // Leaving twice is harmless.
        relay.leave(addr(9000)).await;
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_closes() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;

        let outcome = relay.process_line(addr(9000), "DISCONNECT|Alice").await;
        assert_eq!(outcome, LineOutcome::Close);
    }

    #[tokio::test]
    async fn test_bad_lines_are_skipped() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;

        for line in ["", "WHISPER|x", "CONNECT|", "HELLO", "SYSTEM|spoofed"] {
            assert_eq!(
                relay.process_line(addr(9000), line).await,
                LineOutcome::Continue
            );
        }
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_serve_lines_until_eof() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;
        let (_stop, shutdown) = shutdown();

        let reader = Builder::new()
            .read(b"CONNECT|Alice\n")
            .read(b"CHAT|Alice|one\r\nCHAT|Alice|two\n")
            .build();
        relay
            .serve_lines(BufReader::new(reader), addr(9000), shutdown)
            .await;

        assert_eq!(
            drain(&mut b),
            vec![
                "SYSTEM|Alice joined the chat",
                "CHAT|Alice|one",
                "CHAT|Alice|two"
            ]
        );
    }

    #[tokio::test]
    async fn test_serve_lines_stops_on_read_error() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;
        let (_stop, shutdown) = shutdown();

        let reader = Builder::new()
            .read(b"CHAT|A|before\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        relay
            .serve_lines(BufReader::new(reader), addr(9000), shutdown)
            .await;

        assert_eq!(drain(&mut b), vec!["CHAT|A|before"]);
    }

    #[tokio::test]
    async fn test_serve_lines_stops_after_disconnect() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let mut b = joined(&relay, 9001).await;
        let (_stop, shutdown) = shutdown();

        let reader = Builder::new()
            .read(b"DISCONNECT|A\nCHAT|A|after\n")
            .build();
        relay
            .serve_lines(BufReader::new(reader), addr(9000), shutdown)
            .await;

        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_write_lines_appends_newline() {
        let writer = Builder::new()
            .write(b"SYSTEM|Bob joined the chat\n")
            .write(b"CHAT|Bob|hey\n")
            .build();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        tx.try_send("SYSTEM|Bob joined the chat".to_string()).unwrap();
        tx.try_send("CHAT|Bob|hey".to_string()).unwrap();
        drop(tx);

        write_lines(writer, rx).await;
    }

    #[tokio::test]
    async fn test_stalled_peer_is_dropped() {
        let relay = ChatRelay::new();
        let _a = joined(&relay, 9000).await;
        let (tx, mut slow) = mpsc::channel(2);
        relay.join(addr(9001), tx).await.unwrap();
        let mut c = joined(&relay, 9002).await;

        for body in ["one", "two", "three", "four"] {
            relay
                .process_line(addr(9000), &format!("CHAT|A|{body}"))
                .await;
        }

        // The slow peer kept what fit, then its queue was closed.
        assert_eq!(drain(&mut slow), vec!["CHAT|A|one", "CHAT|A|two"]);
        assert!(slow.recv().await.is_none());
        assert_eq!(drain(&mut c).len(), 4);
    }

    #[tokio::test]
    async fn test_close_all_ends_writers() {
        let relay = ChatRelay::new();
        let mut a = joined(&relay, 9000).await;

        relay.close_all().await;
        assert!(a.recv().await.is_none());
    }
}

//! Server lifecycle: starting the channels and the tick, and stopping them
//!
//! Every background loop holds a [`Shutdown`] and selects on it next to its
//! blocking operation. [`Server::shutdown`] raises the flag once, then joins
//! the tick first so no state broadcast can start after the channels begin
//! closing, then the receive loop, then the chat acceptor and its
//! connections. Each join is bounded by [`JOIN_TIMEOUT`]. Once the tasks are
//! gone the server drops its own handle on the game socket, so both ports are
//! free again when `shutdown` returns.

use crate::chat::{ChatChannel, ChatRelay};
use crate::config::{GameMode, ServerConfig};
use crate::game::Simulation;
use crate::game_channel::GameChannel;
use crate::physics::{ArenaIntegrator, Integrator};
use log::{debug, info, warn};
use shared::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Longest time shutdown waits for one background task.
pub const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Receiving side of the stop flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    stop: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(stop: watch::Receiver<bool>) -> Self {
        Self { stop }
    }

    pub fn is_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Completes once shutdown is requested or the flag owner is gone.
    /// Safe to use as a `select!` branch.
    pub async fn wait(&mut self) {
        while !*self.stop.borrow_and_update() {
            if self.stop.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owns both channels, the simulation and their background tasks.
pub struct Server {
    config: ServerConfig,
    game: Option<GameChannel>,
    game_addr: SocketAddr,
    chat: Option<ChatChannel>,
    relay: ChatRelay,
    chat_addr: SocketAddr,
    simulation: Option<Simulation>,
    stop: watch::Sender<bool>,
    running: bool,
    tick_task: Option<JoinHandle<()>>,
    receiver_task: Option<JoinHandle<()>>,
    acceptor_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds both channels using the built-in ball integrator.
    pub async fn bind(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let integrator = Box::new(ArenaIntegrator::from_config(&config.game));
        Self::bind_with_integrator(config, integrator).await
    }

    pub async fn bind_with_integrator(
        config: ServerConfig,
        integrator: Box<dyn Integrator>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;

        let game = GameChannel::bind(&config.game_addr(), config.mode, config.room_cap).await?;
        let game_addr = game.local_addr()?;
        let chat = ChatChannel::bind(&config.chat_addr()).await?;
        let chat_addr = chat.local_addr()?;
        let relay = chat.relay();
        let simulation = Simulation::new(config.game.clone(), config.room_cap, integrator);
        let (stop, _) = watch::channel(false);

        Ok(Self {
            config,
            game: Some(game),
            game_addr,
            chat: Some(chat),
            relay,
            chat_addr,
            simulation: Some(simulation),
            stop,
            running: false,
            tick_task: None,
            receiver_task: None,
            acceptor_task: None,
        })
    }

    pub fn game_addr(&self) -> SocketAddr {
        self.game_addr
    }

    pub fn chat_addr(&self) -> SocketAddr {
        self.chat_addr
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn shutdown_handle(&self) -> Shutdown {
        Shutdown::new(self.stop.subscribe())
    }

    /// Spawns the receive loop, the chat acceptor and the tick. A server can
    /// only be started once.
    pub fn start(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let Some(game) = self.game.clone() else {
            return Err("server was already stopped".into());
        };
        let (Some(simulation), Some(chat)) = (self.simulation.take(), self.chat.take()) else {
            return Err("server was already started".into());
        };

        self.receiver_task = Some(tokio::spawn(
            game.clone().run_receiver(self.shutdown_handle()),
        ));
        self.acceptor_task = Some(tokio::spawn(chat.run_acceptor(self.shutdown_handle())));
        self.tick_task = Some(tokio::spawn(run_tick_loop(
            simulation,
            game,
            self.config.clone(),
            self.shutdown_handle(),
        )));
        self.running = true;

        info!(
            "Server started at {} Hz (game {}, chat {})",
            self.config.tick_rate,
            self.config.game_addr(),
            self.chat_addr
        );
        Ok(())
    }

    /// Stops every background task. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        info!("Server shutting down");
        self.stop.send_replace(true);

        join_with_timeout("tick", self.tick_task.take()).await;
        join_with_timeout("game receiver", self.receiver_task.take()).await;
        // Last handle on the UDP socket
        self.game = None;
        self.relay.close_all().await;
        join_with_timeout("chat acceptor", self.acceptor_task.take()).await;

        info!("Server stopped");
    }

    /// Runs until Ctrl+C, then shuts down.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.start()?;

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        } else {
            info!("Received Ctrl+C");
        }

        self.shutdown().await;
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Tasks notice the flag on their own; nothing is joined here.
        self.stop.send_replace(true);
    }
}

/// Waits up to [`JOIN_TIMEOUT`] for `task`, aborting it if it is still running.
pub(crate) async fn join_with_timeout(name: &str, task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else {
        return;
    };

    match tokio::time::timeout(JOIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => debug!("{} task finished", name),
        Ok(Err(e)) => warn!("{} task failed: {}", name, e),
        Err(_) => {
            warn!("{} task did not stop within {:?}, aborting", name, JOIN_TIMEOUT);
            task.abort();
        }
    }
}

/// Fixed-period simulation loop.
///
/// Each tick copies the latest inputs out of the game channel, steps the
/// simulation and broadcasts the result. The serve delay is counted in
/// simulation ticks, so nothing here ever waits on it.
async fn run_tick_loop(
    mut simulation: Simulation,
    game: GameChannel,
    config: ServerConfig,
    mut shutdown: Shutdown,
) {
    let dt = config.dt();
    let sweep_every = u64::from(config.tick_rate);
    let mut ticker = interval(config.tick_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        match game.mode() {
            GameMode::Authoritative => {
                let inputs = game.latest_inputs().await;
                simulation.apply_inputs(&inputs, dt);
            }
            GameMode::ClientAuthoritative => {
                for (id, position) in game.reported_positions().await {
                    simulation.set_reported_position(id, position);
                }
            }
        }

        let outcome = simulation.step(dt);
        game.set_tick(simulation.tick());

        if shutdown.is_requested() {
            break;
        }

        if outcome.goal.is_some() {
            let score = simulation.score();
            game.broadcast(&Message::Score {
                left: score.left,
                right: score.right,
            })
            .await;
        }

        game.broadcast_state(&simulation.snapshot()).await;

        if let Some(timeout) = config.idle_timeout_ticks {
            if simulation.tick() % sweep_every == 0 {
                for session in game.evict_idle(simulation.tick(), timeout).await {
                    info!(
                        "Evicted idle player {} ({}) after {} ticks",
                        session.id, session.peer, timeout
                    );
                }
            }
        }
    }

    info!("Tick loop stopped after {} ticks", simulation.tick());
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::decode;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpStream, UdpSocket};
    use tokio::time::{sleep, timeout};

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            game_port: 0,
            chat_port: 0,
            ..ServerConfig::default()
        }
    }

    async fn recv_until<F>(socket: &UdpSocket, mut matches: F) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let mut buf = [0u8; 256];
        loop {
            match timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    if let Ok(message) = decode(&buf[..len]) {
                        if matches(&message) {
                            return Some(message);
                        }
                    }
                }
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown::new(rx);
        assert!(!shutdown.is_requested());

        tx.send_replace(true);
        timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .unwrap();
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn test_shutdown_wait_returns_when_owner_dropped() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown::new(rx);
        drop(tx);

        timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ServerConfig {
            room_cap: 0,
            ..local_config()
        };
        assert!(Server::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut server = Server::bind(local_config()).await.unwrap();
        server.start().unwrap();
        assert!(server.start().is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_hello_then_state_broadcast() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let game_addr = server.game_addr();
        server.start().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"HELLO", game_addr).await.unwrap();

        let assign = recv_until(&client, |m| matches!(m, Message::Assign(_))).await;
        assert_eq!(assign, Some(Message::Assign(1)));

        let ball = recv_until(&client, |m| matches!(m, Message::BallState { .. })).await;
        assert!(ball.is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_broadcast_after_shutdown() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let game_addr = server.game_addr();
        server.start().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"HELLO", game_addr).await.unwrap();
        recv_until(&client, |m| matches!(m, Message::BallState { .. })).await;

        server.shutdown().await;
        assert!(!server.is_running());

        // Drop whatever was in flight, then expect silence.
        sleep(Duration::from_millis(50)).await;
        let mut buf = [0u8; 256];
        while client.try_recv_from(&mut buf).is_ok() {}
        assert!(recv_until(&client, |_| true).await.is_none());

        // A second shutdown is a no-op.
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ports_are_free_after_shutdown() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let game_addr = server.game_addr();
        let chat_addr = server.chat_addr();
        server.start().unwrap();

        server.shutdown().await;

        // The server value is still alive here.
        assert!(UdpSocket::bind(game_addr).await.is_ok());
        assert!(tokio::net::TcpListener::bind(chat_addr).await.is_ok());
        assert!(server.start().is_err());
    }

    #[tokio::test]
    async fn test_join_with_timeout_aborts_stuck_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stuck = tokio::spawn(async move {
            let _held = tx;
            std::future::pending::<()>().await;
        });

        join_with_timeout("stuck", Some(stuck)).await;

        // Aborting drops the task and the sender it owned.
        let closed = timeout(Duration::from_millis(200), rx).await.unwrap();
        assert!(closed.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_chat_connections() {
        let mut server = Server::bind(local_config()).await.unwrap();
        let chat_addr = server.chat_addr();
        server.start().unwrap();

        let mut stream = TcpStream::connect(chat_addr).await.unwrap();
        stream.write_all(b"CONNECT|Alice\n").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        server.shutdown().await;

        let mut lines = BufReader::new(stream).lines();
        let next = timeout(Duration::from_millis(500), lines.next_line())
            .await
            .unwrap();
        assert!(matches!(next, Ok(None) | Err(_)));
    }
}

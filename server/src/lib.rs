//! # Pong Relay Server
//!
//! Authoritative backend for a networked paddle game. The server owns the
//! canonical paddle and ball positions, applies player input at a fixed tick
//! rate, and streams the result to every player over UDP. A second, reliable
//! TCP channel relays free-text chat between connected clients.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Paddles move only in response to the latest `INPUT:` value of their owner
//! and are clamped to the arena. The ball is advanced by an [`physics::Integrator`];
//! the simulation reacts to the contacts it reports (wall flip, paddle bounce
//! angled by the hit offset) and to goals (score, recentre, delayed serve).
//!
//! ### Session Management
//! Each UDP peer address is mapped to a player id from the pool
//! `1..=room_cap`. Peers beyond the cap get no reply at all. Chat connections
//! are tracked in a separate, unbounded registry together with their display
//! name.
//!
//! ### State Broadcasting
//! Every tick the server sends one `PLAYER:` datagram per paddle and one
//! `BALL:` datagram to every known peer. Lost datagrams are simply superseded
//! by the next tick.
//!
//! ## Architecture Design
//!
//! ### Tasks and Locks
//! The game receive loop, the chat accept loop, one reader and one writer per
//! chat connection, and the tick loop all run as separate tokio tasks. Shared
//! maps (latest inputs, reported positions, session registries, chat roster)
//! each sit behind one `RwLock`. Locks are only held while copying data in or
//! out; all network sends happen on a copy.
//!
//! ### Two Trust Models
//! In [`config::GameMode::Authoritative`] mode clients send `HELLO` and
//! `INPUT:`. In [`config::GameMode::ClientAuthoritative`] mode clients report
//! their own paddle with `POS:` and the server only relays it and runs the ball.
//!
//! ### Wire Protocol
//! Both channels speak single-line text. See the `shared` crate for the codec.
//!
//! | Channel | Direction | Message |
//! |---|---|---|
//! | UDP | C→S | `HELLO`, `INPUT:<v>`, `POS:<x>;<y>` |
//! | UDP | S→C | `ASSIGN:<id>`, `PLAYER:<id>:<x>;<y>`, `BALL:<x>;<y>`, `SCORE:<l>;<r>` |
//! | TCP | C↔S | `CONNECT\|<name>`, `CHAT\|<sender>\|<body>`, `DISCONNECT\|<name>` |
//! | TCP | S→C | `SYSTEM\|<text>` |
//!
//! ## Module Organization
//!
//! - `config`: server and game tuning, JSON file loading, validation
//! - `session`: peer address to id registry shared by both channels
//! - `physics`: ball integrator and contact reporting
//! - `game`: the authoritative simulation
//! - `game_channel`: UDP receive loop and state fan-out
//! - `chat`: TCP chat relay
//! - `lifecycle`: [`Server`], start and bounded shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         room_cap: 2,
//!         tick_rate: 50,
//!         ..ServerConfig::default()
//!     };
//!
//!     // Binds UDP 5001 and TCP 5556, runs until Ctrl+C
//!     let server = Server::bind(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod config;
pub mod game;
pub mod game_channel;
pub mod lifecycle;
pub mod physics;
pub mod session;

pub use lifecycle::Server;

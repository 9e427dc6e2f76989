//! Server configuration
//!
//! Values come from three layers: built-in defaults, an optional JSON file,
//! and command-line overrides applied by the binary. Every struct here uses
//! `#[serde(default)]`, so a config file only needs the keys it changes.

use serde::Deserialize;
use shared::{Vector2, DEFAULT_CHAT_PORT, DEFAULT_GAME_PORT};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest room the paddle layout supports.
pub const MAX_ROOM_CAP: u32 = 4;

/// Fastest tick the server will schedule.
pub const MAX_TICK_RATE: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Trust model of the game channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Clients send `HELLO` and `INPUT:`; the server moves the paddles.
    #[default]
    Authoritative,
    /// Clients report their own paddle with `POS:`; the server relays it.
    ClientAuthoritative,
}

/// Tuning of the paddle game rules.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub paddle_speed: f32,
    pub paddle_min_y: f32,
    pub paddle_max_y: f32,
    pub paddle_width: f32,
    pub paddle_height: f32,
    /// Fixed x position per paddle id (index 0 is player 1). Empty means
    /// the layout is derived from the room cap.
    pub paddle_x: Vec<f32>,
    pub ball_speed: f32,
    pub ball_radius: f32,
    pub ball_start: (f32, f32),
    /// Crossing this x scores for the right side.
    pub left_wall_x: f32,
    /// Crossing this x scores for the left side.
    pub right_wall_x: f32,
    pub arena_top: f32,
    pub arena_bottom: f32,
    /// Weight of the hit offset when a paddle redirects the ball.
    pub bounce_factor: f32,
    pub serve_delay_secs: f32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            paddle_speed: 25.0,
            paddle_min_y: -4.5,
            paddle_max_y: 4.5,
            paddle_width: 0.5,
            paddle_height: 1.5,
            paddle_x: Vec::new(),
            ball_speed: 10.0,
            ball_radius: 0.25,
            ball_start: (0.0, 0.0),
            left_wall_x: -9.0,
            right_wall_x: 9.0,
            arena_top: 5.0,
            arena_bottom: -5.0,
            bounce_factor: 2.0,
            serve_delay_secs: 1.0,
        }
    }
}

impl GameConfig {
    pub fn start_position(&self) -> Vector2 {
        Vector2::new(self.ball_start.0, self.ball_start.1)
    }

    /// Returns the x position of every paddle id in `1..=room_cap`.
    ///
    /// Without explicit positions the first half of the ids defends the left
    /// goal and the rest the right goal, outermost paddle first.
    pub fn paddle_layout(&self, room_cap: u32) -> Vec<(u32, f32)> {
        let left_count = room_cap.div_ceil(2);
        (1..=room_cap)
            .map(|id| {
                let x = match self.paddle_x.get(id as usize - 1) {
                    Some(x) => *x,
                    None if id <= left_count => -8.0 + 2.0 * (id - 1) as f32,
                    None => 8.0 - 2.0 * (room_cap - id) as f32,
                };
                (id, x)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub game_port: u16,
    pub chat_port: u16,
    /// Simulation steps per second.
    pub tick_rate: u32,
    pub mode: GameMode,
    /// Maximum number of players assigned an id on the game channel.
    pub room_cap: u32,
    /// Evict game sessions silent for this many ticks. `None` keeps every
    /// session for the lifetime of the server.
    pub idle_timeout_ticks: Option<u64>,
    pub game: GameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            game_port: DEFAULT_GAME_PORT,
            chat_port: DEFAULT_CHAT_PORT,
            tick_rate: 50,
            mode: GameMode::default(),
            room_cap: 2,
            idle_timeout_ticks: None,
            game: GameConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_TICK_RATE).contains(&self.tick_rate) {
            return Err(ConfigError::Invalid(format!(
                "tick_rate must be between 1 and {MAX_TICK_RATE}"
            )));
        }
        if !(1..=MAX_ROOM_CAP).contains(&self.room_cap) {
            return Err(ConfigError::Invalid(format!(
                "room_cap must be between 1 and {MAX_ROOM_CAP}"
            )));
        }
        if self.idle_timeout_ticks == Some(0) {
            return Err(ConfigError::Invalid(
                "idle_timeout_ticks must be positive when set".into(),
            ));
        }
        let game = &self.game;
        if game.paddle_min_y > game.paddle_max_y {
            return Err(ConfigError::Invalid(
                "paddle_min_y is above paddle_max_y".into(),
            ));
        }
        if game.left_wall_x >= game.right_wall_x || game.arena_bottom >= game.arena_top {
            return Err(ConfigError::Invalid("arena bounds are inverted".into()));
        }
        if game.ball_speed <= 0.0 || game.serve_delay_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "ball_speed must be positive and serve_delay_secs not negative".into(),
            ));
        }
        Ok(())
    }

    pub fn game_addr(&self) -> String {
        format!("{}:{}", self.host, self.game_port)
    }

    pub fn chat_addr(&self) -> String {
        format!("{}:{}", self.host, self.chat_port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f32(self.dt())
    }

    /// Fixed simulation step in seconds.
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }
}

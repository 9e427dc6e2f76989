//! Authoritative paddle game state
//!
//! [`Simulation`] owns the paddles, the score and the ball integrator. It is
//! driven by the tick loop one fixed step at a time and never touches the
//! network; the tick loop copies inputs in before a step and a [`Snapshot`]
//! out after it.

use crate::config::GameConfig;
use crate::physics::{Contact, Integrator, Obstacle, Surface};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::Vector2;
use std::collections::{BTreeMap, HashMap};

/// Side of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Score {
    pub left: u32,
    pub right: u32,
}

/// Consistent copy of everything the broadcast needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: u64,
    /// Paddle positions ordered by player id
    pub paddles: Vec<(u32, Vector2)>,
    pub ball: Vector2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepOutcome {
    /// Side that scored during this step
    pub goal: Option<Side>,
    /// True when a pending serve launched the ball during this step
    pub served: bool,
}

pub struct Simulation {
    config: GameConfig,
    paddles: BTreeMap<u32, Vector2>,
    integrator: Box<dyn Integrator>,
    direction: Vector2,
    score: Score,
    tick: u64,
    /// Tick of the last reset while the ball waits to be served
    parked_since: Option<u64>,
    rng: StdRng,
}

impl Simulation {
    pub fn new(config: GameConfig, room_cap: u32, integrator: Box<dyn Integrator>) -> Self {
        Self::with_rng(config, room_cap, integrator, StdRng::from_entropy())
    }

    /// Deterministic serve directions, for tests and replays.
    pub fn with_seed(
        config: GameConfig,
        room_cap: u32,
        integrator: Box<dyn Integrator>,
        seed: u64,
    ) -> Self {
        Self::with_rng(config, room_cap, integrator, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: GameConfig,
        room_cap: u32,
        integrator: Box<dyn Integrator>,
        rng: StdRng,
    ) -> Self {
        let paddles = config
            .paddle_layout(room_cap)
            .into_iter()
            .map(|(id, x)| (id, Vector2::new(x, 0.0)))
            .collect();

        let mut simulation = Self {
            config,
            paddles,
            integrator,
            direction: Vector2::ZERO,
            score: Score::default(),
            tick: 0,
            parked_since: None,
            rng,
        };
        simulation.reset_ball();
        simulation
    }

    /// Moves every paddle that has a recorded input. The same input is
    /// applied again on every step until the client sends a new one.
    pub fn apply_inputs(&mut self, inputs: &HashMap<u32, f32>, dt: f32) {
        for (id, input) in inputs {
            if let Some(paddle) = self.paddles.get_mut(id) {
                paddle.y = (paddle.y + input * self.config.paddle_speed * dt)
                    .clamp(self.config.paddle_min_y, self.config.paddle_max_y);
            }
        }
    }

    /// Takes a client-reported paddle position (client-authoritative mode).
    pub fn set_reported_position(&mut self, id: u32, position: Vector2) {
        if let Some(paddle) = self.paddles.get_mut(&id) {
            *paddle = position;
        }
    }

    /// Advances the game by one fixed step.
    pub fn step(&mut self, dt: f32) -> StepOutcome {
        self.tick += 1;

        let mut outcome = StepOutcome::default();
        if self.serve_is_due(dt) {
            self.launch();
            outcome.served = true;
        }

        let obstacles: Vec<Obstacle> = self
            .paddles
            .values()
            .map(|center| Obstacle {
                center: *center,
                width: self.config.paddle_width,
                height: self.config.paddle_height,
            })
            .collect();

        for contact in self.integrator.advance(dt, &obstacles) {
            self.on_contact(&contact);
        }

        outcome.goal = self.check_goal();
        outcome
    }

    /// Redirects the ball after the integrator reported a contact.
    pub fn on_contact(&mut self, contact: &Contact) {
        // The ball is parked while a serve is pending.
        if self.parked_since.is_some() {
            return;
        }

        match contact.surface {
            Surface::Wall => {
                if contact.normal.y != 0.0 {
                    self.direction.y = -self.direction.y;
                }
                if contact.normal.x != 0.0 {
                    self.direction.x = -self.direction.x;
                }
            }
            Surface::Paddle => {
                let offset = self.integrator.position().y - contact.other_center.y;
                self.direction.x = -self.direction.x;
                self.direction.y = offset * self.config.bounce_factor;
                self.direction = self.direction.normalize();
            }
        }

        self.integrator
            .set_velocity(self.direction.scale(self.config.ball_speed));
        debug!("Ball hit {:?}, direction {:?}", contact.surface, self.direction);
    }

    /// Scores and resets once the ball is past either goal line.
    pub fn check_goal(&mut self) -> Option<Side> {
        let x = self.integrator.position().x;
        let scorer = if x > self.config.right_wall_x {
            Side::Left
        } else if x < self.config.left_wall_x {
            Side::Right
        } else {
            return None;
        };

        match scorer {
            Side::Left => self.score.left += 1,
            Side::Right => self.score.right += 1,
        }
        info!(
            "Goal for the {:?} side, score {}:{}",
            scorer, self.score.left, self.score.right
        );

        self.reset_ball();
        Some(scorer)
    }

    /// Parks the ball at the start position with a fresh random direction.
    /// The ball starts moving once `serve_delay_secs` of simulated time pass,
    /// counted in whole ticks.
    pub fn reset_ball(&mut self) {
        self.integrator.set_position(self.config.start_position());

        let x = if self.rng.gen_bool(0.5) { -1.0 } else { 1.0 };
        let y = self.rng.gen_range(-0.5..=0.5);
        self.direction = Vector2::new(x, y).normalize();
        self.integrator.set_velocity(Vector2::ZERO);

        if self.config.serve_delay_secs > 0.0 {
            self.parked_since = Some(self.tick);
        } else {
            self.launch();
        }
    }

    /// Compares whole ticks so the delay does not drift with `dt` rounding.
    fn serve_is_due(&self, dt: f32) -> bool {
        let Some(since) = self.parked_since else {
            return false;
        };
        let delay_ticks = (self.config.serve_delay_secs / dt).round() as u64;
        self.tick >= since + delay_ticks
    }

    fn launch(&mut self) {
        self.parked_since = None;
        self.integrator
            .set_velocity(self.direction.scale(self.config.ball_speed));
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tick: self.tick,
            paddles: self.paddles.iter().map(|(id, pos)| (*id, *pos)).collect(),
            ball: self.integrator.position(),
        }
    }

    pub fn score(&self) -> Score {
        self.score
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn direction(&self) -> Vector2 {
        self.direction
    }

    pub fn ball_velocity(&self) -> Vector2 {
        self.integrator.velocity()
    }

    pub fn paddle(&self, id: u32) -> Option<Vector2> {
        self.paddles.get(&id).copied()
    }

    pub fn integrator_mut(&mut self) -> &mut dyn Integrator {
        self.integrator.as_mut()
    }
}

//! Ball integrator
//!
//! The simulation does not move the ball itself. It sets the ball velocity,
//! asks an [`Integrator`] to advance one step, and reacts to the contacts the
//! integrator reports. [`ArenaIntegrator`] is the built-in implementation: a
//! kinematic ball between a floor and a ceiling, colliding with paddle boxes.

use crate::config::GameConfig;
use shared::Vector2;

/// Category of the surface the ball touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Wall,
    Paddle,
}

/// Contact notification produced by [`Integrator::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    pub surface: Surface,
    /// Unit normal pointing from the surface towards the ball.
    pub normal: Vector2,
    /// Center of the touched body.
    pub other_center: Vector2,
}

/// Axis-aligned box the ball can collide with. Position is the center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obstacle {
    pub center: Vector2,
    pub width: f32,
    pub height: f32,
}

/// Physics collaborator advancing the ball.
pub trait Integrator: Send {
    /// Moves the ball by one step and returns the contacts it made.
    fn advance(&mut self, dt: f32, paddles: &[Obstacle]) -> Vec<Contact>;
    fn position(&self) -> Vector2;
    fn set_position(&mut self, position: Vector2);
    fn velocity(&self) -> Vector2;
    fn set_velocity(&mut self, velocity: Vector2);
}

#[derive(Debug, Clone)]
pub struct ArenaIntegrator {
    position: Vector2,
    velocity: Vector2,
    radius: f32,
    top: f32,
    bottom: f32,
}

impl ArenaIntegrator {
    pub fn new(radius: f32, top: f32, bottom: f32) -> Self {
        Self {
            position: Vector2::ZERO,
            velocity: Vector2::ZERO,
            radius,
            top,
            bottom,
        }
    }

    pub fn from_config(config: &GameConfig) -> Self {
        let mut integrator = Self::new(config.ball_radius, config.arena_top, config.arena_bottom);
        integrator.position = config.start_position();
        integrator
    }

    fn resolve_walls(&mut self, contacts: &mut Vec<Contact>) {
        if self.position.y + self.radius > self.top {
            self.position.y = self.top - self.radius;
            if self.velocity.y > 0.0 {
                contacts.push(Contact {
                    surface: Surface::Wall,
                    normal: Vector2::new(0.0, -1.0),
                    other_center: Vector2::new(self.position.x, self.top),
                });
            }
        } else if self.position.y - self.radius < self.bottom {
            self.position.y = self.bottom + self.radius;
            if self.velocity.y < 0.0 {
                contacts.push(Contact {
                    surface: Surface::Wall,
                    normal: Vector2::new(0.0, 1.0),
                    other_center: Vector2::new(self.position.x, self.bottom),
                });
            }
        }
    }

    fn resolve_paddles(&mut self, paddles: &[Obstacle], contacts: &mut Vec<Contact>) {
        for paddle in paddles {
            let self_left = self.position.x - self.radius;
            let self_right = self.position.x + self.radius;
            let self_top = self.position.y + self.radius;
            let self_bottom = self.position.y - self.radius;

            let other_left = paddle.center.x - paddle.width / 2.0;
            let other_right = paddle.center.x + paddle.width / 2.0;
            let other_top = paddle.center.y + paddle.height / 2.0;
            let other_bottom = paddle.center.y - paddle.height / 2.0;

            let overlapping = !(self_right <= other_left
                || self_left >= other_right
                || self_bottom >= other_top
                || self_top <= other_bottom);
            if !overlapping {
                continue;
            }

            // Paddles only push the ball out sideways.
            let normal = if self.position.x < paddle.center.x {
                self.position.x = other_left - self.radius;
                Vector2::new(-1.0, 0.0)
            } else {
                self.position.x = other_right + self.radius;
                Vector2::new(1.0, 0.0)
            };

            if self.velocity.x * normal.x < 0.0 {
                contacts.push(Contact {
                    surface: Surface::Paddle,
                    normal,
                    other_center: paddle.center,
                });
            }
        }
    }
}

impl Integrator for ArenaIntegrator {
    fn advance(&mut self, dt: f32, paddles: &[Obstacle]) -> Vec<Contact> {
        self.position = self.position.add(&self.velocity.scale(dt));

        let mut contacts = Vec::new();
        self.resolve_walls(&mut contacts);
        self.resolve_paddles(paddles, &mut contacts);
        contacts
    }

    fn position(&self) -> Vector2 {
        self.position
    }

    fn set_position(&mut self, position: Vector2) {
        self.position = position;
    }

    fn velocity(&self) -> Vector2 {
        self.velocity
    }

    fn set_velocity(&mut self, velocity: Vector2) {
        self.velocity = velocity;
    }
}

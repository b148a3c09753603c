//! Ball body

use super::rules::Rules;
use super::vector::Vector;

/// The ball. `velocity` is a direction; `speed` is the scalar magnitude applied to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ball {
    pub position: Vector,
    pub velocity: Vector,
    pub speed: f32,
    pub radius: f32,
}

impl Ball {
    pub fn new(rules: &Rules, direction: Vector) -> Self {
        Self {
            position: rules.ball.starting_position,
            velocity: direction,
            speed: rules.ball.speed,
            radius: rules.ball.radius,
        }
    }

    /// Move along the current direction for `dt` seconds
    pub fn integrate(&mut self, dt: f32) {
        self.position += self.velocity.scale(self.speed * dt);
    }

    /// Raise speed by the configured increment, never past the cap
    pub fn accelerate(&mut self, rules: &Rules) {
        self.speed = (self.speed + rules.ball.speed_increment).min(rules.ball.max_speed);
    }

    /// Put the ball back at the serve position with a new direction and base speed
    pub fn reset(&mut self, rules: &Rules, direction: Vector) {
        *self = Self::new(rules, direction);
    }
}

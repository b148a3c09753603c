//! Paddle bodies

use serde::{Deserialize, Serialize};

use super::rules::Rules;

/// Which half of the field a player defends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Left,
    Right,
}

/// A paddle, positioned by the vertical centre of its body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paddle {
    pub side: Side,
    pub y: f32,
}

impl Paddle {
    pub fn new(side: Side, rules: &Rules) -> Self {
        Self {
            side,
            y: rules.paddle.starting_position,
        }
    }

    /// Move to `y`, clamped so the whole body stays on the field
    pub fn move_to(&mut self, y: f32, rules: &Rules) {
        let (min, max) = rules.paddle_bounds();
        self.y = y.clamp(min, max);
    }

    /// x of the face the ball strikes
    pub fn front_face(&self, rules: &Rules) -> f32 {
        let half = rules.paddle.width / 2.0;
        match self.side {
            Side::Left => rules.paddle.left_line + half,
            Side::Right => rules.paddle.right_line - half,
        }
    }

    /// x of the face closest to the paddle's own goal edge
    pub fn back_face(&self, rules: &Rules) -> f32 {
        let half = rules.paddle.width / 2.0;
        match self.side {
            Side::Left => rules.paddle.left_line - half,
            Side::Right => rules.paddle.right_line + half,
        }
    }

    pub fn covers(&self, y: f32, rules: &Rules) -> bool {
        let half = rules.paddle.height / 2.0;
        y >= self.y - half && y <= self.y + half
    }
}

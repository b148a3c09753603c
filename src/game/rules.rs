//! Field geometry and ball/paddle constants per match type

use serde::Serialize;
use std::sync::Arc;

use crate::ws::protocol::MatchType;

use super::vector::Vector;

/// Ball constants
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BallRules {
    pub starting_position: Vector,
    pub radius: f32,
    /// Speed at the start of every rally
    pub speed: f32,
    pub max_speed: f32,
    /// Added on every paddle hit or goal-edge bounce
    pub speed_increment: f32,
}

/// Paddle constants
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PaddleRules {
    pub starting_position: f32,
    pub width: f32,
    pub height: f32,
    /// Centre line of the left paddle body
    pub left_line: f32,
    /// Centre line of the right paddle body
    pub right_line: f32,
}

/// Immutable match rules. Built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Rules {
    pub field_width: f32,
    pub field_height: f32,
    pub left_collision_edge: f32,
    pub right_collision_edge: f32,
    pub top_collision_edge: f32,
    pub bottom_collision_edge: f32,
    pub ball: BallRules,
    pub paddle: PaddleRules,
    pub winning_score: u32,
}

impl Rules {
    pub fn for_type(match_type: MatchType) -> Self {
        let classic = Self::classic();
        match match_type {
            MatchType::Classic => classic,
            MatchType::Turbo => Self {
                ball: BallRules {
                    speed: 450.0,
                    max_speed: 1200.0,
                    speed_increment: 75.0,
                    ..classic.ball
                },
                ..classic
            },
        }
    }

    fn classic() -> Self {
        let width = 800.0;
        let height = 600.0;
        let radius = 10.0;
        Self {
            field_width: width,
            field_height: height,
            left_collision_edge: radius,
            right_collision_edge: width - radius,
            top_collision_edge: radius,
            bottom_collision_edge: height - radius,
            ball: BallRules {
                starting_position: Vector::new(width / 2.0, height / 2.0),
                radius,
                speed: 300.0,
                max_speed: 800.0,
                speed_increment: 50.0,
            },
            paddle: PaddleRules {
                starting_position: height / 2.0,
                width: 10.0,
                height: 100.0,
                left_line: 30.0,
                right_line: width - 30.0,
            },
            winning_score: 5,
        }
    }

    /// Reject configurations the simulation cannot run with
    pub fn validate(&self) -> Result<(), RulesError> {
        if !(self.field_width > 0.0 && self.field_height > 0.0) {
            return Err(RulesError::Invalid("field size must be positive"));
        }
        if self.ball.radius <= 0.0 {
            return Err(RulesError::Invalid("ball radius must be positive"));
        }
        if self.ball.speed <= 0.0 {
            return Err(RulesError::Invalid("ball speed must be positive"));
        }
        if self.ball.max_speed < self.ball.speed {
            return Err(RulesError::MaxSpeedBelowBase {
                max_speed: self.ball.max_speed,
                speed: self.ball.speed,
            });
        }
        if self.ball.speed_increment <= 0.0 {
            return Err(RulesError::Invalid("speed increment must be positive"));
        }
        if !(0.0 <= self.left_collision_edge
            && self.left_collision_edge < self.right_collision_edge
            && self.right_collision_edge <= self.field_width)
        {
            return Err(RulesError::Invalid("horizontal collision edges out of field"));
        }
        if !(0.0 <= self.top_collision_edge
            && self.top_collision_edge < self.bottom_collision_edge
            && self.bottom_collision_edge <= self.field_height)
        {
            return Err(RulesError::Invalid("vertical collision edges out of field"));
        }
        if self.paddle.width <= 0.0 || self.paddle.height <= 0.0 {
            return Err(RulesError::Invalid("paddle size must be positive"));
        }
        if self.paddle.height >= self.field_height {
            return Err(RulesError::Invalid("paddle taller than field"));
        }
        if !(self.left_collision_edge < self.paddle.left_line
            && self.paddle.left_line < self.paddle.right_line
            && self.paddle.right_line < self.right_collision_edge)
        {
            return Err(RulesError::Invalid("paddle lines must sit inside the collision edges"));
        }
        if self.winning_score == 0 {
            return Err(RulesError::Invalid("winning score must be at least 1"));
        }
        Ok(())
    }

    /// Lowest and highest centre y a paddle may occupy
    pub fn paddle_bounds(&self) -> (f32, f32) {
        let half = self.paddle.height / 2.0;
        (half, self.field_height - half)
    }
}

/// Rules for every match type, validated once
#[derive(Debug, Clone)]
pub struct RuleBook {
    classic: Arc<Rules>,
    turbo: Arc<Rules>,
}

impl RuleBook {
    /// Build the default rules, optionally overriding the winning score
    pub fn new(winning_score: Option<u32>) -> Result<Self, RulesError> {
        let build = |match_type| -> Result<Arc<Rules>, RulesError> {
            let mut rules = Rules::for_type(match_type);
            if let Some(score) = winning_score {
                rules.winning_score = score;
            }
            rules.validate()?;
            Ok(Arc::new(rules))
        };

        Ok(Self {
            classic: build(MatchType::Classic)?,
            turbo: build(MatchType::Turbo)?,
        })
    }

    pub fn get(&self, match_type: MatchType) -> Arc<Rules> {
        match match_type {
            MatchType::Classic => self.classic.clone(),
            MatchType::Turbo => self.turbo.clone(),
        }
    }
}

/// Rules validation errors
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("Ball max speed {max_speed} is below base speed {speed}")]
    MaxSpeedBelowBase { max_speed: f32, speed: f32 },

    #[error("Invalid rules: {0}")]
    Invalid(&'static str),
}

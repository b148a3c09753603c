//! Ball and paddle simulation for a single match

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Instant;

use crate::util::time::{TickClock, MAX_SUBSTEP};
use crate::ws::protocol::GameEvent;

use super::ball::Ball;
use super::lifecycle::MatchError;
use super::paddle::{Paddle, Side};
use super::rules::Rules;
use super::vector::Vector;

/// Physics state of one match. Only the owning match loop mutates it.
pub struct Simulation {
    rules: Arc<Rules>,
    ball: Ball,
    left: Paddle,
    right: Paddle,
    clock: TickClock,
    rng: ChaCha8Rng,
}

impl Simulation {
    pub fn new(rules: Arc<Rules>, seed: u64, now: Instant) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let ball = Ball::new(&rules, Vector::random_unit(&mut rng));
        let left = Paddle::new(Side::Left, &rules);
        let right = Paddle::new(Side::Right, &rules);
        let mut clock = TickClock::new();
        clock.rebase(now);

        Self {
            rules,
            ball,
            left,
            right,
            clock,
            rng,
        }
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn ball(&self) -> &Ball {
        &self.ball
    }

    pub fn paddle(&self, side: Side) -> &Paddle {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    #[cfg(test)]
    pub(crate) fn ball_mut(&mut self) -> &mut Ball {
        &mut self.ball
    }

    /// Serve position: paddles centred, ball at the start point with a fresh
    /// random direction and base speed. The tick clock restarts at `now`.
    pub fn reset_positions(&mut self, now: Instant) {
        self.left = Paddle::new(Side::Left, &self.rules);
        self.right = Paddle::new(Side::Right, &self.rules);
        let direction = Vector::random_unit(&mut self.rng);
        self.ball.reset(&self.rules, direction);
        self.clock.rebase(now);
    }

    /// Re-baseline the tick clock without touching bodies
    pub fn rebase_clock(&mut self, now: Instant) {
        self.clock.rebase(now);
    }

    /// Apply a player's paddle position. Values inside the field are clamped so
    /// the body stays on it; anything else is rejected.
    pub fn move_paddle(&mut self, side: Side, y: f32) -> Result<f32, MatchError> {
        if !y.is_finite() {
            return Err(MatchError::InvalidPaddleMove("position is not a number".into()));
        }
        if y < 0.0 || y > self.rules.field_height {
            return Err(MatchError::InvalidPaddleMove(format!(
                "position {y} outside field 0..{}",
                self.rules.field_height
            )));
        }

        let paddle = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        paddle.move_to(y, &self.rules);
        Ok(paddle.y)
    }

    /// Advance by the wall-clock time elapsed since the previous tick
    pub fn tick(&mut self, now: Instant) -> Vec<GameEvent> {
        let dt = self.clock.delta(now);
        self.advance(dt)
    }

    /// Advance by `dt` seconds in sub-steps no longer than [`MAX_SUBSTEP`].
    /// Stops at the first goal; the remaining time is dropped because the
    /// ball is about to be reset.
    pub fn advance(&mut self, dt: f32) -> Vec<GameEvent> {
        let mut events = Vec::new();
        if dt <= 0.0 {
            return events;
        }

        let steps = (dt / MAX_SUBSTEP).ceil().max(1.0) as u32;
        let step_dt = dt / steps as f32;

        for _ in 0..steps {
            let step_events = self.step(step_dt);
            let scored = step_events
                .iter()
                .any(|e| matches!(e, GameEvent::Goal { .. }));
            events.extend(step_events);
            if scored {
                break;
            }
        }

        events
    }

    /// One integration step followed by goal-edge, side-wall and paddle
    /// resolution, in that order
    pub fn step(&mut self, dt: f32) -> Vec<GameEvent> {
        let mut events = Vec::new();

        self.ball.integrate(dt);

        if let Some(scorer) = self.resolve_goal_edges() {
            events.push(GameEvent::Goal { scorer });
        }

        if self.resolve_side_walls() {
            events.push(GameEvent::WallBounce);
        }

        if let Some(side) = self.resolve_paddles() {
            events.push(GameEvent::PaddleHit { side });
        }

        events
    }

    /// Reflect off the left/right edges. Returns the side that scored.
    fn resolve_goal_edges(&mut self) -> Option<Side> {
        let rules = &self.rules;
        let ball = &mut self.ball;

        let scorer = if ball.velocity.x < 0.0 && ball.position.x <= rules.left_collision_edge {
            let overflow = rules.left_collision_edge - ball.position.x;
            ball.position.x += overflow * 2.0;
            Side::Right
        } else if ball.velocity.x > 0.0 && ball.position.x >= rules.right_collision_edge {
            let overflow = ball.position.x - rules.right_collision_edge;
            ball.position.x -= overflow * 2.0;
            Side::Left
        } else {
            return None;
        };

        ball.velocity.x = -ball.velocity.x;
        ball.accelerate(rules);
        Some(scorer)
    }

    /// Reflect off the top/bottom walls
    fn resolve_side_walls(&mut self) -> bool {
        let rules = &self.rules;
        let ball = &mut self.ball;

        if ball.velocity.y < 0.0 && ball.position.y <= rules.top_collision_edge {
            let overflow = rules.top_collision_edge - ball.position.y;
            ball.position.y += overflow * 2.0;
        } else if ball.velocity.y > 0.0 && ball.position.y >= rules.bottom_collision_edge {
            let overflow = ball.position.y - rules.bottom_collision_edge;
            ball.position.y -= overflow * 2.0;
        } else {
            return false;
        }

        ball.velocity.y = -ball.velocity.y;
        true
    }

    /// At most one paddle per step, left first
    fn resolve_paddles(&mut self) -> Option<Side> {
        let side = if self.hits_paddle(Side::Left) {
            Side::Left
        } else if self.hits_paddle(Side::Right) {
            Side::Right
        } else {
            return None;
        };

        self.ball.velocity.x = -self.ball.velocity.x;
        self.ball.accelerate(&self.rules);
        Some(side)
    }

    fn hits_paddle(&self, side: Side) -> bool {
        let rules = &*self.rules;
        let ball = &self.ball;
        let paddle = self.paddle(side);
        let front = paddle.front_face(rules);
        let back = paddle.back_face(rules);

        let crossed = match side {
            Side::Left => {
                ball.velocity.x < 0.0
                    && ball.position.x - ball.radius <= front
                    && ball.position.x + ball.radius >= back
            }
            Side::Right => {
                ball.velocity.x > 0.0
                    && ball.position.x + ball.radius >= front
                    && ball.position.x - ball.radius <= back
            }
        };

        crossed && paddle.covers(ball.position.y, rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::MatchType;

    /// Small 110x100 field with the right goal edge at x = 100
    fn small_rules() -> Arc<Rules> {
        let mut rules = Rules::for_type(MatchType::Classic);
        rules.field_width = 110.0;
        rules.field_height = 100.0;
        rules.left_collision_edge = 10.0;
        rules.right_collision_edge = 100.0;
        rules.top_collision_edge = 10.0;
        rules.bottom_collision_edge = 90.0;
        rules.ball.starting_position = Vector::new(55.0, 50.0);
        rules.ball.radius = 2.0;
        rules.paddle.starting_position = 50.0;
        rules.paddle.width = 4.0;
        rules.paddle.height = 20.0;
        rules.paddle.left_line = 20.0;
        rules.paddle.right_line = 90.0;
        rules.validate().unwrap();
        Arc::new(rules)
    }

    fn sim_with_ball(rules: Arc<Rules>, position: Vector, velocity: Vector) -> Simulation {
        let mut sim = Simulation::new(rules, 1, Instant::now());
        let ball = sim.ball_mut();
        ball.position = position;
        ball.velocity = velocity;
        sim
    }

    #[test]
    fn right_edge_reflects_and_scores_for_left() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules.clone(), Vector::new(95.0, 50.0), Vector::new(1.0, 0.0));
        // Move the right paddle away so only the edge is involved
        sim.move_paddle(Side::Right, 10.0).unwrap();

        let events = sim.step(0.02);

        let ball = sim.ball();
        assert!((ball.position.x - 99.0).abs() < 1e-3);
        assert_eq!(ball.velocity, Vector::new(-1.0, 0.0));
        assert_eq!(ball.speed, 300.0 + rules.ball.speed_increment);
        assert!(events.contains(&GameEvent::Goal { scorer: Side::Left }));
    }

    #[test]
    fn left_edge_scores_for_right() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules, Vector::new(12.0, 80.0), Vector::new(-1.0, 0.0));
        sim.move_paddle(Side::Left, 20.0).unwrap();

        let events = sim.step(0.02);

        assert!(events.contains(&GameEvent::Goal { scorer: Side::Right }));
        assert!((sim.ball().position.x - 14.0).abs() < 1e-3);
        assert!(sim.ball().velocity.x > 0.0);
    }

    #[test]
    fn side_wall_reflects_without_speed_change() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules, Vector::new(55.0, 88.0), Vector::new(0.0, 1.0));
        let speed = sim.ball().speed;

        let events = sim.step(0.02);

        assert_eq!(events, vec![GameEvent::WallBounce]);
        let ball = sim.ball();
        assert!((ball.position.y - 86.0).abs() < 1e-3);
        assert_eq!(ball.velocity.y, -1.0);
        assert_eq!(ball.speed, speed);
    }

    #[test]
    fn corner_applies_both_reflections() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules, Vector::new(99.0, 89.0), Vector::new(0.6, 0.8));
        sim.move_paddle(Side::Right, 10.0).unwrap();

        let events = sim.step(0.01);

        assert!(events.contains(&GameEvent::Goal { scorer: Side::Left }));
        assert!(events.contains(&GameEvent::WallBounce));
        let ball = sim.ball();
        assert!(ball.velocity.x < 0.0 && ball.velocity.y < 0.0);
        assert!(ball.position.x <= 100.0 && ball.position.y <= 90.0);
    }

    #[test]
    fn paddle_hit_reverses_and_accelerates() {
        let rules = small_rules();
        // Right paddle front face at 88, ball leading edge reaches it this step
        let mut sim = sim_with_ball(rules.clone(), Vector::new(84.0, 50.0), Vector::new(1.0, 0.0));

        let events = sim.step(0.01);

        assert_eq!(events, vec![GameEvent::PaddleHit { side: Side::Right }]);
        assert_eq!(sim.ball().velocity.x, -1.0);
        assert_eq!(sim.ball().speed, rules.ball.speed + rules.ball.speed_increment);
    }

    #[test]
    fn ball_beside_paddle_is_not_a_hit() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules, Vector::new(84.0, 75.0), Vector::new(1.0, 0.0));

        let events = sim.step(0.01);

        assert!(events.is_empty());
        assert_eq!(sim.ball().velocity.x, 1.0);
    }

    #[test]
    fn ball_moving_away_does_not_hit() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules, Vector::new(89.0, 50.0), Vector::new(-1.0, 0.0));

        let events = sim.step(0.001);

        assert!(events.is_empty());
    }

    #[test]
    fn only_one_paddle_hit_per_step() {
        let mut rules = *small_rules();
        // Overlapping paddle lines so both bodies contain the ball
        rules.paddle.left_line = 50.0;
        rules.paddle.right_line = 52.0;
        let mut sim = sim_with_ball(Arc::new(rules), Vector::new(51.0, 50.0), Vector::new(-1.0, 0.0));

        let events = sim.step(0.0001);

        assert_eq!(events, vec![GameEvent::PaddleHit { side: Side::Left }]);
        assert_eq!(sim.ball().velocity.x, 1.0);
    }

    #[test]
    fn speed_never_exceeds_max_over_a_long_rally() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules.clone(), Vector::new(55.0, 50.0), Vector::new(0.8, 0.6));
        let mut last_speed = sim.ball().speed;

        for _ in 0..2_000 {
            sim.advance(1.0 / 60.0);
            let ball = sim.ball();
            assert!(ball.speed >= last_speed);
            assert!(ball.speed <= rules.ball.max_speed);
            assert!(ball.position.x >= rules.left_collision_edge - 1e-3);
            assert!(ball.position.x <= rules.right_collision_edge + 1e-3);
            assert!(ball.position.y >= rules.top_collision_edge - 1e-3);
            assert!(ball.position.y <= rules.bottom_collision_edge + 1e-3);
            last_speed = ball.speed;
        }
    }

    #[test]
    fn large_delta_is_sub_stepped_so_paddle_is_not_tunnelled() {
        let rules = small_rules();
        // A single 0.25 s step would carry the ball 75 units straight past the paddle
        let mut sim = sim_with_ball(rules, Vector::new(60.0, 50.0), Vector::new(1.0, 0.0));

        let events = sim.advance(0.25);

        assert_eq!(events.first(), Some(&GameEvent::PaddleHit { side: Side::Right }));
        assert!(sim.ball().velocity.x < 0.0);
    }

    #[test]
    fn advance_stops_after_goal() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules, Vector::new(98.0, 80.0), Vector::new(1.0, 0.0));
        sim.move_paddle(Side::Right, 10.0).unwrap();

        let events = sim.advance(0.2);

        let goals = events
            .iter()
            .filter(|e| matches!(e, GameEvent::Goal { .. }))
            .count();
        assert_eq!(goals, 1);
        assert!(sim.ball().position.x > 90.0);
    }

    #[test]
    fn first_tick_produces_no_motion() {
        let rules = small_rules();
        let start = Instant::now();
        let mut sim = Simulation::new(rules, 3, start);
        let before = *sim.ball();

        sim.tick(start);

        assert_eq!(*sim.ball(), before);
    }

    #[test]
    fn reset_positions_restores_serve_state() {
        let rules = small_rules();
        let mut sim = sim_with_ball(rules.clone(), Vector::new(70.0, 20.0), Vector::new(1.0, 0.0));
        sim.ball_mut().speed = 500.0;
        sim.move_paddle(Side::Left, 80.0).unwrap();

        sim.reset_positions(Instant::now());

        assert_eq!(sim.ball().position, rules.ball.starting_position);
        assert_eq!(sim.ball().speed, rules.ball.speed);
        assert!((sim.ball().velocity.magnitude() - 1.0).abs() < 1e-5);
        assert_eq!(sim.paddle(Side::Left).y, rules.paddle.starting_position);
        assert_eq!(sim.paddle(Side::Right).y, rules.paddle.starting_position);
    }

    #[test]
    fn invalid_paddle_moves_are_rejected() {
        let rules = small_rules();
        let mut sim = Simulation::new(rules, 1, Instant::now());
        assert!(matches!(
            sim.move_paddle(Side::Left, f32::NAN),
            Err(MatchError::InvalidPaddleMove(_))
        ));
        assert!(sim.move_paddle(Side::Left, -1.0).is_err());
        assert!(sim.move_paddle(Side::Left, 101.0).is_err());
        assert_eq!(sim.move_paddle(Side::Left, 99.0).unwrap(), 90.0);
    }
}

//! Goal seeking: drive the rover to a world-frame point.
//!
//! The behaviour runs a small state machine stepped once per pose update:
//!
//! ```text
//! NotRunning -> Starting -> Running { Stop -> Angle -> Point } -> Achieved
//! ```
//!
//! `Stop` zeroes the wheels, `Angle` turns in place toward the goal and
//! `Point` drives with the point-forward law, which steers a point ahead of
//! the axle and so stays well-conditioned as the heading error vanishes.

use crate::bus::{MessageBus, MessageKind, Publisher, Specifier, Subscriber};
use crate::config::GoalConfig;
use crate::rover::{wrap_angle, Pose2D};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

/// Upper bound on action transitions evaluated in one poll.
const MAX_TRANSITIONS_PER_POLL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalState {
    NotRunning,
    Starting,
    Running,
    Achieved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalAction {
    Stop,
    Angle,
    Point,
    None,
}

/// What the behaviour needs from the vehicle it steers.
pub trait DriveBase {
    fn pose(&self) -> Pose2D;
    fn wheelbase(&self) -> f32;
    fn min_speed(&self) -> f32;
    fn max_speed(&self) -> f32;
    /// Smallest displacement the odometry can resolve.
    fn min_detectable_distance(&self) -> f32;
    /// Signed wheel speeds, positive forward.
    fn set_wheel_speeds(&mut self, left: f32, right: f32, bus: &MessageBus);

    fn stop(&mut self, bus: &MessageBus) {
        self.set_wheel_speeds(0.0, 0.0, bus);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub x: f32,
    pub y: f32,
    /// Direction from the rover to the goal, refreshed on entering `Angle`.
    pub heading: f32,
    pub tolerance: f32,
    pub angle_tolerance: f32,
    /// Distance of the steered point ahead of the axle.
    pub forward: f32,
    /// Heading correction gain, `wheelbase / (2 * forward)`.
    pub gain: f32,
}

/// Records bus notices for the next poll.
#[derive(Default)]
struct GoalInbox {
    pose_updated: Cell<bool>,
    halted: Cell<bool>,
}

impl GoalInbox {
    fn clear(&self) {
        self.pose_updated.set(false);
        self.halted.set(false);
    }
}

impl Subscriber for GoalInbox {
    fn on_message(&self, _publisher: Publisher, kind: MessageKind, _specifier: Specifier) {
        match kind {
            MessageKind::RoverPose => self.pose_updated.set(true),
            MessageKind::WheelHalt => self.halted.set(true),
            _ => {}
        }
    }
}

/// Left and right speeds of the point-forward law for forward speed `speed`
/// and heading error `error`.
///
/// When either wheel would exceed `max_speed` both are scaled by the same
/// factor so the ratio, and with it the turning radius, is preserved.
pub fn point_forward_speeds(speed: f32, error: f32, gain: f32, max_speed: f32) -> (f32, f32) {
    let (sin, cos) = error.sin_cos();
    let mut left = speed * (cos - gain * sin);
    let mut right = speed * (cos + gain * sin);

    let peak = left.abs().max(right.abs());
    if peak > max_speed && peak > 0.0 {
        let scale = max_speed / peak;
        left *= scale;
        right *= scale;
    }
    (left, right)
}

pub struct GotoGoalBehavior {
    config: GoalConfig,
    inbox: Rc<GoalInbox>,
    goal: Option<Goal>,
    state: GoalState,
    action: GoalAction,
}

impl GotoGoalBehavior {
    pub fn new(config: GoalConfig) -> Self {
        Self {
            config,
            inbox: Rc::new(GoalInbox::default()),
            goal: None,
            state: GoalState::NotRunning,
            action: GoalAction::None,
        }
    }

    fn registration(&self) -> Weak<dyn Subscriber> {
        Rc::downgrade(&self.inbox) as Weak<dyn Subscriber>
    }

    /// Start driving toward `(x, y)`, replacing any goal in flight.
    ///
    /// `point_forward` places the steered point at that fraction of the
    /// wheelbase ahead of the axle. The goal counts as reached inside
    /// `tolerance` or the odometry resolution, whichever is larger.
    pub fn goto_goal<B: DriveBase>(
        &mut self,
        base: &mut B,
        bus: &mut MessageBus,
        x: f32,
        y: f32,
        point_forward: f32,
        tolerance: f32,
    ) {
        self.cancel(base, bus);

        let pose = base.pose();
        let wheelbase = base.wheelbase();
        let forward = (wheelbase * point_forward).max(f32::EPSILON);

        self.goal = Some(Goal {
            x,
            y,
            heading: (y - pose.y).atan2(x - pose.x),
            tolerance,
            angle_tolerance: self.config.angle_tolerance,
            forward,
            gain: wheelbase / (2.0 * forward),
        });

        self.inbox.clear();
        let registration = self.registration();
        bus.subscribe(MessageKind::RoverPose, registration.clone());
        bus.subscribe(MessageKind::WheelHalt, registration);

        self.action = GoalAction::None;
        info!(x, y, tolerance, point_forward, "goto goal");
        self.set_state(GoalState::Starting, bus);
    }

    /// Abandon the current goal. Does nothing unless a goal is in flight.
    pub fn cancel<B: DriveBase>(&mut self, base: &mut B, bus: &mut MessageBus) {
        if !self.is_running() {
            return;
        }
        base.stop(bus);
        self.unsubscribe(bus);
        self.goal = None;
        self.action = GoalAction::None;
        info!("goal cancelled");
        self.set_state(GoalState::NotRunning, bus);
    }

    /// Act on notices received since the last poll.
    pub fn poll<B: DriveBase>(&mut self, base: &mut B, bus: &mut MessageBus) -> GoalState {
        if !self.is_running() {
            return self.state;
        }

        if self.inbox.halted.take() {
            warn!("wheel halt while seeking goal");
            self.cancel(base, bus);
            return self.state;
        }

        if self.inbox.pose_updated.take() {
            self.step(base, bus);
        }
        self.state
    }

    fn step<B: DriveBase>(&mut self, base: &mut B, bus: &mut MessageBus) {
        for _ in 0..MAX_TRANSITIONS_PER_POLL {
            match (self.state, self.action) {
                (GoalState::Starting, _) => {
                    base.stop(bus);
                    self.action = GoalAction::Stop;
                    self.set_state(GoalState::Running, bus);
                    return;
                }
                (GoalState::Running, GoalAction::Stop) => {
                    let pose = base.pose();
                    if let Some(goal) = self.goal.as_mut() {
                        goal.heading = (goal.y - pose.y).atan2(goal.x - pose.x);
                    }
                    self.set_action(GoalAction::Angle);
                    // Re-evaluate as Angle in this same poll
                }
                (GoalState::Running, GoalAction::Angle) => {
                    if self.turn_toward_goal(base, bus) {
                        base.stop(bus);
                        self.set_action(GoalAction::Point);
                    }
                    return;
                }
                (GoalState::Running, GoalAction::Point) => {
                    if self.drive_toward_goal(base, bus) {
                        base.stop(bus);
                        self.unsubscribe(bus);
                        self.goal = None;
                        self.action = GoalAction::None;
                        info!("goal achieved");
                        self.set_state(GoalState::Achieved, bus);
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    /// Turn in place; true once the heading is within tolerance.
    fn turn_toward_goal<B: DriveBase>(&self, base: &mut B, bus: &MessageBus) -> bool {
        let Some(goal) = self.goal else {
            return true;
        };

        let error = wrap_angle(goal.heading - base.pose().angle);
        if error.abs() <= goal.angle_tolerance {
            return true;
        }

        let max_speed = base.max_speed();
        let min_speed = base.min_speed();
        let cap = (self.config.turn_fraction * max_speed).max(min_speed);
        let speed = (self.config.turn_gain * error.abs() * max_speed)
            .max(min_speed)
            .min(cap)
            .copysign(error);

        // Positive error is counter-clockwise: right wheel forward
        base.set_wheel_speeds(-speed, speed, bus);
        false
    }

    /// Point-forward drive; true once inside the goal circle.
    fn drive_toward_goal<B: DriveBase>(&self, base: &mut B, bus: &MessageBus) -> bool {
        let Some(goal) = self.goal else {
            return true;
        };

        let pose = base.pose();
        let dx = goal.x - pose.x;
        let dy = goal.y - pose.y;
        let distance = dx.hypot(dy);
        let radius = goal.tolerance.max(base.min_detectable_distance());
        if distance <= radius {
            return true;
        }

        let max_speed = base.max_speed();
        let min_speed = base.min_speed();
        let cruise = (self.config.cruise_fraction * max_speed).max(min_speed);
        let speed = (self.config.approach_gain * distance).max(min_speed).min(cruise);
        let error = wrap_angle(dy.atan2(dx) - pose.angle);

        let (left, right) = point_forward_speeds(speed, error, goal.gain, max_speed);
        base.set_wheel_speeds(left, right, bus);
        false
    }

    fn unsubscribe(&self, bus: &mut MessageBus) {
        let registration = self.registration();
        bus.unsubscribe(MessageKind::RoverPose, &registration);
        bus.unsubscribe(MessageKind::WheelHalt, &registration);
        self.inbox.clear();
    }

    fn set_action(&mut self, action: GoalAction) {
        debug!(from = ?self.action, to = ?action, "goal action");
        self.action = action;
    }

    fn set_state(&mut self, state: GoalState, bus: &MessageBus) {
        if self.state == state {
            return;
        }
        info!(from = ?self.state, to = ?state, "goal state");
        self.state = state;
        bus.publish(Publisher::GotoGoal, MessageKind::GoalState, Specifier::Behavior);
    }

    pub fn state(&self) -> GoalState {
        self.state
    }

    pub fn action(&self) -> GoalAction {
        self.action
    }

    pub fn goal(&self) -> Option<Goal> {
        self.goal
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, GoalState::Starting | GoalState::Running)
    }

    pub fn config(&self) -> &GoalConfig {
        &self.config
    }
}

//! Differential-drive rover: two speed-controlled wheels plus dead-reckoning
//! odometry.

use crate::behavior::DriveBase;
use crate::bus::{MessageBus, MessageKind, Publisher, Specifier};
use crate::config::{PidGains, RoverConfig};
use crate::control::SpeedControl;
use crate::hal::MotorOutput;
use crate::wheel::DriveWheel;
use core::f32::consts::{PI, TAU};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// World-frame position and heading. Heading is radians counter-clockwise
/// from +x, kept in (-π, π].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
}

impl Pose2D {
    pub fn new(x: f32, y: f32, angle: f32) -> Self {
        Self {
            x,
            y,
            angle: wrap_angle(angle),
        }
    }

    pub fn distance_to(&self, x: f32, y: f32) -> f32 {
        (x - self.x).hypot(y - self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseVelocity2D {
    pub x: f32,
    pub y: f32,
    pub angular: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WheelMask {
    Left,
    Right,
    Both,
}

impl WheelMask {
    pub fn left(self) -> bool {
        matches!(self, WheelMask::Left | WheelMask::Both)
    }

    pub fn right(self) -> bool {
        matches!(self, WheelMask::Right | WheelMask::Both)
    }
}

/// Wrap an angle into (-π, π].
pub fn wrap_angle(angle: f32) -> f32 {
    let mut wrapped = angle % TAU;
    if wrapped > PI {
        wrapped -= TAU;
    } else if wrapped <= -PI {
        wrapped += TAU;
    }
    wrapped
}

/// Heading change produced by a pair of wheel distance deltas.
pub fn heading_delta(left_delta: f32, right_delta: f32, wheelbase: f32) -> f32 {
    (right_delta - left_delta) / wheelbase
}

/// One dead-reckoning step.
///
/// The position advances along the mid-interval heading, which removes the
/// systematic curvature bias of using either end of the interval.
pub fn advance_pose(
    pose: Pose2D,
    left_delta: f32,
    right_delta: f32,
    wheelbase: f32,
    dt_s: f32,
) -> (Pose2D, PoseVelocity2D) {
    let distance = (left_delta + right_delta) / 2.0;
    let delta_angle = heading_delta(left_delta, right_delta, wheelbase);
    let mid_angle = pose.angle + delta_angle / 2.0;

    let dx = distance * mid_angle.cos();
    let dy = distance * mid_angle.sin();

    let next = Pose2D {
        x: pose.x + dx,
        y: pose.y + dy,
        angle: wrap_angle(pose.angle + delta_angle),
    };

    let velocity = if dt_s > 0.0 {
        PoseVelocity2D {
            x: dx / dt_s,
            y: dy / dt_s,
            angular: delta_angle / dt_s,
        }
    } else {
        PoseVelocity2D::default()
    };

    (next, velocity)
}

pub struct TwoWheelRover<M, C> {
    left: DriveWheel<M, C>,
    right: DriveWheel<M, C>,
    config: RoverConfig,

    pose: Pose2D,
    velocity: PoseVelocity2D,
    initialized: bool,

    last_left_distance: f32,
    last_right_distance: f32,
    last_ticks: u32,
    last_update_ms: u32,
    last_report_ms: u32,
}

impl<M: MotorOutput, C: SpeedControl> TwoWheelRover<M, C> {
    pub fn new(left: DriveWheel<M, C>, right: DriveWheel<M, C>, config: RoverConfig) -> Self {
        debug_assert!(config.wheelbase > 0.0, "wheelbase must be positive");
        Self {
            left,
            right,
            config,
            pose: Pose2D::default(),
            velocity: PoseVelocity2D::default(),
            initialized: false,
            last_left_distance: 0.0,
            last_right_distance: 0.0,
            last_ticks: 0,
            last_update_ms: 0,
            last_report_ms: 0,
        }
    }

    pub fn attach(&mut self) {
        self.left.attach();
        self.right.attach();
        self.initialized = false;
    }

    pub fn detach(&mut self) {
        self.left.detach();
        self.right.detach();
        self.initialized = false;
    }

    pub fn is_attached(&self) -> bool {
        self.left.is_attached() && self.right.is_attached()
    }

    /// Poll both speed loops, then the odometry.
    pub fn poll(&mut self, now_ms: u32, bus: &MessageBus) {
        self.left.poll(now_ms, bus);
        self.right.poll(now_ms, bus);
        self.update_odometry(now_ms, bus);
    }

    fn update_odometry(&mut self, now_ms: u32, bus: &MessageBus) {
        if !self.is_attached() {
            return;
        }

        if !self.initialized {
            self.rebase(now_ms);
            self.pose = Pose2D::default();
            self.velocity = PoseVelocity2D::default();
            self.initialized = true;
            info!("rover pose reset to origin");
            self.publish_pose(now_ms, bus);
            return;
        }

        let elapsed_ms = now_ms.wrapping_sub(self.last_update_ms);
        if elapsed_ms < self.config.odometry_interval_ms {
            return;
        }

        let ticks = self.left.ticks().wrapping_add(self.right.ticks());
        if ticks.wrapping_sub(self.last_ticks) < self.config.min_odometry_ticks {
            // Still: keep pose subscribers stepping with a heartbeat. The
            // integration base stays put so the next velocity spans the
            // whole interval since the last integration.
            if now_ms.wrapping_sub(self.last_report_ms) >= self.config.still_report_ms {
                self.velocity = PoseVelocity2D::default();
                self.publish_pose(now_ms, bus);
            }
            return;
        }

        let left_distance = self.left.distance();
        let right_distance = self.right.distance();
        let (pose, velocity) = advance_pose(
            self.pose,
            left_distance - self.last_left_distance,
            right_distance - self.last_right_distance,
            self.config.wheelbase,
            elapsed_ms as f32 / 1000.0,
        );

        self.pose = pose;
        self.velocity = velocity;
        self.last_left_distance = left_distance;
        self.last_right_distance = right_distance;
        self.last_ticks = ticks;
        self.last_update_ms = now_ms;
        self.publish_pose(now_ms, bus);
    }

    fn rebase(&mut self, now_ms: u32) {
        self.last_left_distance = self.left.distance();
        self.last_right_distance = self.right.distance();
        self.last_ticks = self.left.ticks().wrapping_add(self.right.ticks());
        self.last_update_ms = now_ms;
    }

    fn publish_pose(&mut self, now_ms: u32, bus: &MessageBus) {
        self.last_report_ms = now_ms;
        bus.publish(Publisher::Rover, MessageKind::RoverPose, Specifier::Rover);
    }

    /// Re-zero the pose on the next poll.
    pub fn reset_pose(&mut self) {
        debug!("rover pose reset requested");
        self.initialized = false;
    }

    pub fn set_power(
        &mut self,
        left_forward: bool,
        left_duty: u16,
        right_forward: bool,
        right_duty: u16,
        bus: &MessageBus,
    ) {
        self.left.set_power(left_forward, left_duty, bus);
        self.right.set_power(right_forward, right_duty, bus);
    }

    pub fn set_speed(&mut self, left_speed: f32, right_speed: f32, bus: &MessageBus) {
        self.left.set_speed(left_speed, bus);
        self.right.set_speed(right_speed, bus);
    }

    pub fn halt(&mut self, bus: &MessageBus) {
        self.left.halt(bus);
        self.right.halt(bus);
    }

    pub fn tune(
        &mut self,
        wheels: WheelMask,
        min_speed: f32,
        max_speed: f32,
        gains: PidGains,
    ) {
        if wheels.left() {
            self.left.set_speed_range(min_speed, max_speed);
            self.left.set_gains(gains);
        }
        if wheels.right() {
            self.right.set_speed_range(min_speed, max_speed);
            self.right.set_gains(gains);
        }
    }

    /// Stall duty per wheel as a fraction of max duty.
    pub fn set_stall(&mut self, left_fraction: f32, right_fraction: f32) {
        self.left.set_stall_fraction(left_fraction);
        self.right.set_stall_fraction(right_fraction);
    }

    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    pub fn velocity(&self) -> PoseVelocity2D {
        self.velocity
    }

    pub fn left(&self) -> &DriveWheel<M, C> {
        &self.left
    }

    pub fn right(&self) -> &DriveWheel<M, C> {
        &self.right
    }

    pub fn left_mut(&mut self) -> &mut DriveWheel<M, C> {
        &mut self.left
    }

    pub fn right_mut(&mut self) -> &mut DriveWheel<M, C> {
        &mut self.right
    }

    pub fn wheelbase(&self) -> f32 {
        self.config.wheelbase
    }

    pub fn config(&self) -> &RoverConfig {
        &self.config
    }
}

impl<M: MotorOutput, C: SpeedControl> DriveBase for TwoWheelRover<M, C> {
    fn pose(&self) -> Pose2D {
        self.pose
    }

    fn wheelbase(&self) -> f32 {
        self.config.wheelbase
    }

    fn min_speed(&self) -> f32 {
        self.left.config().min_speed.max(self.right.config().min_speed)
    }

    fn max_speed(&self) -> f32 {
        self.left.config().max_speed.min(self.right.config().max_speed)
    }

    fn min_detectable_distance(&self) -> f32 {
        let per_tick = self
            .left
            .config()
            .distance_per_tick()
            .max(self.right.config().distance_per_tick());
        per_tick * self.config.min_odometry_ticks.max(1) as f32
    }

    fn set_wheel_speeds(&mut self, left: f32, right: f32, bus: &MessageBus) {
        self.set_speed(left, right, bus);
    }
}

//! Parsed rover commands and the bounded motion queue.
//!
//! Motion (tank) commands are queued and applied one per poll so they land on
//! the control loop's beat. Everything else is idempotent and executes as
//! soon as it is submitted.

use crate::behavior::GotoGoalBehavior;
use crate::bus::MessageBus;
use crate::config::PidGains;
use crate::control::SpeedControl;
use crate::hal::MotorOutput;
use crate::rover::TwoWheelRover;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crate::rover::WheelMask;

pub const COMMAND_QUEUE_CAPACITY: usize = 4;

const_assert!(COMMAND_QUEUE_CAPACITY > 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CommandError {
    #[error("command queue is full")]
    QueueFull,
    #[error("command queue is empty")]
    QueueEmpty,
}

/// Drive both wheels. Values are duty when `use_speed_control` is false and
/// speed magnitudes otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TankCommand {
    pub left_forward: bool,
    pub left_value: f32,
    pub right_forward: bool,
    pub right_value: f32,
    pub use_speed_control: bool,
}

impl TankCommand {
    pub fn power(left_forward: bool, left_duty: u16, right_forward: bool, right_duty: u16) -> Self {
        Self {
            left_forward,
            left_value: f32::from(left_duty),
            right_forward,
            right_value: f32::from(right_duty),
            use_speed_control: false,
        }
    }

    /// Signed speeds, positive forward.
    pub fn speed(left: f32, right: f32) -> Self {
        Self {
            left_forward: left >= 0.0,
            left_value: left.abs(),
            right_forward: right >= 0.0,
            right_value: right.abs(),
            use_speed_control: true,
        }
    }

    fn signed(forward: bool, value: f32) -> f32 {
        if forward {
            value
        } else {
            -value
        }
    }

    fn duty(value: f32) -> u16 {
        value.max(0.0).min(f32::from(u16::MAX)) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidCommand {
    pub wheels: WheelMask,
    pub min_speed: f32,
    pub max_speed: f32,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GotoCommand {
    pub x: f32,
    pub y: f32,
    pub tolerance: f32,
    pub point_forward: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoverCommand {
    Noop,
    Halt,
    Tank(TankCommand),
    Pid(PidCommand),
    Stall { left: f32, right: f32 },
    ResetPose,
    Goto(GotoCommand),
}

impl RoverCommand {
    pub fn is_motion(&self) -> bool {
        matches!(self, RoverCommand::Tank(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStats {
    pub submitted: u32,
    pub queued: u32,
    pub executed: u32,
    pub rejected: u32,
}

/// Bounded FIFO of motion commands plus dispatch of the rest.
pub struct CommandProcessor<const N: usize = COMMAND_QUEUE_CAPACITY> {
    queue: Deque<TankCommand, N>,
    stats: CommandStats,
}

impl<const N: usize> CommandProcessor<N> {
    pub fn new() -> Self {
        Self {
            queue: Deque::new(),
            stats: CommandStats::default(),
        }
    }

    pub fn enqueue(&mut self, command: TankCommand) -> Result<(), CommandError> {
        self.queue
            .push_back(command)
            .map_err(|_| CommandError::QueueFull)?;
        self.stats.queued = self.stats.queued.wrapping_add(1);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Result<TankCommand, CommandError> {
        self.queue.pop_front().ok_or(CommandError::QueueEmpty)
    }

    /// Queue a motion command or execute anything else immediately.
    pub fn submit<M: MotorOutput, C: SpeedControl>(
        &mut self,
        command: RoverCommand,
        rover: &mut TwoWheelRover<M, C>,
        behavior: &mut GotoGoalBehavior,
        bus: &mut MessageBus,
    ) -> Result<(), CommandError> {
        self.stats.submitted = self.stats.submitted.wrapping_add(1);

        if let RoverCommand::Tank(tank) = command {
            return self.enqueue(tank).map_err(|error| {
                self.stats.rejected = self.stats.rejected.wrapping_add(1);
                warn!(%error, "motion command rejected");
                error
            });
        }

        self.execute(command, rover, behavior, bus);
        Ok(())
    }

    /// Apply at most one queued motion command. Returns whether one ran.
    pub fn poll<M: MotorOutput, C: SpeedControl>(
        &mut self,
        rover: &mut TwoWheelRover<M, C>,
        behavior: &mut GotoGoalBehavior,
        bus: &mut MessageBus,
    ) -> bool {
        match self.dequeue() {
            Ok(tank) => {
                self.execute(RoverCommand::Tank(tank), rover, behavior, bus);
                true
            }
            Err(_) => false,
        }
    }

    fn execute<M: MotorOutput, C: SpeedControl>(
        &mut self,
        command: RoverCommand,
        rover: &mut TwoWheelRover<M, C>,
        behavior: &mut GotoGoalBehavior,
        bus: &mut MessageBus,
    ) {
        debug!(?command, "execute");
        match command {
            RoverCommand::Noop => {}
            RoverCommand::Halt => {
                self.discard_queued();
                behavior.cancel(rover, bus);
                rover.halt(bus);
                info!("halt");
            }
            RoverCommand::Tank(tank) => {
                // Manual driving takes the wheels away from the goal behaviour
                behavior.cancel(rover, bus);
                if tank.use_speed_control {
                    rover.set_speed(
                        TankCommand::signed(tank.left_forward, tank.left_value),
                        TankCommand::signed(tank.right_forward, tank.right_value),
                        bus,
                    );
                } else {
                    rover.set_power(
                        tank.left_forward,
                        TankCommand::duty(tank.left_value),
                        tank.right_forward,
                        TankCommand::duty(tank.right_value),
                        bus,
                    );
                }
            }
            RoverCommand::Pid(pid) => {
                rover.tune(
                    pid.wheels,
                    pid.min_speed,
                    pid.max_speed,
                    PidGains {
                        kp: pid.kp,
                        ki: pid.ki,
                        kd: pid.kd,
                    },
                );
                info!(wheels = ?pid.wheels, pid.kp, pid.ki, pid.kd, "speed control tuned");
            }
            RoverCommand::Stall { left, right } => {
                rover.set_stall(left, right);
                info!(left, right, "stall calibrated");
            }
            RoverCommand::ResetPose => {
                behavior.cancel(rover, bus);
                rover.reset_pose();
            }
            RoverCommand::Goto(goto) => {
                // A queued tank command would cancel the new goal
                self.discard_queued();
                behavior.goto_goal(rover, bus, goto.x, goto.y, goto.point_forward, goto.tolerance);
            }
        }
        self.stats.executed = self.stats.executed.wrapping_add(1);
    }

    fn discard_queued(&mut self) {
        if !self.queue.is_empty() {
            warn!(discarded = self.queue.len(), "queued motion discarded");
            self.queue.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }
}

impl<const N: usize> Default for CommandProcessor<N> {
    fn default() -> Self {
        Self::new()
    }
}

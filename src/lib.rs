//! # Rover Motion Core
//!
//! Motion control and navigation for a two-wheeled differential-drive rover:
//! per-wheel closed-loop speed control over optical encoders, dead-reckoning
//! odometry, a point-forward goal-seeking behaviour, a payload-free message
//! bus and a bounded motion-command queue, all stepped from one poll loop.
//!
//! ## Quick Start
//!
//! ```rust
//! use rovercore::{RoverCommand, SimConfig, Simulation, TankCommand};
//!
//! let mut sim = Simulation::new(SimConfig::default());
//! sim.submit(RoverCommand::Tank(TankCommand::speed(0.3, 0.3))).unwrap();
//! sim.run_for(1000);
//!
//! let frame = sim.telemetry();
//! assert!(frame.pose.x > 0.0);
//! ```
//!
//! ## Architecture
//!
//! - [`encoder`] - interrupt-safe edge accumulation and polled edge detection
//! - [`history`] - fixed-capacity sample ring for speed estimation
//! - [`control`] - PID and bounded-step speed laws
//! - [`wheel`] - one motor, one encoder and its speed loop
//! - [`rover`] - two wheels plus odometry
//! - [`behavior`] - go-to-goal state machine
//! - [`bus`] - synchronous publish/subscribe
//! - [`command`] - command values and the motion queue
//! - [`agent`] - top-level assembly polled by the host loop
//! - [`sim`] - simulated motors and encoders for tests and the simulator

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::new_without_default)]

pub mod agent;
pub mod behavior;
pub mod bus;
pub mod command;
pub mod config;
pub mod control;
pub mod encoder;
pub mod hal;
pub mod history;
pub mod protocol;
pub mod rover;
pub mod sim;
pub mod telemetry;
pub mod wheel;

// Re-export main public types for convenience
pub use agent::{AgentState, RoverAgent};
pub use behavior::{DriveBase, GoalAction, GoalState, GotoGoalBehavior};
pub use bus::{MessageBus, MessageKind, Publisher, Specifier, Subscriber};
pub use command::{
    CommandError, CommandProcessor, GotoCommand, PidCommand, RoverCommand, TankCommand, WheelMask,
};
pub use config::{ConfigError, ControllerKind, GoalConfig, SimConfig};
pub use control::{PidController, SpeedControl, StepController};
pub use encoder::{Direction, EdgeDetector, Encoder};
pub use rover::{Pose2D, PoseVelocity2D, TwoWheelRover};
pub use sim::Simulation;
pub use telemetry::{TelemetryFrame, TelemetryRecorder};
pub use wheel::DriveWheel;

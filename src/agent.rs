//! Top-level assembly: one bus, one rover, the goal behaviour and the command
//! processor, stepped together from a single poll.

use crate::behavior::GotoGoalBehavior;
use crate::bus::{MessageBus, MessageKind, Subscriber};
use crate::command::{CommandError, CommandProcessor, RoverCommand};
use crate::config::GoalConfig;
use crate::control::SpeedControl;
use crate::hal::MotorOutput;
use crate::rover::TwoWheelRover;
use crate::telemetry::{TelemetryEvent, TelemetryFrame, TelemetryRecorder, TELEMETRY_EVENT_CAPACITY};
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::rc::{Rc, Weak};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub running: bool,
    pub loop_count: u32,
    pub command_count: u32,
    pub telemetry_count: u32,
    pub last_poll_ms: u32,
    pub last_error: Option<CommandError>,
}

pub struct RoverAgent<M, C> {
    bus: MessageBus,
    rover: TwoWheelRover<M, C>,
    behavior: GotoGoalBehavior,
    processor: CommandProcessor,
    recorder: Rc<TelemetryRecorder>,
    state: AgentState,
}

impl<M: MotorOutput, C: SpeedControl> RoverAgent<M, C> {
    pub fn new(rover: TwoWheelRover<M, C>, goal: GoalConfig) -> Self {
        let mut bus = MessageBus::new();
        let recorder = Rc::new(TelemetryRecorder::new());
        let registration = Rc::downgrade(&recorder) as Weak<dyn Subscriber>;
        for kind in MessageKind::ALL {
            bus.subscribe(kind, registration.clone());
        }

        Self {
            bus,
            rover,
            behavior: GotoGoalBehavior::new(goal),
            processor: CommandProcessor::new(),
            recorder,
            state: AgentState::default(),
        }
    }

    /// Attach the hardware and start accepting polls.
    pub fn start(&mut self) {
        self.rover.attach();
        self.state.running = true;
        info!("rover agent started");
    }

    pub fn stop(&mut self) {
        self.behavior.cancel(&mut self.rover, &mut self.bus);
        self.rover.halt(&self.bus);
        self.rover.detach();
        self.processor.clear();
        self.state.running = false;
        info!("rover agent stopped");
    }

    /// One control-loop pass: wheels and odometry, goal behaviour, then at
    /// most one queued motion command. Returns whether a command ran.
    pub fn poll(&mut self, now_ms: u32) -> bool {
        if !self.state.running {
            return false;
        }
        self.recorder.set_time(now_ms);

        self.rover.poll(now_ms, &self.bus);
        self.behavior.poll(&mut self.rover, &mut self.bus);
        let serviced = self
            .processor
            .poll(&mut self.rover, &mut self.behavior, &mut self.bus);

        self.state.loop_count = self.state.loop_count.wrapping_add(1);
        self.state.last_poll_ms = now_ms;
        serviced
    }

    pub fn submit(&mut self, command: RoverCommand) -> Result<(), CommandError> {
        self.state.command_count = self.state.command_count.wrapping_add(1);
        let result = self
            .processor
            .submit(command, &mut self.rover, &mut self.behavior, &mut self.bus);
        if let Err(error) = result {
            warn!(%error, ?command, "command failed");
            self.state.last_error = Some(error);
        }
        result
    }

    /// Register an outside observer, e.g. a logger.
    ///
    /// # Panics
    ///
    /// When the per-kind subscriber table is already full.
    pub fn subscribe(&mut self, kind: MessageKind, subscriber: Weak<dyn Subscriber>) {
        self.bus.subscribe(kind, subscriber);
    }

    pub fn unsubscribe(&mut self, kind: MessageKind, subscriber: &Weak<dyn Subscriber>) {
        self.bus.unsubscribe(kind, subscriber);
    }

    pub fn telemetry(&mut self, now_ms: u32) -> TelemetryFrame {
        self.state.telemetry_count = self.state.telemetry_count.wrapping_add(1);
        TelemetryFrame {
            sequence_number: self.state.telemetry_count,
            timestamp_ms: now_ms,
            pose: self.rover.pose(),
            velocity: self.rover.velocity(),
            left: self.rover.left().telemetry(),
            right: self.rover.right().telemetry(),
            goal_state: self.behavior.state(),
            goal_action: self.behavior.action(),
            queued_commands: self.processor.len(),
            commands: self.processor.stats(),
        }
    }

    /// Bus events recorded since the last drain.
    pub fn drain_events(&self) -> ArrayVec<TelemetryEvent, TELEMETRY_EVENT_CAPACITY> {
        self.recorder.drain()
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn rover(&self) -> &TwoWheelRover<M, C> {
        &self.rover
    }

    pub fn rover_mut(&mut self) -> &mut TwoWheelRover<M, C> {
        &mut self.rover
    }

    pub fn behavior(&self) -> &GotoGoalBehavior {
        &self.behavior
    }

    pub fn processor(&self) -> &CommandProcessor {
        &self.processor
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn recorder(&self) -> &TelemetryRecorder {
        &self.recorder
    }
}

impl<M, C> core::fmt::Debug for RoverAgent<M, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RoverAgent")
            .field("state", &self.state)
            .field("bus", &self.bus)
            .finish()
    }
}

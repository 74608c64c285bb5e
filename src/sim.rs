//! Deterministic closed-loop simulation.
//!
//! Each wheel is a first-order motor model driven by the duty the core
//! writes through [`SimMotor`]. As the simulated wheel turns it emits encoder
//! edges, either straight into the [`Encoder`] like an interrupt handler
//! would or as level changes on a [`SimInput`] sampled by an
//! [`EdgeDetector`]. Time advances in 1 ms substeps and the agent is polled
//! on every substep.

use crate::agent::RoverAgent;
use crate::bus::Specifier;
use crate::command::{CommandError, RoverCommand};
use crate::config::{ControllerKind, PlantConfig, SimConfig};
use crate::control::{PidController, SpeedControl, StepController};
use crate::encoder::{EdgeDetector, Encoder};
use crate::hal::{DigitalInput, MotorOutput};
use crate::rover::TwoWheelRover;
use crate::telemetry::TelemetryFrame;
use crate::wheel::DriveWheel;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

pub const SUBSTEP_MS: u32 = 1;

pub type SimController = Box<dyn SpeedControl>;
pub type SimAgent = RoverAgent<SimMotor, SimController>;

/// What the H-bridge is currently told to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorDrive {
    pub attached: bool,
    pub forward: bool,
    pub duty: u16,
}

/// Motor port writing into a drive cell shared with a [`WheelPlant`].
pub struct SimMotor {
    drive: Rc<Cell<MotorDrive>>,
}

impl SimMotor {
    pub fn new(drive: Rc<Cell<MotorDrive>>) -> Self {
        Self { drive }
    }

    pub fn drive(&self) -> MotorDrive {
        self.drive.get()
    }
}

impl MotorOutput for SimMotor {
    fn attach(&mut self) {
        let mut drive = self.drive.get();
        drive.attached = true;
        self.drive.set(drive);
    }

    fn detach(&mut self) {
        self.drive.set(MotorDrive::default());
    }

    fn is_attached(&self) -> bool {
        self.drive.get().attached
    }

    fn write_duty(&mut self, forward: bool, duty: u16) {
        let mut drive = self.drive.get();
        if !drive.attached {
            return;
        }
        drive.forward = forward;
        drive.duty = duty;
        self.drive.set(drive);
    }
}

/// Encoder pin whose level is toggled by a [`WheelPlant`].
pub struct SimInput {
    level: Rc<Cell<bool>>,
    attached: bool,
}

impl SimInput {
    pub fn new(level: Rc<Cell<bool>>) -> Self {
        Self {
            level,
            attached: false,
        }
    }
}

impl DigitalInput for SimInput {
    fn attach(&mut self) {
        self.attached = true;
    }

    fn detach(&mut self) {
        self.attached = false;
    }

    fn read(&mut self) -> bool {
        self.attached && self.level.get()
    }
}

/// How plant edges reach the encoder.
pub enum EncoderFeed {
    Interrupt(Arc<Encoder>),
    Polled(Rc<Cell<bool>>),
}

pub struct WheelPlant {
    config: PlantConfig,
    gain: f32,
    distance_per_tick: f32,
    drive: Rc<Cell<MotorDrive>>,
    feed: EncoderFeed,

    speed: f32,
    position: f32,
    since_edge: f32,
    edges: u32,
}

impl WheelPlant {
    pub fn new(
        config: PlantConfig,
        gain: f32,
        distance_per_tick: f32,
        drive: Rc<Cell<MotorDrive>>,
        feed: EncoderFeed,
    ) -> Self {
        Self {
            config,
            gain,
            distance_per_tick,
            drive,
            feed,
            speed: 0.0,
            position: 0.0,
            since_edge: 0.0,
            edges: 0,
        }
    }

    /// Steady-state ground speed for the current drive.
    pub fn commanded_speed(&self) -> f32 {
        let drive = self.drive.get();
        let stall = f32::from(self.config.stall_duty);
        let max = f32::from(self.config.max_duty);
        if !drive.attached || f32::from(drive.duty) <= stall || max <= stall {
            return 0.0;
        }
        let fraction = ((f32::from(drive.duty) - stall) / (max - stall)).min(1.0);
        let speed = self.config.top_speed * self.gain * fraction;
        if drive.forward {
            speed
        } else {
            -speed
        }
    }

    /// Advance by `dt_ms`, emitting any edges crossed.
    pub fn step(&mut self, now_ms: u32, dt_ms: f32) {
        let target = self.commanded_speed();
        let alpha = dt_ms / (self.config.time_constant_ms + dt_ms);
        self.speed += (target - self.speed) * alpha;

        let delta = self.speed * dt_ms / 1000.0;
        self.position += delta;
        self.since_edge += delta.abs();

        if self.distance_per_tick <= 0.0 {
            return;
        }
        while self.since_edge >= self.distance_per_tick {
            self.since_edge -= self.distance_per_tick;
            self.edges = self.edges.wrapping_add(1);
            match &self.feed {
                EncoderFeed::Interrupt(encoder) => encoder.encode(now_ms),
                EncoderFeed::Polled(level) => level.set(!level.get()),
            }
        }
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Signed ground distance actually covered.
    pub fn position(&self) -> f32 {
        self.position
    }

    pub fn edges(&self) -> u32 {
        self.edges
    }
}

pub fn controller(config: &SimConfig) -> SimController {
    let stall = f32::from(config.wheel.stall_duty);
    let max = f32::from(config.wheel.max_duty);
    match config.controller {
        ControllerKind::Pid => Box::new(PidController::new(config.gains, stall, max)),
        ControllerKind::Step => Box::new(StepController::new(config.step, stall, max)),
    }
}

pub struct Simulation {
    config: SimConfig,
    agent: SimAgent,
    left: WheelPlant,
    right: WheelPlant,
    detectors: Option<(EdgeDetector<SimInput>, EdgeDetector<SimInput>)>,
    now_ms: u32,
}

impl Simulation {
    /// Interrupt-style encoders.
    pub fn new(config: SimConfig) -> Self {
        Self::build(config, false)
    }

    /// Encoders sampled by an edge detector every substep.
    pub fn with_polled_encoders(config: SimConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: SimConfig, polled: bool) -> Self {
        let per_tick = config.wheel.distance_per_tick();

        let wire = |specifier: Specifier, gain: f32| {
            let drive = Rc::new(Cell::new(MotorDrive::default()));
            let encoder = Arc::new(Encoder::new());
            let (feed, detector) = if polled {
                let level = Rc::new(Cell::new(false));
                let detector = EdgeDetector::new(SimInput::new(level.clone()), encoder.clone());
                (EncoderFeed::Polled(level), Some(detector))
            } else {
                (EncoderFeed::Interrupt(encoder.clone()), None)
            };
            let plant = WheelPlant::new(config.plant, gain, per_tick, drive.clone(), feed);
            let wheel = DriveWheel::new(
                specifier,
                SimMotor::new(drive),
                encoder,
                controller(&config),
                config.wheel,
            );
            (wheel, plant, detector)
        };

        let (left_wheel, left, left_detector) = wire(Specifier::LeftWheel, config.plant.left_gain);
        let (right_wheel, right, right_detector) =
            wire(Specifier::RightWheel, config.plant.right_gain);

        let mut detectors = left_detector.zip(right_detector);
        if let Some((left_detector, right_detector)) = detectors.as_mut() {
            left_detector.attach();
            right_detector.attach();
        }

        let rover = TwoWheelRover::new(left_wheel, right_wheel, config.rover);
        let mut agent = RoverAgent::new(rover, config.goal);
        agent.start();
        debug!(polled, "simulation built");

        Self {
            config,
            agent,
            left,
            right,
            detectors,
            now_ms: 0,
        }
    }

    /// Advance one substep and poll the agent. Returns whether a queued
    /// command was serviced.
    pub fn step(&mut self) -> bool {
        self.now_ms = self.now_ms.wrapping_add(SUBSTEP_MS);
        let dt_ms = SUBSTEP_MS as f32;
        self.left.step(self.now_ms, dt_ms);
        self.right.step(self.now_ms, dt_ms);

        if let Some((left, right)) = self.detectors.as_mut() {
            left.poll(self.now_ms);
            right.poll(self.now_ms);
        }

        self.agent.poll(self.now_ms)
    }

    pub fn run_for(&mut self, duration_ms: u32) {
        for _ in 0..duration_ms / SUBSTEP_MS {
            self.step();
        }
    }

    /// Step until `done` holds or `limit_ms` passes. Returns whether `done`
    /// was reached.
    pub fn run_until(&mut self, limit_ms: u32, mut done: impl FnMut(&SimAgent) -> bool) -> bool {
        for _ in 0..limit_ms / SUBSTEP_MS {
            self.step();
            if done(&self.agent) {
                return true;
            }
        }
        false
    }

    pub fn submit(&mut self, command: RoverCommand) -> Result<(), CommandError> {
        self.agent.submit(command)
    }

    pub fn telemetry(&mut self) -> TelemetryFrame {
        let now_ms = self.now_ms;
        self.agent.telemetry(now_ms)
    }

    pub fn now_ms(&self) -> u32 {
        self.now_ms
    }

    pub fn agent(&self) -> &SimAgent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut SimAgent {
        &mut self.agent
    }

    pub fn left_plant(&self) -> &WheelPlant {
        &self.left
    }

    pub fn right_plant(&self) -> &WheelPlant {
        &self.right
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn is_polled(&self) -> bool {
        self.detectors.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plant(feed: EncoderFeed) -> (WheelPlant, Rc<Cell<MotorDrive>>) {
        let drive = Rc::new(Cell::new(MotorDrive::default()));
        let plant = WheelPlant::new(PlantConfig::default(), 1.0, 0.01, drive.clone(), feed);
        (plant, drive)
    }

    #[test]
    fn test_plant_stalls_below_stall_duty() {
        let (mut plant, drive) = plant(EncoderFeed::Polled(Rc::new(Cell::new(false))));
        let mut motor = SimMotor::new(drive);
        motor.attach();
        motor.write_duty(true, PlantConfig::default().stall_duty);
        for now in 0..500 {
            plant.step(now, 1.0);
        }
        assert_eq!(plant.speed(), 0.0);
        assert_eq!(plant.edges(), 0);
    }

    #[test]
    fn test_plant_reaches_top_speed() {
        let encoder = Arc::new(Encoder::new());
        encoder.attach();
        let (mut plant, drive) = plant(EncoderFeed::Interrupt(encoder.clone()));
        let mut motor = SimMotor::new(drive);
        motor.attach();
        motor.write_duty(true, 255);
        for now in 0..1000 {
            plant.step(now, 1.0);
        }
        assert!((plant.speed() - 0.7).abs() < 0.01);
        assert_eq!(encoder.ticks(), plant.edges());
    }

    #[test]
    fn test_detached_motor_ignores_duty() {
        let drive = Rc::new(Cell::new(MotorDrive::default()));
        let mut motor = SimMotor::new(drive);
        motor.write_duty(true, 200);
        assert_eq!(motor.drive().duty, 0);
    }

    #[test]
    fn test_sim_input_reads_low_when_detached() {
        let level = Rc::new(Cell::new(true));
        let mut input = SimInput::new(level);
        assert!(!input.read());
        input.attach();
        assert!(input.read());
    }

    #[test]
    fn test_controller_follows_config() {
        let mut config = SimConfig::default();
        config.controller = ControllerKind::Step;
        let mut step = controller(&config);
        // Step law starts from stall
        assert_eq!(step.update(0.3, 0.0, 0), f32::from(config.wheel.stall_duty));
    }
}

use crate::bus::{MessageBus, MessageKind, Publisher, Specifier};
use crate::config::{PidGains, WheelConfig};
use crate::control::SpeedControl;
use crate::encoder::{Direction, Encoder};
use crate::hal::MotorOutput;
use crate::history::{sample_velocity, HistorySample, RingHistory, WHEEL_HISTORY_CAPACITY};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// A target change larger than this share of the speed range re-seeds duty
const RESEED_STEP_FRACTION: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WheelTelemetry {
    pub duty: u16,
    pub direction: Direction,
    pub speed_control: bool,
    pub target_speed: f32,
    pub speed: f32,
    pub distance: f32,
    pub ticks: u32,
}

/// One motor, one encoder and the speed loop tying them together.
pub struct DriveWheel<M, C> {
    specifier: Specifier,
    motor: M,
    encoder: Arc<Encoder>,
    controller: C,
    config: WheelConfig,
    history: RingHistory<HistorySample, WHEEL_HISTORY_CAPACITY>,

    attached: bool,
    use_speed_control: bool,
    target_speed: f32,
    direction: Direction,
    duty: u16,
    speed: f32,

    now_ms: u32,
    last_poll_ms: u32,
    last_poll_ticks: u32,
}

impl<M: MotorOutput, C: SpeedControl> DriveWheel<M, C> {
    pub fn new(
        specifier: Specifier,
        motor: M,
        encoder: Arc<Encoder>,
        mut controller: C,
        config: WheelConfig,
    ) -> Self {
        controller.set_output_range(f32::from(config.stall_duty), f32::from(config.max_duty));
        Self {
            specifier,
            motor,
            encoder,
            controller,
            config,
            history: RingHistory::new(HistorySample::default()),
            attached: false,
            use_speed_control: false,
            target_speed: 0.0,
            direction: Direction::Stopped,
            duty: 0,
            speed: 0.0,
            now_ms: 0,
            last_poll_ms: 0,
            last_poll_ticks: 0,
        }
    }

    pub fn attach(&mut self) {
        if self.attached {
            return;
        }
        self.motor.attach();
        self.encoder.attach();
        self.encoder.set_direction(Direction::Stopped);
        self.motor.write_duty(true, 0);

        self.attached = true;
        self.use_speed_control = false;
        self.target_speed = 0.0;
        self.direction = Direction::Stopped;
        self.duty = 0;
        self.speed = 0.0;
        self.history.clear();
        self.controller.reset();
        self.last_poll_ms = self.now_ms;
        self.last_poll_ticks = 0;
    }

    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.motor.write_duty(true, 0);
        self.motor.detach();
        self.encoder.detach();
        self.attached = false;
        self.use_speed_control = false;
        self.target_speed = 0.0;
        self.direction = Direction::Stopped;
        self.duty = 0;
        self.speed = 0.0;
        self.history.clear();
        self.controller.reset();
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Open-loop drive. Disengages speed control.
    pub fn set_power(&mut self, forward: bool, duty: u16, bus: &MessageBus) {
        if !self.attached {
            return;
        }
        self.use_speed_control = false;
        self.target_speed = 0.0;
        self.controller.reset();

        let direction = if duty == 0 {
            Direction::Stopped
        } else if forward {
            Direction::Forward
        } else {
            Direction::Reverse
        };
        self.write(direction, duty, bus);
    }

    /// Closed-loop drive at a signed target speed.
    pub fn set_speed(&mut self, target_speed: f32, bus: &MessageBus) {
        if !self.attached {
            return;
        }

        let was_engaged = self.use_speed_control;
        let previous_target = self.target_speed;
        self.use_speed_control = true;
        self.target_speed = target_speed;

        let direction = Direction::of(target_speed);
        if direction == Direction::Stopped {
            self.controller.reset();
            self.write(Direction::Stopped, 0, bus);
            bus.publish(Publisher::DriveWheel, MessageKind::TargetSpeed, self.specifier);
            return;
        }

        // Stale samples from the other direction would poison the estimate
        if self.direction.is_moving() && self.direction != direction {
            self.history.truncate_to(1);
        }

        let range = self.config.max_speed - self.config.min_speed;
        let large_step = (target_speed - previous_target).abs() > range * RESEED_STEP_FRACTION;
        let reversing = Direction::of(previous_target) != direction;
        if !was_engaged || self.duty == 0 || reversing || large_step {
            let duty = self.feed_forward(target_speed.abs());
            debug!(
                wheel = ?self.specifier,
                target_speed,
                duty,
                "seeding speed control"
            );
            self.controller.seed(duty);
            self.write(direction, duty.round() as u16, bus);
        } else if direction != self.direction {
            self.write(direction, self.duty, bus);
        }

        if !was_engaged || previous_target != target_speed {
            bus.publish(Publisher::DriveWheel, MessageKind::TargetSpeed, self.specifier);
        }
    }

    /// Stop and disengage everything.
    pub fn halt(&mut self, bus: &MessageBus) {
        if !self.attached {
            return;
        }
        self.use_speed_control = false;
        self.target_speed = 0.0;
        self.speed = 0.0;
        self.history.clear();
        self.controller.reset();
        self.write(Direction::Stopped, 0, bus);
        bus.publish(Publisher::DriveWheel, MessageKind::WheelHalt, self.specifier);
    }

    /// Run one speed-loop step. Returns `true` when a new speed sample was
    /// taken.
    pub fn poll(&mut self, now_ms: u32, bus: &MessageBus) -> bool {
        self.now_ms = now_ms;
        if !self.attached {
            return false;
        }
        self.encoder.expire_settle(now_ms);

        let elapsed = now_ms.wrapping_sub(self.last_poll_ms);
        if elapsed < self.config.poll_interval_ms {
            return false;
        }

        let ticks = self.encoder.ticks();
        let new_ticks = ticks.wrapping_sub(self.last_poll_ticks);
        if new_ticks < self.config.min_poll_ticks && elapsed < self.config.max_sample_ms {
            return false;
        }
        self.last_poll_ms = now_ms;
        self.last_poll_ticks = ticks;

        self.history.push(HistorySample {
            timestamp_ms: now_ms,
            distance: self.distance(),
        });
        self.speed = sample_velocity(&self.history);

        if self.use_speed_control && self.direction_of_target().is_moving() {
            let duty = self
                .controller
                .update(self.target_speed.abs(), self.speed.abs(), now_ms);
            self.write(self.direction_of_target(), duty.round() as u16, bus);
        }

        bus.publish(Publisher::DriveWheel, MessageKind::SpeedControl, self.specifier);
        true
    }

    pub fn set_speed_range(&mut self, min_speed: f32, max_speed: f32) {
        self.config.min_speed = min_speed.max(0.0);
        self.config.max_speed = max_speed.max(self.config.min_speed);
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.controller.set_gains(gains);
    }

    /// Stall duty as a fraction of max duty.
    pub fn set_stall_fraction(&mut self, fraction: f32) {
        let fraction = fraction.max(0.0).min(1.0);
        self.config.stall_duty = (fraction * f32::from(self.config.max_duty)).round() as u16;
        self.controller
            .set_output_range(f32::from(self.config.stall_duty), f32::from(self.config.max_duty));
    }

    /// Linear map from `[min_speed, max_speed]` to `[stall, max_duty]`.
    pub fn feed_forward(&self, speed: f32) -> f32 {
        let stall = f32::from(self.config.stall_duty);
        let max = f32::from(self.config.max_duty);
        let range = self.config.max_speed - self.config.min_speed;
        if range <= 0.0 {
            return stall;
        }
        let fraction = ((speed - self.config.min_speed) / range).max(0.0).min(1.0);
        stall + fraction * (max - stall)
    }

    fn direction_of_target(&self) -> Direction {
        Direction::of(self.target_speed)
    }

    fn write(&mut self, direction: Direction, duty: u16, bus: &MessageBus) {
        let duty = duty.min(self.config.max_duty);
        let direction = if duty == 0 { Direction::Stopped } else { direction };
        if direction == self.direction && duty == self.duty {
            return;
        }

        if direction == Direction::Stopped {
            // Keep counting the coast-down in the old direction
            self.encoder.settle(self.now_ms, self.config.settle_ms);
        }
        self.encoder.set_direction(direction);
        self.motor.write_duty(direction != Direction::Reverse, duty);

        self.direction = direction;
        self.duty = duty;
        bus.publish(Publisher::DriveWheel, MessageKind::WheelPower, self.specifier);
    }

    pub fn specifier(&self) -> Specifier {
        self.specifier
    }

    pub fn duty(&self) -> u16 {
        self.duty
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn target_speed(&self) -> f32 {
        self.target_speed
    }

    pub fn is_speed_control(&self) -> bool {
        self.use_speed_control
    }

    /// Last measured signed speed.
    pub fn speed(&self) -> f32 {
        if !self.attached {
            return 0.0;
        }
        self.speed
    }

    /// Signed distance travelled since attach.
    pub fn distance(&self) -> f32 {
        self.encoder.count() as f32 * self.config.distance_per_tick()
    }

    pub fn ticks(&self) -> u32 {
        self.encoder.ticks()
    }

    pub fn count(&self) -> i32 {
        self.encoder.count()
    }

    pub fn stall_duty(&self) -> u16 {
        self.config.stall_duty
    }

    pub fn config(&self) -> &WheelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.encoder
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn motor(&self) -> &M {
        &self.motor
    }

    pub fn telemetry(&self) -> WheelTelemetry {
        WheelTelemetry {
            duty: self.duty,
            direction: self.direction,
            speed_control: self.use_speed_control,
            target_speed: self.target_speed,
            speed: self.speed(),
            distance: self.distance(),
            ticks: self.ticks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscriber;
    use crate::control::PidController;
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};

    #[derive(Default)]
    struct RecordingMotor {
        attached: bool,
        writes: std::vec::Vec<(bool, u16)>,
    }

    impl MotorOutput for RecordingMotor {
        fn attach(&mut self) {
            self.attached = true;
        }

        fn detach(&mut self) {
            self.attached = false;
        }

        fn is_attached(&self) -> bool {
            self.attached
        }

        fn write_duty(&mut self, forward: bool, duty: u16) {
            self.writes.push((forward, duty));
        }
    }

    #[derive(Default)]
    struct Events {
        seen: RefCell<std::vec::Vec<MessageKind>>,
    }

    impl Subscriber for Events {
        fn on_message(&self, _publisher: Publisher, kind: MessageKind, _specifier: Specifier) {
            self.seen.borrow_mut().push(kind);
        }
    }

    fn listening_bus(events: &Rc<Events>) -> MessageBus {
        let mut bus = MessageBus::new();
        for kind in MessageKind::ALL {
            bus.subscribe(kind, Rc::downgrade(events) as Weak<dyn Subscriber>);
        }
        bus
    }

    fn wheel() -> DriveWheel<RecordingMotor, PidController> {
        let config = WheelConfig::default();
        let controller = PidController::new(PidGains::default(), 0.0, 255.0);
        DriveWheel::new(
            Specifier::LeftWheel,
            RecordingMotor::default(),
            Arc::new(Encoder::new()),
            controller,
            config,
        )
    }

    #[test]
    fn test_unattached_wheel_is_neutral() {
        let bus = MessageBus::new();
        let mut wheel = wheel();
        wheel.set_power(true, 200, &bus);
        wheel.set_speed(0.3, &bus);
        assert!(!wheel.poll(1000, &bus));
        assert_eq!(wheel.duty(), 0);
        assert_eq!(wheel.speed(), 0.0);
        assert_eq!(wheel.distance(), 0.0);
        assert!(wheel.motor().writes.is_empty());
    }

    #[test]
    fn test_set_power_bounds_duty_and_publishes() {
        let events = Rc::new(Events::default());
        let bus = listening_bus(&events);
        let mut wheel = wheel();
        wheel.attach();

        wheel.set_power(false, 900, &bus);
        assert_eq!(wheel.duty(), 255);
        assert_eq!(wheel.direction(), Direction::Reverse);
        assert_eq!(wheel.encoder().direction(), Direction::Reverse);
        assert_eq!(wheel.motor().writes.last(), Some(&(false, 255)));
        assert_eq!(events.seen.borrow().as_slice(), &[MessageKind::WheelPower]);

        // Same output again publishes nothing
        wheel.set_power(false, 255, &bus);
        assert_eq!(events.seen.borrow().len(), 1);
    }

    #[test]
    fn test_set_speed_seeds_feed_forward() {
        let events = Rc::new(Events::default());
        let bus = listening_bus(&events);
        let mut wheel = wheel();
        wheel.attach();

        // Midpoint of the speed range maps to the midpoint of [stall, max]
        wheel.set_speed_range(0.0, 1.0);
        let config = *wheel.config();
        let mid_speed = 0.5;
        wheel.set_speed(mid_speed, &bus);

        let expected = (f32::from(config.stall_duty) + f32::from(config.max_duty)) / 2.0;
        assert_eq!(wheel.duty(), expected.round() as u16);
        assert!(wheel.is_speed_control());
        assert_eq!(wheel.direction(), Direction::Forward);
        assert!(events.seen.borrow().contains(&MessageKind::TargetSpeed));
        assert!(events.seen.borrow().contains(&MessageKind::WheelPower));

        // Reversal re-seeds in the new direction
        wheel.set_speed(-mid_speed, &bus);
        assert_eq!(wheel.direction(), Direction::Reverse);
        assert_eq!(wheel.duty(), expected.round() as u16);
    }

    #[test]
    fn test_feed_forward_is_bounded() {
        let wheel = wheel();
        let config = *wheel.config();
        assert_eq!(wheel.feed_forward(0.0), f32::from(config.stall_duty));
        assert_eq!(wheel.feed_forward(10.0), f32::from(config.max_duty));
    }

    #[test]
    fn test_poll_waits_for_interval_and_ticks() {
        let events = Rc::new(Events::default());
        let bus = listening_bus(&events);
        let mut wheel = wheel();
        wheel.attach();
        wheel.set_power(true, 200, &bus);

        // Interval not yet elapsed
        assert!(!wheel.poll(10, &bus));

        // Interval elapsed but too few edges
        wheel.encoder().encode(40);
        assert!(!wheel.poll(60, &bus));

        wheel.encoder().encode(70);
        assert!(wheel.poll(80, &bus));
        assert_eq!(events.seen.borrow().last(), Some(&MessageKind::SpeedControl));

        // Stalled: samples anyway once max_sample_ms has passed
        let max_sample = wheel.config().max_sample_ms;
        assert!(wheel.poll(80 + max_sample, &bus));
    }

    #[test]
    fn test_poll_measures_speed() {
        let bus = MessageBus::new();
        let mut wheel = wheel();
        wheel.attach();
        wheel.set_power(true, 200, &bus);

        let per_tick = wheel.config().distance_per_tick();
        let mut now = 0;
        for _ in 0..6 {
            now += 50;
            for _ in 0..4 {
                wheel.encoder().encode(now);
            }
            assert!(wheel.poll(now, &bus));
        }
        // 4 edges every 50 ms
        let expected = 4.0 * per_tick * 1000.0 / 50.0;
        assert!((wheel.speed() - expected).abs() < 1e-4);
        assert!((wheel.distance() - 24.0 * per_tick).abs() < 1e-5);
    }

    #[test]
    fn test_speed_loop_raises_duty_when_slow() {
        let bus = MessageBus::new();
        let mut wheel = wheel();
        wheel.attach();
        wheel.set_speed(0.3, &bus);
        let seeded = wheel.duty();

        // Wheel barely moves: one edge per poll, below target
        let mut now = 0;
        for _ in 0..5 {
            now += 50;
            wheel.encoder().encode(now);
            wheel.encoder().encode(now);
            wheel.poll(now, &bus);
        }
        assert!(wheel.speed() < 0.3);
        assert!(wheel.duty() > seeded);
    }

    #[test]
    fn test_halt_disengages_and_publishes() {
        let events = Rc::new(Events::default());
        let bus = listening_bus(&events);
        let mut wheel = wheel();
        wheel.attach();
        wheel.set_speed(0.4, &bus);
        wheel.halt(&bus);

        assert!(!wheel.is_speed_control());
        assert_eq!(wheel.duty(), 0);
        assert_eq!(wheel.direction(), Direction::Stopped);
        assert_eq!(events.seen.borrow().last(), Some(&MessageKind::WheelHalt));
        assert_eq!(wheel.motor().writes.last(), Some(&(true, 0)));
    }

    #[test]
    fn test_stop_arms_settle_window() {
        let bus = MessageBus::new();
        let mut wheel = wheel();
        wheel.attach();
        wheel.set_power(true, 200, &bus);
        wheel.poll(0, &bus);
        wheel.set_power(true, 0, &bus);

        // Coasting edges still count forward
        wheel.encoder().encode(10);
        assert_eq!(wheel.count(), 1);
    }

    #[test]
    fn test_poll_expires_settle_window() {
        let bus = MessageBus::new();
        let mut wheel = wheel();
        wheel.attach();
        wheel.set_power(true, 200, &bus);
        wheel.poll(0, &bus);
        wheel.set_power(true, 0, &bus);

        wheel.poll(wheel.config().settle_ms + 10, &bus);
        let wrapped = wheel.config().settle_ms.wrapping_add(1 << 31);
        wheel.encoder().encode(wrapped);
        assert_eq!(wheel.count(), 0);
        assert_eq!(wheel.ticks(), 1);
    }

    #[test]
    fn test_stall_fraction_updates_controller_range() {
        let bus = MessageBus::new();
        let mut wheel = wheel();
        wheel.attach();
        wheel.set_stall_fraction(0.8);
        assert_eq!(wheel.stall_duty(), 204);

        wheel.set_speed(0.01, &bus);
        assert_eq!(wheel.duty(), 204);
    }
}

//! Hardware port traits consumed by the control core.
//!
//! Pin configuration, PWM generation and interrupt wiring live behind these
//! traits; the core only ever sees attach/detach and a duty value or a logic
//! level. Platform crates implement them over their HAL, the [`sim`](crate::sim)
//! module implements them over a simulated plant.

/// A single H-bridge channel driving one wheel motor.
pub trait MotorOutput {
    fn attach(&mut self);
    fn detach(&mut self);
    fn is_attached(&self) -> bool;

    /// Drive the motor at `duty` in `[0, resolution max]`.
    ///
    /// A zero duty coasts the motor regardless of `forward`.
    fn write_duty(&mut self, forward: bool, duty: u16);
}

/// A digital input pin feeding an optical encoder.
pub trait DigitalInput {
    fn attach(&mut self);
    fn detach(&mut self);
    fn read(&mut self) -> bool;
}

/// Monotonic millisecond clock. Wraps at `u32::MAX`; callers compare times
/// with `wrapping_sub`.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Milliseconds since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// `true` while `now` has not yet reached `deadline`, tolerant of wrap.
pub fn before(now_ms: u32, deadline_ms: u32) -> bool {
    (now_ms.wrapping_sub(deadline_ms) as i32) < 0
}

//! Closed-loop wheel speed control laws.
//!
//! Both laws map an absolute measured speed to a motor duty in
//! `[stall, max]`. Direction is the caller's business.

use crate::config::{PidGains, StepConfig};

pub trait SpeedControl {
    /// Advance the law and return the duty to apply.
    fn update(&mut self, target_speed: f32, current_speed: f32, now_ms: u32) -> f32;

    /// Start from `duty` instead of from the current state, e.g. a
    /// feed-forward estimate.
    fn seed(&mut self, duty: f32);

    fn reset(&mut self);

    fn set_output_range(&mut self, min: f32, max: f32);

    fn set_gains(&mut self, _gains: PidGains) {}

    fn output(&self) -> f32;
}

impl<T: SpeedControl + ?Sized> SpeedControl for Box<T> {
    fn update(&mut self, target_speed: f32, current_speed: f32, now_ms: u32) -> f32 {
        (**self).update(target_speed, current_speed, now_ms)
    }

    fn seed(&mut self, duty: f32) {
        (**self).seed(duty);
    }

    fn reset(&mut self) {
        (**self).reset();
    }

    fn set_output_range(&mut self, min: f32, max: f32) {
        (**self).set_output_range(min, max);
    }

    fn set_gains(&mut self, gains: PidGains) {
        (**self).set_gains(gains);
    }

    fn output(&self) -> f32 {
        (**self).output()
    }
}

fn bound(value: f32, min: f32, max: f32) -> f32 {
    value.max(min).min(max)
}

/// PID on `target - |current|` around a seeded feed-forward bias.
#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    output_min: f32,
    output_max: f32,
    bias: f32,
    integral: f32,
    last_error: Option<f32>,
    last_ms: Option<u32>,
    output: f32,
}

impl PidController {
    pub fn new(gains: PidGains, output_min: f32, output_max: f32) -> Self {
        let mut controller = Self {
            gains,
            output_min: 0.0,
            output_max: 0.0,
            bias: 0.0,
            integral: 0.0,
            last_error: None,
            last_ms: None,
            output: 0.0,
        };
        controller.set_output_range(output_min, output_max);
        controller
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn bias(&self) -> f32 {
        self.bias
    }
}

impl SpeedControl for PidController {
    fn update(&mut self, target_speed: f32, current_speed: f32, now_ms: u32) -> f32 {
        let error = target_speed - current_speed.abs();
        let dt_s = self
            .last_ms
            .map_or(0.0, |last| now_ms.wrapping_sub(last) as f32 / 1000.0);

        // Overshot through zero error: drop the accumulated integral
        if let Some(previous) = self.last_error {
            if previous * error < 0.0 {
                self.integral = 0.0;
            }
        }

        self.integral += error * dt_s;

        let derivative = match self.last_error {
            Some(previous) if dt_s > 0.0 => (error - previous) / dt_s,
            _ => 0.0,
        };

        let raw = self.bias
            + self.gains.kp * error
            + self.gains.ki * self.integral
            + self.gains.kd * derivative;

        self.output = bound(raw, self.output_min, self.output_max);
        self.last_error = Some(error);
        self.last_ms = Some(now_ms);
        self.output
    }

    fn seed(&mut self, duty: f32) {
        self.bias = bound(duty, self.output_min, self.output_max);
        self.output = self.bias;
        self.integral = 0.0;
        self.last_error = None;
    }

    fn reset(&mut self) {
        self.bias = 0.0;
        self.integral = 0.0;
        self.last_error = None;
        self.last_ms = None;
        self.output = 0.0;
    }

    fn set_output_range(&mut self, min: f32, max: f32) {
        self.output_min = min.min(max);
        self.output_max = max.max(min);
        self.bias = bound(self.bias, self.output_min, self.output_max);
    }

    fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
        self.integral = 0.0;
    }

    fn output(&self) -> f32 {
        self.output
    }
}

/// Bounded-increment law: at most one fixed step per interval.
#[derive(Debug, Clone)]
pub struct StepController {
    step: f32,
    interval_ms: u32,
    output_min: f32,
    output_max: f32,
    output: f32,
    last_ms: Option<u32>,
}

impl StepController {
    /// `output_min` doubles as the stall duty.
    pub fn new(config: StepConfig, output_min: f32, output_max: f32) -> Self {
        let mut controller = Self {
            step: config.step.abs(),
            interval_ms: config.interval_ms,
            output_min: 0.0,
            output_max: 0.0,
            output: 0.0,
            last_ms: None,
        };
        controller.set_output_range(output_min, output_max);
        controller
    }

    pub fn stall(&self) -> f32 {
        self.output_min
    }
}

impl SpeedControl for StepController {
    fn update(&mut self, target_speed: f32, current_speed: f32, now_ms: u32) -> f32 {
        if let Some(last) = self.last_ms {
            if now_ms.wrapping_sub(last) < self.interval_ms {
                return self.output;
            }
        }
        self.last_ms = Some(now_ms);

        // Sub-stall duty produces no motion; start from stall
        if self.output < self.output_min {
            self.output = self.output_min;
            return self.output;
        }

        let current_speed = current_speed.abs();
        if current_speed < target_speed {
            self.output += self.step;
        } else if current_speed > target_speed {
            self.output -= self.step;
        }
        self.output = bound(self.output, self.output_min, self.output_max);
        self.output
    }

    fn seed(&mut self, duty: f32) {
        self.output = bound(duty, self.output_min, self.output_max);
    }

    fn reset(&mut self) {
        self.output = 0.0;
        self.last_ms = None;
    }

    fn set_output_range(&mut self, min: f32, max: f32) {
        self.output_min = min.min(max);
        self.output_max = max.max(min);
        if self.output > 0.0 {
            self.output = bound(self.output, self.output_min, self.output_max);
        }
    }

    fn output(&self) -> f32 {
        self.output
    }
}

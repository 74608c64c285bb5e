use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// Wheel hardware: 65 mm wheel, 20-slot optical disc read on both edges
const WHEEL_CIRCUMFERENCE_M: f32 = 0.2042;
const WHEEL_EDGES_PER_REV: u32 = 40;
const PWM_RESOLUTION_MAX: u16 = 255;
const DEFAULT_STALL_DUTY: u16 = 130;

const WHEEL_POLL_INTERVAL_MS: u32 = 50;
const ODOMETRY_INTERVAL_MS: u32 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 80.0,
            ki: 160.0,
            kd: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Duty change per step.
    pub step: f32,
    pub interval_ms: u32,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            step: 4.0,
            interval_ms: WHEEL_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerKind {
    Pid,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelConfig {
    /// Distance per wheel revolution, in the rover's distance unit.
    pub circumference: f32,
    /// Encoder edges per wheel revolution.
    pub pulses_per_revolution: u32,
    pub min_speed: f32,
    pub max_speed: f32,
    pub stall_duty: u16,
    pub max_duty: u16,
    pub poll_interval_ms: u32,
    /// Edges required before a speed sample is taken.
    pub min_poll_ticks: u32,
    /// Sample anyway after this long so a stalled wheel reads zero.
    pub max_sample_ms: u32,
    /// Coast-down window after power drops to zero.
    pub settle_ms: u32,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            circumference: WHEEL_CIRCUMFERENCE_M,
            pulses_per_revolution: WHEEL_EDGES_PER_REV,
            min_speed: 0.1,
            max_speed: 0.6,
            stall_duty: DEFAULT_STALL_DUTY,
            max_duty: PWM_RESOLUTION_MAX,
            poll_interval_ms: WHEEL_POLL_INTERVAL_MS,
            min_poll_ticks: 2,
            max_sample_ms: 200,
            settle_ms: 150,
        }
    }
}

impl WheelConfig {
    /// Distance covered by one encoder edge.
    pub fn distance_per_tick(&self) -> f32 {
        if self.pulses_per_revolution == 0 {
            return 0.0;
        }
        self.circumference / self.pulses_per_revolution as f32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pulses_per_revolution == 0 {
            return Err(ConfigError::Invalid("pulses_per_revolution must be non-zero"));
        }
        if self.circumference <= 0.0 {
            return Err(ConfigError::Invalid("circumference must be positive"));
        }
        if self.min_speed < 0.0 || self.max_speed <= self.min_speed {
            return Err(ConfigError::Invalid("speed range must satisfy 0 <= min < max"));
        }
        if self.stall_duty > self.max_duty {
            return Err(ConfigError::Invalid("stall_duty exceeds max_duty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverConfig {
    /// Distance between the wheel contact points.
    pub wheelbase: f32,
    pub odometry_interval_ms: u32,
    /// Combined edges across both wheels before the pose is integrated.
    pub min_odometry_ticks: u32,
    /// Pose heartbeat period while the rover is not moving.
    pub still_report_ms: u32,
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self {
            wheelbase: 0.13,
            odometry_interval_ms: ODOMETRY_INTERVAL_MS,
            min_odometry_ticks: 2,
            still_report_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalConfig {
    /// Heading error accepted before the rover starts driving, radians.
    pub angle_tolerance: f32,
    /// Forward speed cap while seeking, as a fraction of max speed.
    pub cruise_fraction: f32,
    /// In-place turn speed cap, as a fraction of max speed.
    pub turn_fraction: f32,
    /// Turn speed per radian of heading error, as a fraction of max speed.
    pub turn_gain: f32,
    /// Forward speed per unit of remaining distance, per second.
    pub approach_gain: f32,
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            angle_tolerance: 0.1,
            cruise_fraction: 0.6,
            turn_fraction: 0.35,
            turn_gain: 0.5,
            approach_gain: 1.5,
        }
    }
}

/// Simulated motor and wheel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantConfig {
    /// Duty below which the motor does not turn.
    pub stall_duty: u16,
    pub max_duty: u16,
    /// Ground speed at max duty.
    pub top_speed: f32,
    pub time_constant_ms: f32,
    /// Per-side efficiency, to model a rover that pulls to one side.
    pub left_gain: f32,
    pub right_gain: f32,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            stall_duty: 120,
            max_duty: PWM_RESOLUTION_MAX,
            top_speed: 0.7,
            time_constant_ms: 80.0,
            left_gain: 1.0,
            right_gain: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub wheel: WheelConfig,
    pub rover: RoverConfig,
    pub goal: GoalConfig,
    pub gains: PidGains,
    pub step: StepConfig,
    pub controller: ControllerKind,
    pub plant: PlantConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            wheel: WheelConfig::default(),
            rover: RoverConfig::default(),
            goal: GoalConfig::default(),
            gains: PidGains::default(),
            step: StepConfig::default(),
            controller: ControllerKind::Pid,
            plant: PlantConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.wheel.validate()?;
        if self.rover.wheelbase <= 0.0 {
            return Err(ConfigError::Invalid("wheelbase must be positive"));
        }
        if self.plant.stall_duty >= self.plant.max_duty {
            return Err(ConfigError::Invalid("plant stall_duty must be below max_duty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SimConfig::default().validate().is_ok());
        let wheel = WheelConfig::default();
        assert!((wheel.distance_per_tick() - 0.2042 / 40.0).abs() < 1e-7);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = SimConfig::from_json_str(r#"{"rover":{"wheelbase":0.2},"controller":"Step"}"#)
            .unwrap();
        assert_eq!(config.rover.wheelbase, 0.2);
        assert_eq!(config.rover.odometry_interval_ms, ODOMETRY_INTERVAL_MS);
        assert_eq!(config.controller, ControllerKind::Step);
        assert_eq!(config.wheel, WheelConfig::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = SimConfig::from_json_str(r#"{"wheel":{"pulses_per_revolution":0}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = SimConfig::from_json_str("{not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = SimConfig::from_json_file("/nonexistent/rovercore.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}

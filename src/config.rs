// Loop timing, physical constants, gains, topics and serial configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Runtime loop frequency
pub const LOOP_HZ: f64 = 200.0;

// Sleep precision window and cancellation polling granularity
pub const SLEEP_PRECISION: Duration = Duration::from_micros(100);
pub const POLL_INTERVAL: Duration = Duration::from_micros(100);

// Ball-bot geometry
pub const WHEEL_RADIUS: f64 = 0.0048; // meters
pub const BALL_RADIUS: f64 = 0.1210; // meters
pub const MOUNT_ANGLE_DEG: f64 = 45.0; // wheel inclination from vertical

// Planar torque limit, applied before allocation to the three motors
pub const MAX_PLANAR_DUTY: f64 = 0.8;

// Time for the serial link to settle before the first command
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
// Delay between the steps of the shutdown sequence
pub const SHUTDOWN_STEP: Duration = Duration::from_millis(250);

// Yaw command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Serial topics exchanged with the motor board
pub const TOPIC_MOTOR_COMMANDS: u16 = 101; // controller -> board
pub const TOPIC_MOTOR_STATES: u16 = 121; // board -> controller

// Zenoh topics
pub const TOPIC_CMD_YAW: &str = "ballbot/cmd/yaw"; // auxiliary yaw torque demand
pub const TOPIC_HEALTH: &str = "ballbot/state/health"; // yaw input health

// Serial port for the motor control board
pub const SERIAL_PORT: &str = "/dev/ttyACM0";
pub const SERIAL_BAUDRATE: u32 = 115_200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Proportional/derivative gains for one plane (x-z or y-z)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisGains {
    pub kp_theta: f64,
    pub kd_theta: f64,
    pub kp_phi_dot: f64,
}

impl Default for AxisGains {
    fn default() -> Self {
        Self {
            kp_theta: 8.0,
            kd_theta: 0.0,
            kp_phi_dot: 0.5,
        }
    }
}

/// Deployment constants, loaded once at startup.
///
/// Every field has a default, so a config file only needs the values it
/// overrides. Call [`BallbotConfig::validate`] before using it: several of
/// these values end up as divisors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BallbotConfig {
    pub loop_hz: f64,
    pub wheel_radius: f64,
    pub ball_radius: f64,
    pub mount_angle_deg: f64,
    pub gains_x: AxisGains,
    pub gains_y: AxisGains,
    pub max_planar_duty: f64,
    /// Seconds between the first stop request and the full stop (0 = immediate)
    pub fade_time: f64,
    #[serde(with = "secs_f64")]
    pub settle_delay: Duration,
    #[serde(with = "secs_f64")]
    pub shutdown_step: Duration,
    #[serde(with = "secs_f64")]
    pub sleep_precision: Duration,
    #[serde(with = "secs_f64")]
    pub poll_interval: Duration,
    #[serde(with = "secs_f64")]
    pub yaw_timeout: Duration,
}

impl Default for BallbotConfig {
    fn default() -> Self {
        Self {
            loop_hz: LOOP_HZ,
            wheel_radius: WHEEL_RADIUS,
            ball_radius: BALL_RADIUS,
            mount_angle_deg: MOUNT_ANGLE_DEG,
            gains_x: AxisGains::default(),
            gains_y: AxisGains::default(),
            max_planar_duty: MAX_PLANAR_DUTY,
            fade_time: 0.0,
            settle_delay: SETTLE_DELAY,
            shutdown_step: SHUTDOWN_STEP,
            sleep_precision: SLEEP_PRECISION,
            poll_interval: POLL_INTERVAL,
            yaw_timeout: CMD_TIMEOUT,
        }
    }
}

impl BallbotConfig {
    /// Load overrides from a JSON file and validate the result
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loop period; only call on a validated config
    pub fn dt(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.loop_hz)
    }

    /// Only call on a validated config
    pub fn fade_duration(&self) -> Duration {
        Duration::from_secs_f64(self.fade_time)
    }

    pub fn mount_angle(&self) -> f64 {
        self.mount_angle_deg.to_radians()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.loop_hz.is_finite() && self.loop_hz > 0.0) {
            return Err(invalid("loop_hz", format!("{} (must be > 0)", self.loop_hz)));
        }
        if !(self.fade_time.is_finite() && self.fade_time >= 0.0) {
            return Err(invalid("fade_time", format!("{} (must be >= 0)", self.fade_time)));
        }
        if Duration::try_from_secs_f64(self.fade_time).is_err() {
            return Err(invalid("fade_time", format!("{} (too long)", self.fade_time)));
        }
        positive("wheel_radius", self.wheel_radius)?;
        positive("ball_radius", self.ball_radius)?;
        positive("max_planar_duty", self.max_planar_duty)?;

        // Both sin and cos of the mount angle are divisors in the kinematic operator
        if !(self.mount_angle_deg > 0.0 && self.mount_angle_deg < 90.0) {
            return Err(invalid(
                "mount_angle_deg",
                format!("{} (must be within (0, 90))", self.mount_angle_deg),
            ));
        }

        for (field, gains) in [("gains_x", &self.gains_x), ("gains_y", &self.gains_y)] {
            if ![gains.kp_theta, gains.kd_theta, gains.kp_phi_dot]
                .iter()
                .all(|g| g.is_finite())
            {
                return Err(invalid(field, format!("{:?} (gains must be finite)", gains)));
            }
        }

        let dt = Duration::try_from_secs_f64(1.0 / self.loop_hz).map_err(|_| {
            invalid("loop_hz", format!("{} (period does not fit a duration)", self.loop_hz))
        })?;
        if dt.is_zero() {
            return Err(invalid("loop_hz", format!("{} (period rounds to zero)", self.loop_hz)));
        }
        for (field, value) in [
            ("sleep_precision", self.sleep_precision),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() || value >= dt {
                return Err(invalid(
                    field,
                    format!("{:?} (must be > 0 and below the loop period {:?})", value, dt),
                ));
            }
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("{} (must be > 0)", value)))
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

// Durations are written as floating-point seconds in config files
mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

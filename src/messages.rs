// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::config::{TOPIC_MOTOR_COMMANDS, TOPIC_MOTOR_STATES};
use crate::transport::TransportError;

/// A fixed-layout record carried on a numbered serial topic.
///
/// All fields are little-endian and packed, matching the motor board firmware.
pub trait Record: Sized {
    const TOPIC: u16;
    const SIZE: usize;

    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, TransportError>;
}

// Command from runtime -> motor board
// Has default values because the runtime starts (and ends) with zeroed duties
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorCommands {
    pub kill: bool,
    pub motor_1_duty: f32,
    pub motor_2_duty: f32,
    pub motor_3_duty: f32,
}

impl MotorCommands {
    pub fn duties(&self) -> [f32; 3] {
        [self.motor_1_duty, self.motor_2_duty, self.motor_3_duty]
    }

    pub fn set_duties(&mut self, duties: [f32; 3]) {
        self.motor_1_duty = duties[0];
        self.motor_2_duty = duties[1];
        self.motor_3_duty = duties[2];
    }
}

impl Record for MotorCommands {
    const TOPIC: u16 = TOPIC_MOTOR_COMMANDS;
    const SIZE: usize = 16;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        // The firmware reads kill as a float flag
        let kill = if self.kill { 1.0f32 } else { 0.0f32 };
        for value in [kill, self.motor_1_duty, self.motor_2_duty, self.motor_3_duty] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut reader = FieldReader::new::<Self>(bytes)?;
        Ok(Self {
            kill: reader.f32() != 0.0,
            motor_1_duty: reader.f32(),
            motor_2_duty: reader.f32(),
            motor_3_duty: reader.f32(),
        })
    }
}

// State from motor board -> runtime
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorStates {
    pub timestamp_us: i64,
    /// Encoder angles (rad)
    pub psi_1: f32,
    pub psi_2: f32,
    pub psi_3: f32,
    /// Encoder velocities (rad/s)
    pub dpsi_1: f32,
    pub dpsi_2: f32,
    pub dpsi_3: f32,
    /// Body lean angles (rad)
    pub theta_roll: f32,
    pub theta_pitch: f32,
    pub theta_yaw: f32,
    pub dtheta_roll: f32,
    pub dtheta_pitch: f32,
    pub dtheta_yaw: f32,
}

impl MotorStates {
    pub fn encoder_angles(&self) -> [f64; 3] {
        [self.psi_1 as f64, self.psi_2 as f64, self.psi_3 as f64]
    }

    /// Lean angles as (x, y) = (roll, pitch)
    pub fn lean_angles(&self) -> [f64; 2] {
        [self.theta_roll as f64, self.theta_pitch as f64]
    }
}

impl Record for MotorStates {
    const TOPIC: u16 = TOPIC_MOTOR_STATES;
    const SIZE: usize = 8 + 12 * 4;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.timestamp_us.to_le_bytes());
        for value in [
            self.psi_1,
            self.psi_2,
            self.psi_3,
            self.dpsi_1,
            self.dpsi_2,
            self.dpsi_3,
            self.theta_roll,
            self.theta_pitch,
            self.theta_yaw,
            self.dtheta_roll,
            self.dtheta_pitch,
            self.dtheta_yaw,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut reader = FieldReader::new::<Self>(bytes)?;
        Ok(Self {
            timestamp_us: reader.i64(),
            psi_1: reader.f32(),
            psi_2: reader.f32(),
            psi_3: reader.f32(),
            dpsi_1: reader.f32(),
            dpsi_2: reader.f32(),
            dpsi_3: reader.f32(),
            theta_roll: reader.f32(),
            theta_pitch: reader.f32(),
            theta_yaw: reader.f32(),
            dtheta_roll: reader.f32(),
            dtheta_pitch: reader.f32(),
            dtheta_yaw: reader.f32(),
        })
    }
}

// Sequential little-endian reader over a payload whose length was checked up front
struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new<R: Record>(bytes: &'a [u8]) -> Result<Self, TransportError> {
        if bytes.len() != R::SIZE {
            return Err(TransportError::RecordSize {
                topic: R::TOPIC,
                expected: R::SIZE,
                got: bytes.len(),
            });
        }
        Ok(Self { bytes, offset: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut field = [0u8; N];
        field.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        field
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
}

// Yaw torque demand from teleop -> runtime (zenoh, JSON)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YawCommand {
    pub tz: f32,
}

/// Health status of the auxiliary yaw input
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}

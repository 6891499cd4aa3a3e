// Stability controller for the x-z and y-z planes
//
// Per axis:
//   T = Kp_theta * e_theta + Kd_theta * (e_theta - e_theta_prev) / dt + Kp_phidot * e_phidot
// with e_theta the lean-angle error and e_phidot the ball angular velocity
// error. Planar demands are saturated before allocation to the motors.

use crate::config::{AxisGains, BallbotConfig};
use crate::kinematics::BallRotation;

/// Desired lean angles and ball angular velocities (policy input)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Setpoint {
    pub theta_x: f64,
    pub theta_y: f64,
    pub phi_dot_x: f64,
    pub phi_dot_y: f64,
}

/// Two planar torque demands
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanarTorque {
    pub tx: f64,
    pub ty: f64,
}

impl PlanarTorque {
    /// Clip each axis to `±limit`, preserving sign
    pub fn saturated(&self, limit: f64) -> Self {
        Self {
            tx: saturate(self.tx, limit),
            ty: saturate(self.ty, limit),
        }
    }
}

/// Sign-preserving magnitude clip; values within the limit pass through unchanged
pub fn saturate(value: f64, limit: f64) -> f64 {
    if value.abs() > limit {
        limit.copysign(value)
    } else {
        value
    }
}

/// Everything computed during one controller update, for logging
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlOutput {
    pub torque: PlanarTorque,
    pub phi_dot_x: f64,
    pub phi_dot_y: f64,
    pub error_theta_x: f64,
    pub error_theta_y: f64,
}

// Previous-tick values needed for the derivatives
#[derive(Debug, Clone, Copy, Default)]
struct ControllerMemory {
    prev_error_theta: [f64; 2],
    prev_phi: [f64; 2],
}

#[derive(Debug, Clone)]
pub struct StabilityController {
    gains_x: AxisGains,
    gains_y: AxisGains,
    dt: f64,
    // None until the first update seeds it
    memory: Option<ControllerMemory>,
}

impl StabilityController {
    pub fn new(gains_x: AxisGains, gains_y: AxisGains, dt: f64) -> Self {
        Self {
            gains_x,
            gains_y,
            dt,
            memory: None,
        }
    }

    pub fn from_config(config: &BallbotConfig) -> Self {
        Self::new(config.gains_x, config.gains_y, config.dt().as_secs_f64())
    }

    /// Forget the previous tick, so the next update has zero derivative terms
    pub fn reset(&mut self) {
        self.memory = None;
    }

    /// Run one update from measured lean angles `[x, y]` and ball rotation
    pub fn update(
        &mut self,
        lean: [f64; 2],
        phi: BallRotation,
        setpoint: &Setpoint,
    ) -> ControlOutput {
        let error_theta = [setpoint.theta_x - lean[0], setpoint.theta_y - lean[1]];
        let phi_xy = [phi.x, phi.y];

        // The first sample seeds the memory. Zero-initialised memory would read the
        // absolute encoder angle at startup as one tick of ball motion, and the lean
        // error as one tick of change, kicking both rate terms on the first update.
        let memory = self.memory.unwrap_or(ControllerMemory {
            prev_error_theta: error_theta,
            prev_phi: phi_xy,
        });

        let phi_dot = [
            (phi_xy[0] - memory.prev_phi[0]) / self.dt,
            (phi_xy[1] - memory.prev_phi[1]) / self.dt,
        ];
        let error_phi_dot = [setpoint.phi_dot_x - phi_dot[0], setpoint.phi_dot_y - phi_dot[1]];

        let tx = self.axis(
            &self.gains_x,
            error_theta[0],
            memory.prev_error_theta[0],
            error_phi_dot[0],
        );
        let ty = self.axis(
            &self.gains_y,
            error_theta[1],
            memory.prev_error_theta[1],
            error_phi_dot[1],
        );

        self.memory = Some(ControllerMemory {
            prev_error_theta: error_theta,
            prev_phi: phi_xy,
        });

        ControlOutput {
            torque: PlanarTorque { tx, ty },
            phi_dot_x: phi_dot[0],
            phi_dot_y: phi_dot[1],
            error_theta_x: error_theta[0],
            error_theta_y: error_theta[1],
        }
    }

    fn axis(
        &self,
        gains: &AxisGains,
        error_theta: f64,
        prev_error_theta: f64,
        error_phi_dot: f64,
    ) -> f64 {
        let d_error = (error_theta - prev_error_theta) / self.dt;
        let lean_term = gains.kp_theta * error_theta + gains.kd_theta * d_error;
        lean_term + gains.kp_phi_dot * error_phi_dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.005;

    fn only_kp_theta_x(kp: f64) -> StabilityController {
        let zero = AxisGains {
            kp_theta: 0.0,
            kd_theta: 0.0,
            kp_phi_dot: 0.0,
        };
        StabilityController::new(AxisGains { kp_theta: kp, ..zero }, zero, DT)
    }

    #[test]
    fn test_at_rest_produces_no_torque() {
        let mut controller =
            StabilityController::new(AxisGains::default(), AxisGains::default(), DT);
        for _ in 0..3 {
            let out = controller.update([0.0, 0.0], BallRotation::default(), &Setpoint::default());
            assert_eq!(out.torque, PlanarTorque::default());
        }
    }

    #[test]
    fn test_lean_error_scenario_hits_limit_exactly() {
        let mut controller = only_kp_theta_x(8.0);
        // Leaning -0.1 rad gives a +0.1 rad error
        let out = controller.update([-0.1, 0.0], BallRotation::default(), &Setpoint::default());
        assert_eq!(out.error_theta_x, 0.1);
        assert_eq!(out.torque.tx, 0.8);
        assert_eq!(out.torque.ty, 0.0);

        let clamped = out.torque.saturated(0.8);
        assert_eq!(clamped.tx, 0.8);
    }

    #[test]
    fn test_derivative_uses_previous_error() {
        let zero = AxisGains {
            kp_theta: 0.0,
            kd_theta: 0.0,
            kp_phi_dot: 0.0,
        };
        let mut controller = StabilityController::new(
            AxisGains {
                kd_theta: 0.01,
                ..zero
            },
            zero,
            DT,
        );
        let first = controller.update([0.0, 0.0], BallRotation::default(), &Setpoint::default());
        assert_eq!(first.torque.tx, 0.0);

        let lean = [-0.001, 0.0];
        let second = controller.update(lean, BallRotation::default(), &Setpoint::default());
        // 0.01 * 0.001 / 0.005
        assert!((second.torque.tx - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_ball_velocity_feedback() {
        let zero = AxisGains {
            kp_theta: 0.0,
            kd_theta: 0.0,
            kp_phi_dot: 0.0,
        };
        let gains = AxisGains {
            kp_phi_dot: 0.5,
            ..zero
        };
        let mut controller = StabilityController::new(gains, gains, DT);
        let seed = BallRotation { x: 1.0, y: -2.0, z: 0.0 };
        // Seeding sample: no velocity yet, even though phi is far from zero
        let out = controller.update([0.0, 0.0], seed, &Setpoint::default());
        assert_eq!(out.torque, PlanarTorque::default());

        let moved = BallRotation { x: 1.01, y: -2.0, z: 0.3 };
        let out = controller.update([0.0, 0.0], moved, &Setpoint::default());
        assert!((out.phi_dot_x - 2.0).abs() < 1e-9);
        assert!(out.phi_dot_y.abs() < 1e-9);
        // Ball rolling +x at 2 rad/s with a zero setpoint pushes back
        assert!((out.torque.tx + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_update_with_offset_encoders_has_no_rate_kick() {
        let gains = AxisGains {
            kp_theta: 0.0,
            kd_theta: 0.5,
            kp_phi_dot: 0.5,
        };
        let mut controller = StabilityController::new(gains, gains, DT);
        // Encoders already wound up and the robot already leaning at power-on
        let phi = BallRotation { x: 12.0, y: -7.5, z: 3.0 };
        let out = controller.update([0.05, -0.02], phi, &Setpoint::default());
        assert_eq!(out.phi_dot_x, 0.0);
        assert_eq!(out.phi_dot_y, 0.0);
        assert_eq!(out.torque, PlanarTorque::default());

        // Holding still afterwards stays quiet too
        let out = controller.update([0.05, -0.02], phi, &Setpoint::default());
        assert_eq!(out.torque, PlanarTorque::default());
    }

    #[test]
    fn test_reset_clears_memory() {
        let mut controller =
            StabilityController::new(AxisGains::default(), AxisGains::default(), DT);
        controller.update([0.0, 0.0], BallRotation::default(), &Setpoint::default());
        controller.reset();
        let far = BallRotation { x: 5.0, y: 5.0, z: 0.0 };
        let out = controller.update([0.0, 0.0], far, &Setpoint::default());
        assert_eq!(out.phi_dot_x, 0.0);
        assert_eq!(out.phi_dot_y, 0.0);
    }

    #[test]
    fn test_saturation() {
        assert_eq!(saturate(1.5, 0.8), 0.8);
        assert_eq!(saturate(-1.5, 0.8), -0.8);
        assert_eq!(saturate(0.8, 0.8), 0.8);
        assert_eq!(saturate(-0.8, 0.8), -0.8);
        assert_eq!(saturate(0.3, 0.8), 0.3);
        assert_eq!(saturate(-0.0001, 0.8), -0.0001);

        let t = PlanarTorque { tx: 2.0, ty: -0.1 }.saturated(0.8);
        // Each axis is clipped on its own
        assert_eq!(t, PlanarTorque { tx: 0.8, ty: -0.1 });
    }
}

// Ball-bot kinematics for a 3-wheel, 120°-spaced omniwheel drive
//
// Forward: wheel encoder angles (psi) -> ball rotation angles (phi)
// Allocation: planar torques (Tx, Ty) + yaw torque (Tz) -> motor torques
//
//           Ty
//           T1
//           |
//           . _ _ _ _ Tx
//          / \
//         /   \
//       T2     T3

use crate::config::BallbotConfig;

/// Ball rotation angles (rad)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BallRotation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Torque commands for the three motors
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorTorques {
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
}

impl MotorTorques {
    pub fn new(t1: f64, t2: f64, t3: f64) -> Self {
        Self { t1, t2, t3 }
    }

    /// Returns torques as array [t1, t2, t3]
    pub fn as_array(&self) -> [f64; 3] {
        [self.t1, self.t2, self.t3]
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.t1 * factor, self.t2 * factor, self.t3 * factor)
    }
}

fn mat_vec(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0f64; 3];
    for (row, value) in m.iter().zip(out.iter_mut()) {
        *value = row[0] * v[0] + row[1] * v[1] + row[2] * v[2];
    }
    out
}

/// Fixed linear operator from wheel rotation to ball rotation.
///
/// The nine coefficients are computed once from the wheel radius, ball
/// radius and wheel mount angle (measured from vertical).
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicTransform {
    j: [[f64; 3]; 3],
}

impl KinematicTransform {
    pub fn new(wheel_radius: f64, ball_radius: f64, mount_angle: f64) -> Self {
        let ratio = wheel_radius / ball_radius;
        let cos_a = mount_angle.cos();
        let sin_a = mount_angle.sin();

        let j12 = -(3.0f64.sqrt()) * ratio / (3.0 * cos_a);
        let j21 = -2.0 * ratio / (3.0 * cos_a);
        let j22 = ratio / (3.0 * cos_a);
        let j31 = ratio / (3.0 * sin_a);

        Self {
            j: [[0.0, j12, -j12], [j21, j22, j22], [j31, j31, j31]],
        }
    }

    pub fn from_config(config: &BallbotConfig) -> Self {
        Self::new(config.wheel_radius, config.ball_radius, config.mount_angle())
    }

    pub fn matrix(&self) -> &[[f64; 3]; 3] {
        &self.j
    }

    /// phi = J * psi
    pub fn wheel_to_ball(&self, psi: [f64; 3]) -> BallRotation {
        let [x, y, z] = mat_vec(&self.j, psi);
        BallRotation { x, y, z }
    }
}

/// Closed-form map from body torques to the three motor torques.
///
/// Uses the same mount angle as [`KinematicTransform`]. Summing the three
/// outputs cancels both planar components and leaves `-Tz`.
#[derive(Debug, Clone, PartialEq)]
pub struct TorqueAllocator {
    // Rows are motors, columns are [Tx, Ty, Tz]
    a: [[f64; 3]; 3],
}

impl TorqueAllocator {
    pub fn new(mount_angle: f64) -> Self {
        let inv_cos = 1.0 / mount_angle.cos();
        let sqrt3 = 3.0f64.sqrt();
        let third = 1.0 / 3.0;

        // T1 = -1/3 (Tz - 2/cos(a) Ty)
        // T2 = -1/3 (Tz + 1/cos(a) (Ty + sqrt3 Tx))
        // T3 = -1/3 (Tz + 1/cos(a) (Ty - sqrt3 Tx))
        Self {
            a: [
                [0.0, 2.0 * inv_cos * third, -third],
                [-sqrt3 * inv_cos * third, -inv_cos * third, -third],
                [sqrt3 * inv_cos * third, -inv_cos * third, -third],
            ],
        }
    }

    pub fn from_config(config: &BallbotConfig) -> Self {
        Self::new(config.mount_angle())
    }

    pub fn allocate(&self, tx: f64, ty: f64, tz: f64) -> MotorTorques {
        let [t1, t2, t3] = mat_vec(&self.a, [tx, ty, tz]);
        MotorTorques { t1, t2, t3 }
    }
}

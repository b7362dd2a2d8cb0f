//! SO(3) rotation utilities
//!
//! World frame is ENU (z up); body frame is x forward, y left, z up.

use std::f64::consts::PI;

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Wrap an angle to (-π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Body z-axis in world frame (thrust direction)
///
/// z_body = R(q) * [0, 0, 1]^T
pub fn body_z_axis(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.transform_vector(&Vector3::z())
}

/// Angle between the body z-axis and world up [rad]
pub fn tilt_angle(q: &UnitQuaternion<f64>) -> f64 {
    body_z_axis(q).z.clamp(-1.0, 1.0).acos()
}

/// Attitude whose z-axis is aligned with `z_desired` and whose heading is `yaw`
pub fn quaternion_from_z_axis_and_yaw(z_desired: &Vector3<f64>, yaw: f64) -> UnitQuaternion<f64> {
    let z = z_desired.normalize();

    // x_c = [cos(yaw), sin(yaw), 0]^T
    let x_c = Vector3::new(yaw.cos(), yaw.sin(), 0.0);

    let y = z.cross(&x_c);
    let y_norm = y.norm();

    let y = if y_norm > 1e-6 {
        y / y_norm
    } else {
        // z is horizontal and aligned with the heading
        Vector3::new(-yaw.sin(), yaw.cos(), 0.0)
    };

    let x = y.cross(&z);
    let rot = Matrix3::from_columns(&[x, y, z]);

    UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(rot))
}

/// Rotation vector (body frame) taking `q_current` onto `q_desired`, scaled by `kp`
///
/// Always the short way around: the error angle never exceeds π.
pub fn attitude_error(
    q_current: &UnitQuaternion<f64>,
    q_desired: &UnitQuaternion<f64>,
    kp: f64,
) -> Vector3<f64> {
    let mut q_error = *(q_current.inverse() * q_desired).quaternion();
    if q_error.w < 0.0 {
        q_error = -q_error;
    }

    let angle = 2.0 * q_error.w.clamp(-1.0, 1.0).acos();
    if angle.abs() < 1e-10 {
        return Vector3::zeros();
    }

    let axis = Vector3::new(q_error.i, q_error.j, q_error.k);
    let axis_norm = axis.norm();
    if axis_norm < 1e-10 {
        return Vector3::zeros();
    }

    kp * angle * (axis / axis_norm)
}

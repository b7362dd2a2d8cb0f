//! Quaternion operations for attitude representation
//!
//! - Quaternion derivative: q̇ = 1/2 Λ(q)[0;ω]
//! - Integration with renormalization
//! - Conversion to and from roll/pitch/yaw vectors (ZYX convention)

use nalgebra::{Matrix4, Quaternion, UnitQuaternion, Vector3, Vector4};

/// Compute the quaternion derivative given body angular velocity
///
/// q̇ = 1/2 Λ(q)[0;ω]
///
/// # Returns
/// Quaternion derivative as Vector4 (w, x, y, z)
pub fn quaternion_derivative(q: &UnitQuaternion<f64>, omega: &Vector3<f64>) -> Vector4<f64> {
    let w = q.w;
    let x = q.i;
    let y = q.j;
    let z = q.k;

    let omega_quat = Vector4::new(0.0, omega.x, omega.y, omega.z);

    // Λ(q): left quaternion multiplication matrix
    let lambda = Matrix4::new(
        w, -x, -y, -z,
        x,  w, -z,  y,
        y,  z,  w, -x,
        z, -y,  x,  w,
    );

    0.5 * lambda * omega_quat
}

/// Integrate quaternion using the derivative
///
/// q_new = normalize(q + q̇ * dt)
pub fn integrate_quaternion(
    q: &UnitQuaternion<f64>,
    q_dot: &Vector4<f64>,
    dt: f64,
) -> UnitQuaternion<f64> {
    let q_vec = Vector4::new(q.w, q.i, q.j, q.k);
    let q_new = q_vec + q_dot * dt;

    UnitQuaternion::from_quaternion(Quaternion::new(q_new[0], q_new[1], q_new[2], q_new[3]))
}

/// Roll, pitch and yaw of an attitude packed as a vector
pub fn euler_vector(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (roll, pitch, yaw) = q.euler_angles();
    Vector3::new(roll, pitch, yaw)
}

/// Attitude from a roll/pitch/yaw vector
pub fn quaternion_from_euler_vector(rpy: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(rpy.x, rpy.y, rpy.z)
}

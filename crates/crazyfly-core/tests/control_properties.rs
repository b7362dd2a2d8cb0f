//! Closed-loop properties of the control laws

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crazyfly_core::control::{CascadeConfig, L1Adaptive, L1Config, MotorMixer, PidCascade};
use crazyfly_core::dynamics::{QuadrotorDynamics, VehicleParams};
use crazyfly_core::simulation::{SimConfig, VehicleSimulator};
use crazyfly_core::{ActuatorCommand, ControlReference, Vec3, VehicleState};

mod cascade {
    use super::*;

    #[test]
    fn step_response_settles_with_integrators_clamped() {
        let params = VehicleParams::default();
        let dynamics = QuadrotorDynamics::new(params.clone());
        let envelope = params.envelope();
        let mut cascade = PidCascade::new(CascadeConfig::default(), &params).unwrap();
        let mut state = VehicleState::at_rest(Vec3::new(0.0, 0.0, 1.0));
        let reference = ControlReference::hover(Vec3::new(1.0, -0.5, 1.5), 0.0);
        let dt = 0.01;
        let mut settled_at = None;

        for k in 0..1500 {
            let out = cascade.compute(&state, &reference, dt);
            assert!(envelope.contains(&envelope.clamp(&out.command)));
            for (name, pid) in cascade.layers() {
                assert!(
                    pid.integral().amax() <= pid.gains.integral_limit + 1e-12,
                    "{} integrator {} beyond clamp",
                    name,
                    pid.integral().amax()
                );
            }
            state = dynamics.integrate(&state, &envelope.clamp(&out.command), &Vec3::zeros(), dt).0;

            let error = (state.position - reference.position).norm();
            match settled_at {
                None if error < 0.05 => settled_at = Some(k),
                Some(_) if error >= 0.05 => settled_at = None,
                _ => {}
            }
        }
        let settled_at = settled_at.expect("position never settled");
        assert!(settled_at < 1000, "settled only after {} ticks", settled_at);
    }

    #[test]
    fn rejects_constant_wind_through_mixer() {
        let config = SimConfig {
            initial_position: Vec3::new(0.0, 0.0, 1.0),
            disturbance: Vec3::new(0.05, 0.0, 0.0),
            ..Default::default()
        };
        let mut sim = VehicleSimulator::new(&config).unwrap();
        let mut cascade = PidCascade::new(CascadeConfig::default(), &config.vehicle).unwrap();
        let reference = ControlReference::hover(config.initial_position, 0.0);

        for _ in 0..3000 {
            let out = cascade.compute(sim.state(), &reference, 0.01);
            sim.step(&out.command, 0.01);
        }
        assert!((sim.state().position - reference.position).norm() < 0.1);
    }
}

mod adaptive {
    use super::*;

    #[test]
    fn compensation_bounded_for_random_inputs() {
        let config = L1Config::default();
        let limit = config.saturation;
        let mut l1 = L1Adaptive::new(config).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(99);

        for k in 0..5000 {
            let scale = if k % 500 < 10 { 1e6 } else { 10.0 };
            let velocity = Vec3::from_fn(|_, _| rng.gen_range(-1.0..1.0) * scale);
            let dt = if k % 777 == 0 { 0.0 } else { rng.gen_range(0.001..0.05) };
            let out = l1.compute(&velocity, dt);
            assert!(out.compensation.iter().all(|c| c.is_finite()));
            assert!(out.compensation.amax() <= limit + 1e-12);
            assert_eq!(out.saturated, out.fault.is_some());
            if k % 3 != 0 {
                l1.record_applied(&Vec3::from_fn(|_, _| rng.gen_range(-20.0..20.0)));
            }
        }
    }

    #[test]
    fn nan_velocity_never_leaks() {
        let mut l1 = L1Adaptive::new(L1Config::default()).unwrap();
        l1.compute(&Vec3::new(0.1, 0.0, 0.0), 0.01);
        l1.record_applied(&Vec3::zeros());
        let out = l1.compute(&Vec3::new(f64::NAN, 0.0, 0.0), 0.01);
        assert_eq!(out.compensation, Vec3::zeros());
        let out = l1.compute(&Vec3::new(0.1, 0.0, 0.0), 0.01);
        assert!(out.compensation.iter().all(|c| c.is_finite()));
    }
}

mod mixer {
    use super::*;

    #[test]
    fn allocation_inverts_within_limits() {
        let params = VehicleParams::default();
        let mixer = MotorMixer::new(&params).unwrap();
        let command = ActuatorCommand::new(params.hover_thrust(), Vec3::new(0.01, -0.02, 0.005));
        let motors = mixer.mix(&command);
        let back = mixer.unmix(&motors);

        assert!((back.thrust - command.thrust).abs() < 1e-9);
        assert!((back.torque - command.torque).norm() < 1e-9);
    }

    #[test]
    fn motors_never_exceed_limits() {
        let params = VehicleParams::default();
        let mixer = MotorMixer::new(&params).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..1000 {
            let command = ActuatorCommand::new(
                rng.gen_range(-10.0..20.0),
                Vec3::from_fn(|_, _| rng.gen_range(-1.0..1.0)),
            );
            for f in mixer.mix(&command) {
                assert!((0.0..=mixer.max_motor_thrust()).contains(&f));
            }
        }
    }
}

//! Locomotion and the metabolic energy model.

use biosim_core::{EnergyConfig, LocomotionConfig, Position};
use std::f32::consts::PI;

/// Result of interpreting one controller output vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    pub heading: f32,
    /// Signed speed along the heading
    pub speed: f32,
    pub velocity: Position,
}

/// Map controller outputs to a new heading and velocity.
///
/// `outputs[0]` is throttle, `outputs[1]` is steering. Throttle goes through
/// a sigmoid (forward only) or `tanh` when reverse is allowed; steering goes
/// through `tanh` and is scaled by `max_turn * dt`.
pub fn drive(outputs: &[f32], heading: f32, config: &LocomotionConfig, dt: f32) -> Motion {
    let raw_throttle = outputs.first().copied().unwrap_or(0.0);
    let raw_steer = outputs.get(1).copied().unwrap_or(0.0);

    let throttle = if config.allow_reverse {
        raw_throttle.tanh()
    } else {
        sigmoid(raw_throttle)
    };
    let speed = throttle * config.max_speed;
    let heading = wrap_angle(heading + raw_steer.tanh() * config.max_turn * dt);
    Motion {
        heading,
        speed,
        velocity: Position::from_angle(heading).scale(speed),
    }
}

/// Metabolic cost per second at speed `v`.
///
/// `cost(v) = v0 + clamp(|v|, 0, vmax_ref) / vmax_ref * (vmax - v0)`
pub fn movement_cost(speed: f32, config: &EnergyConfig) -> f32 {
    let v = speed.abs().clamp(0.0, config.vmax_ref);
    config.v0_cost + v / config.vmax_ref * (config.vmax_cost - config.v0_cost)
}

/// Energy after paying for `dt` seconds at `speed`, clamped to `[0, energy_cap]`
pub fn drain(energy: f32, speed: f32, config: &EnergyConfig, dt: f32) -> f32 {
    clamp_energy(energy - movement_cost(speed, config) * dt, config)
}

/// Add energy, respecting the cap
pub fn gain(energy: f32, amount: f32, config: &EnergyConfig) -> f32 {
    clamp_energy(energy + amount, config)
}

pub fn clamp_energy(energy: f32, config: &EnergyConfig) -> f32 {
    if energy.is_nan() {
        return 0.0;
    }
    energy.clamp(0.0, config.energy_cap)
}

/// Split a parent's energy for reproduction.
///
/// Returns `(parent_energy, child_energy)`: the reproduction cost is removed
/// first, then the remainder is halved. Neither side can go negative or
/// exceed the cap.
pub fn prepare_reproduction(energy: f32, config: &EnergyConfig) -> (f32, f32) {
    let available = clamp_energy(energy - config.reproduction_cost, config);
    let child = available * 0.5;
    (available - child, child)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Wrap an angle into `[-PI, PI)`
pub fn wrap_angle(angle: f32) -> f32 {
    if !angle.is_finite() {
        return 0.0;
    }
    (angle + PI).rem_euclid(2.0 * PI) - PI
}

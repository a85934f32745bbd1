//! # Physical constants and relativistic conversions
//!
//! Energies are kinetic energies in MeV, lengths in meters, frequencies in Hz
//! and phases in degrees.

/// Speed of light (m/s)
pub const C_LIGHT: f64 = 2.997_924_58e8;
/// H⁻ ion rest mass (MeV): proton plus two electrons
pub const H_MINUS_MASS: f64 = 938.272 + 2. * 0.511;

/// Relativistic β of a particle of kinetic energy `ekin` and rest mass `mass`
pub fn beta(ekin: f64, mass: f64) -> f64 {
    (ekin * (ekin + 2. * mass)).sqrt() / (ekin + mass)
}

/// Relativistic γ of a particle of kinetic energy `ekin` and rest mass `mass`
pub fn gamma(ekin: f64, mass: f64) -> f64 {
    (ekin + mass) / mass
}

/// Kinetic energy of a particle with velocity `β`
pub fn ekin_from_beta(beta: f64, mass: f64) -> f64 {
    mass / (1. - beta * beta).sqrt() - mass
}

/// Momentum (MeV/c)
pub fn momentum(ekin: f64, mass: f64) -> f64 {
    (ekin * (ekin + 2. * mass)).sqrt()
}

/// Wraps a phase into [-180°,180°)
pub fn wrap_phase(phase: f64) -> f64 {
    (phase + 180.).rem_euclid(360.) - 180.
}

/// Returns `phase` plus a multiple of 360° such that the result lies within [reference-180°,reference+180°)
pub fn make_phase_near(phase: f64, reference: f64) -> f64 {
    reference + wrap_phase(phase - reference)
}

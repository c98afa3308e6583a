// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Recfast Fits
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Analytic stand-ins for the global Recfast thermochemistry tables.
//!
//! Above the thermal-decoupling redshift the gas tracks the CMB; below it
//! the temperature falls adiabatically as (1+z)^2. The residual electron
//! fraction freezes out near 2e-4 with a weak slope.

use reion_types::constants::T_CMB0;

/// Redshift where Compton heating stops tracking the gas to the CMB.
const Z_DECOUPLE: f64 = 147.0;

/// Mean kinetic temperature of the neutral IGM (K).
pub fn t_recfast(z: f64) -> f64 {
    let zp1 = 1.0 + z;
    if z >= Z_DECOUPLE {
        T_CMB0 * zp1
    } else {
        T_CMB0 * zp1 * zp1 / (1.0 + Z_DECOUPLE)
    }
}

/// Residual free-electron fraction after recombination.
pub fn xion_recfast(z: f64) -> f64 {
    2.0e-4 * ((1.0 + z) / 1000.0).powf(0.04)
}

/// Adiabatic-fluctuation index cT: delta_Tk = cT * delta at fixed z.
pub fn ct_approx(_z: f64) -> f64 {
    0.58
}

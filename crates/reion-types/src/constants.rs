// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Constants
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Physical and algorithmic constants, cgs unless noted.

/// Speed of light (cm/s)
pub const C_CGS: f64 = 2.99792458e10;

/// Planck constant (erg s)
pub const H_PLANCK: f64 = 6.62606957e-27;

/// Boltzmann constant (erg/K)
pub const K_B: f64 = 1.380658e-16;

/// Proton mass (g)
pub const M_PROTON: f64 = 1.6726231e-24;

/// Electron mass (g)
pub const M_ELECTRON: f64 = 9.10938188e-28;

/// Solar mass (g)
pub const MSUN_G: f64 = 1.989e33;

/// cm per comoving Mpc
pub const CM_PER_MPC: f64 = 3.0856776e24;

/// Seconds per year
pub const S_PER_YR: f64 = 3.1556226e7;

/// Critical density (Msun / Mpc^3, divided by h^2)
pub const RHO_CRIT_MSUN_MPC3: f64 = 2.77536627e11;

/// Critical density (g / cm^3, divided by h^2)
pub const RHO_CRIT_CGS: f64 = 1.8788e-29;

/// CMB temperature at z=0 (K)
pub const T_CMB0: f64 = 2.728;

/// 21-cm hyperfine temperature T_21 = h nu_21 / k_B (K)
pub const T21: f64 = 0.0628;

/// 21-cm spontaneous emission coefficient (1/s)
pub const A10_HYPERFINE: f64 = 2.85e-15;

/// 21-cm wavelength (cm)
pub const LAMBDA_21: f64 = 21.106114;

/// Lyman-alpha frequency (Hz)
pub const NU_LYA: f64 = 2.46606727e15;

/// Lyman-alpha wavelength (Angstrom)
pub const LY_ALPHA_ANG: f64 = 1215.67;

/// Lyman-limit (HI ionisation) frequency (Hz)
pub const NU_ION: f64 = 3.28984196e15;

/// HI ionisation energy (eV)
pub const E_ION_HI: f64 = 13.60;

/// HeI ionisation energy (eV)
pub const E_ION_HEI: f64 = 24.59;

/// Lyman-Werner band threshold (eV)
pub const E_LW_THRESH: f64 = 11.18;

/// Frequency per eV (Hz/eV)
pub const NU_OVER_EV: f64 = 2.41798926e14;

/// HI photo-ionisation cross section at threshold (cm^2)
pub const SIGMA_HI: f64 = 6.3e-18;

/// HeI photo-ionisation cross section at threshold (cm^2)
pub const SIGMA_HEI: f64 = 7.42e-18;

/// Oscillator strength of the Lyman-alpha transition
pub const F_ALPHA: f64 = 0.4162;

/// Linear critical collapse overdensity
pub const DELTAC: f64 = 1.68647;

/// Sphere/cube volume equivalence factor: R_sphere = L_FACTOR * L_cell
pub const L_FACTOR: f64 = 0.620350491;

/// Smallest fractional difference we resolve on float grids
pub const FRACT_FLOAT_ERR: f64 = 1e-7;

/// Highest Lyman-n level included in the recycling sums
pub const NSPEC_MAX: usize = 23;

/// Ionised-fraction ladder for the frequency-integral tables.
/// Irregularly spaced, so index location is precomputed per cell.
pub const X_INT_XHII: [f64; 14] = [
    1.0e-4, 2.318e-4, 4.677e-4, 1.0e-3, 2.318e-3, 4.677e-3, 1.0e-2, 2.318e-2, 4.677e-2, 1.0e-1,
    0.5, 0.9, 0.99, 0.999,
];

/// Number of entries in the x_e ladder
pub const N_XHII: usize = 14;

/// Expected-ionisation floor below which a snapshot is fully neutral
pub const HII_ROUND_ERR: f64 = 1e-5;

/// Upper X-ray band edge (eV)
pub const NU_X_BAND_MAX_EV: f64 = 2000.0;

/// Maximum kinetic temperature tracked by the integrator (K)
pub const MAX_TK: f64 = 5e4;

/// Maximum halo mass for the unconditional integrals (Msun)
pub const M_MAX_INTEGRAL: f64 = 1e16;

/// Minimum halo mass for the power-law cap bisections (Msun)
pub const M_MIN_INTEGRAL: f64 = 1e5;

/// Enforced ceiling on the log10 turnover-mass grids
pub const LOG10_MTURN_MAX: f64 = 10.0;

/// Enforced floor on the log10 turnover-mass grids
pub const LOG10_MTURN_MIN: f64 = 5.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xhii_ladder_monotone() {
        for w in X_INT_XHII.windows(2) {
            assert!(w[0] < w[1], "x_e ladder must be strictly increasing");
        }
        assert_eq!(X_INT_XHII.len(), N_XHII);
    }

    #[test]
    fn test_t21_consistent_with_lambda() {
        // T21 = h c / (lambda k_B)
        let t21 = H_PLANCK * C_CGS / (LAMBDA_21 * K_B);
        assert!((t21 - T21).abs() / T21 < 0.02, "T21 = {t21}");
    }
}

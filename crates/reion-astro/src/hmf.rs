// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Halo Mass Functions
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Unconditional (Sheth-Tormen) and conditional (EPS) mass-function
//! integrals.
//!
//! Conventions: masses in Msun, densities are linear overdensities at the
//! target redshift (already multiplied by the growth factor), sigmas are
//! z = 0 values scaled internally by `growth`. All Nion/SFRD integrals
//! return baryon-fraction-weighted values INCLUDING the f_star/f_esc
//! normalisations, so grid prefactors carry only density and time units.

use reion_math::special::erfc;
use reion_types::config::{AstroParams, FlagOptions};
use reion_types::constants::{DELTAC, M_MAX_INTEGRAL};

use crate::cosmology::Cosmology;
use crate::thermochem;

// Sheth-Tormen multiplicity parameters.
const ST_A: f64 = 0.3222;
const ST_LITTLE_A: f64 = 0.707;
const ST_P: f64 = 0.3;

/// Integration points for the mass integrals.
const N_MASS_STEPS: usize = 64;

/// Power law with an absolute cap at unity.
#[inline]
pub fn capped_power(m: f64, pivot: f64, alpha: f64, norm: f64) -> f64 {
    (norm * (m / pivot).powf(alpha)).min(1.0)
}

/// Sheth-Tormen dn/dlnM (1 / Mpc^3).
pub fn dndlnm_st(cosmo: &Cosmology, growth: f64, m: f64) -> f64 {
    let sigma = cosmo.sigma(m) * growth;
    if sigma <= 0.0 {
        return 0.0;
    }
    let nu = DELTAC / sigma;
    let nu2 = ST_LITTLE_A * nu * nu;
    let f = ST_A * (2.0 * ST_LITTLE_A / std::f64::consts::PI).sqrt()
        * nu
        * (1.0 + nu2.powf(-ST_P))
        * (-0.5 * nu2).exp();
    // dln(sigma)/dlnM = dsigma2/dlnM / (2 sigma0^2); growth cancels.
    let sigma0 = cosmo.sigma(m);
    let dlnsigma_dlnm = cosmo.dsigmasq_dlnm(m) / (2.0 * sigma0 * sigma0);
    cosmo.rho_m / m * f * dlnsigma_dlnm.abs()
}

/// Simpson integral of `w(M) * (M/rho_m) * dn/dlnM` over ln M.
fn unconditional_integral<W: Fn(f64) -> f64>(
    cosmo: &Cosmology,
    growth: f64,
    ln_m_min: f64,
    ln_m_max: f64,
    w: W,
) -> f64 {
    if ln_m_max <= ln_m_min {
        return 0.0;
    }
    let dlnm = (ln_m_max - ln_m_min) / N_MASS_STEPS as f64;
    let mut sum = 0.0;
    for i in 0..=N_MASS_STEPS {
        let m = (ln_m_min + dlnm * i as f64).exp();
        let integrand = dndlnm_st(cosmo, growth, m) * m / cosmo.rho_m * w(m);
        let coeff = if i == 0 || i == N_MASS_STEPS {
            1.0
        } else if i % 2 == 1 {
            4.0
        } else {
            2.0
        };
        sum += coeff * integrand;
    }
    sum * dlnm / 3.0
}

/// Total collapsed fraction above M_min.
pub fn fcoll_general(cosmo: &Cosmology, z: f64, ln_m_min: f64, ln_m_max: f64) -> f64 {
    let growth = cosmo.growth(z);
    unconditional_integral(cosmo, growth, ln_m_min, ln_m_max, |_| 1.0)
}

/// Ionising-photon-weighted collapsed fraction (ACG parametrisation).
#[allow(clippy::too_many_arguments)]
pub fn nion_general(
    cosmo: &Cosmology,
    z: f64,
    ln_m_min: f64,
    ln_m_max: f64,
    m_turn: f64,
    alpha_star: f64,
    alpha_esc: f64,
    f_star10: f64,
    f_esc10: f64,
) -> f64 {
    let growth = cosmo.growth(z);
    unconditional_integral(cosmo, growth, ln_m_min, ln_m_max, |m| {
        capped_power(m, 1e10, alpha_star, f_star10)
            * capped_power(m, 1e10, alpha_esc, f_esc10)
            * (-m_turn / m).exp()
    })
}

/// MCG variant with both turnover suppressions.
#[allow(clippy::too_many_arguments)]
pub fn nion_general_mini(
    cosmo: &Cosmology,
    z: f64,
    ln_m_min: f64,
    ln_m_max: f64,
    m_turn_mcg: f64,
    m_turn_acg: f64,
    alpha_star_mini: f64,
    alpha_esc: f64,
    f_star7: f64,
    f_esc7: f64,
) -> f64 {
    let growth = cosmo.growth(z);
    unconditional_integral(cosmo, growth, ln_m_min, ln_m_max, |m| {
        capped_power(m, 1e7, alpha_star_mini, f_star7)
            * capped_power(m, 1e7, alpha_esc, f_esc7)
            * (-m_turn_mcg / m - m / m_turn_acg).exp()
    })
}

/// Star-formation-weighted collapsed fraction (no escape weighting).
pub fn sfrd_general(
    cosmo: &Cosmology,
    z: f64,
    ln_m_min: f64,
    ln_m_max: f64,
    m_turn: f64,
    alpha_star: f64,
    f_star10: f64,
) -> f64 {
    let growth = cosmo.growth(z);
    unconditional_integral(cosmo, growth, ln_m_min, ln_m_max, |m| {
        capped_power(m, 1e10, alpha_star, f_star10) * (-m_turn / m).exp()
    })
}

/// MCG star-formation-weighted collapsed fraction.
#[allow(clippy::too_many_arguments)]
pub fn sfrd_general_mini(
    cosmo: &Cosmology,
    z: f64,
    ln_m_min: f64,
    ln_m_max: f64,
    m_turn_mcg: f64,
    m_turn_acg: f64,
    alpha_star_mini: f64,
    f_star7: f64,
) -> f64 {
    let growth = cosmo.growth(z);
    unconditional_integral(cosmo, growth, ln_m_min, ln_m_max, |m| {
        capped_power(m, 1e7, alpha_star_mini, f_star7) * (-m_turn_mcg / m - m / m_turn_acg).exp()
    })
}

/// Conditional EPS collapsed fraction in its closed (erfc) form.
///
/// `delta` is the filtered overdensity at z; sigmas are z = 0 values.
pub fn fcoll_conditional(growth: f64, delta: f64, sigma_min0: f64, sigma_cond0: f64) -> f64 {
    if delta >= DELTAC {
        return 1.0;
    }
    let dvar = sigma_min0 * sigma_min0 - sigma_cond0 * sigma_cond0;
    if dvar <= 0.0 {
        return 1.0;
    }
    erfc((DELTAC - delta) / (growth * (2.0 * dvar).sqrt()))
}

/// d f_coll / dz at fixed Lagrangian density, numeric two-point form.
pub fn dfcoll_dz(
    cosmo: &Cosmology,
    z: f64,
    delta: f64,
    sigma_min0: f64,
    sigma_cond0: f64,
) -> f64 {
    let growth = cosmo.growth(z);
    let delta0 = delta / growth;
    let dz = 1e-3 * (1.0 + z);
    let f = |zz: f64| {
        let g = cosmo.growth(zz);
        fcoll_conditional(g, delta0 * g, sigma_min0, sigma_cond0)
    };
    (f(z + dz) - f(z - dz)) / (2.0 * dz)
}

/// Weighted conditional EPS integral over [M_min, M_cond].
///
/// With `w = 1` this reproduces `fcoll_conditional` by construction of the
/// first-crossing distribution.
fn conditional_integral<W: Fn(f64) -> f64>(
    cosmo: &Cosmology,
    growth: f64,
    ln_m_min: f64,
    ln_m_cond: f64,
    sigma_cond0: f64,
    delta: f64,
    w: W,
) -> f64 {
    if ln_m_cond <= ln_m_min {
        return 0.0;
    }
    if delta >= DELTAC {
        return 1.0;
    }
    let barrier = DELTAC - delta;
    let s_cond = growth * growth * sigma_cond0 * sigma_cond0;
    let dlnm = (ln_m_cond - ln_m_min) / N_MASS_STEPS as f64;

    let mut sum = 0.0;
    for i in 0..=N_MASS_STEPS {
        let lnm = ln_m_min + dlnm * i as f64;
        let m = lnm.exp();
        let sigma0 = cosmo.sigma(m);
        let s = growth * growth * sigma0 * sigma0;
        let ds = s - s_cond;
        if ds <= 0.0 {
            continue;
        }
        // First-crossing distribution in S, mapped to lnM.
        let ds_dlnm = (growth * growth * cosmo.dsigmasq_dlnm(m)).abs();
        let f = barrier / (2.0 * std::f64::consts::PI).sqrt()
            * ds.powf(-1.5)
            * (-barrier * barrier / (2.0 * ds)).exp()
            * ds_dlnm;
        let coeff = if i == 0 || i == N_MASS_STEPS {
            1.0
        } else if i % 2 == 1 {
            4.0
        } else {
            2.0
        };
        sum += coeff * f * w(m);
    }
    sum * dlnm / 3.0
}

/// Conditional ionising-photon-weighted collapsed fraction (ACG).
#[allow(clippy::too_many_arguments)]
pub fn nion_conditional_m(
    cosmo: &Cosmology,
    growth: f64,
    ln_m_min: f64,
    ln_m_cond: f64,
    sigma_cond0: f64,
    delta: f64,
    m_turn: f64,
    alpha_star: f64,
    alpha_esc: f64,
    f_star10: f64,
    f_esc10: f64,
) -> f64 {
    conditional_integral(cosmo, growth, ln_m_min, ln_m_cond, sigma_cond0, delta, |m| {
        capped_power(m, 1e10, alpha_star, f_star10)
            * capped_power(m, 1e10, alpha_esc, f_esc10)
            * (-m_turn / m).exp()
    })
}

/// Conditional MCG variant.
#[allow(clippy::too_many_arguments)]
pub fn nion_conditional_mini(
    cosmo: &Cosmology,
    growth: f64,
    ln_m_min: f64,
    ln_m_cond: f64,
    sigma_cond0: f64,
    delta: f64,
    m_turn_mcg: f64,
    m_turn_acg: f64,
    alpha_star_mini: f64,
    alpha_esc: f64,
    f_star7: f64,
    f_esc7: f64,
) -> f64 {
    conditional_integral(cosmo, growth, ln_m_min, ln_m_cond, sigma_cond0, delta, |m| {
        capped_power(m, 1e7, alpha_star_mini, f_star7)
            * capped_power(m, 1e7, alpha_esc, f_esc7)
            * (-m_turn_mcg / m - m / m_turn_acg).exp()
    })
}

/// Conditional star-formation-weighted collapsed fraction (ACG).
#[allow(clippy::too_many_arguments)]
pub fn sfrd_conditional(
    cosmo: &Cosmology,
    growth: f64,
    ln_m_min: f64,
    ln_m_cond: f64,
    sigma_cond0: f64,
    delta: f64,
    m_turn: f64,
    alpha_star: f64,
    f_star10: f64,
) -> f64 {
    conditional_integral(cosmo, growth, ln_m_min, ln_m_cond, sigma_cond0, delta, |m| {
        capped_power(m, 1e10, alpha_star, f_star10) * (-m_turn / m).exp()
    })
}

/// Conditional MCG star-formation-weighted collapsed fraction.
#[allow(clippy::too_many_arguments)]
pub fn sfrd_conditional_mini(
    cosmo: &Cosmology,
    growth: f64,
    ln_m_min: f64,
    ln_m_cond: f64,
    sigma_cond0: f64,
    delta: f64,
    m_turn_mcg: f64,
    m_turn_acg: f64,
    alpha_star_mini: f64,
    f_star7: f64,
) -> f64 {
    conditional_integral(cosmo, growth, ln_m_min, ln_m_cond, sigma_cond0, delta, |m| {
        capped_power(m, 1e7, alpha_star_mini, f_star7) * (-m_turn_mcg / m - m / m_turn_acg).exp()
    })
}

/// Conditional expected halo count per unit condition mass.
pub fn nhalo_conditional(
    cosmo: &Cosmology,
    growth: f64,
    ln_m_min: f64,
    ln_m_cond: f64,
    sigma_cond0: f64,
    delta: f64,
) -> f64 {
    conditional_integral(cosmo, growth, ln_m_min, ln_m_cond, sigma_cond0, delta, |m| {
        // mass fraction -> number per condition mass
        1.0 / m
    })
}

/// Smallest mass allowed to host sources for the active flag set.
pub fn minimum_source_mass(
    z: f64,
    astro: &AstroParams,
    flags: &FlagOptions,
    cosmo: &Cosmology,
) -> f64 {
    if flags.use_mini_halos {
        // molecular-cooling haloes contribute well below the turnover
        thermochem::molecular_cooling_threshold(z, cosmo) / 50.0
    } else if flags.use_mass_dependent_zeta {
        astro.m_turn / 50.0
    } else {
        thermochem::atomic_cooling_threshold(z, cosmo)
    }
}

/// Default upper mass for the unconditional integrals.
pub fn ln_m_max_global() -> f64 {
    M_MAX_INTEGRAL.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reion_types::config::CosmoParams;

    fn cosmo() -> Cosmology {
        Cosmology::new(&CosmoParams::default())
    }

    #[test]
    fn test_fcoll_general_grows_with_time() {
        let c = cosmo();
        let lnmin = (1e8f64).ln();
        let lnmax = ln_m_max_global();
        let f20 = fcoll_general(&c, 20.0, lnmin, lnmax);
        let f10 = fcoll_general(&c, 10.0, lnmin, lnmax);
        let f6 = fcoll_general(&c, 6.0, lnmin, lnmax);
        assert!(f20 < f10 && f10 < f6, "fcoll: {f20} {f10} {f6}");
        assert!(f6 < 1.0 && f6 > 0.0);
    }

    #[test]
    fn test_nion_below_fcoll() {
        // f_star, f_esc < 1 so the weighted integral is smaller.
        let c = cosmo();
        let lnmin = (1e8f64).ln();
        let lnmax = ln_m_max_global();
        let nion = nion_general(&c, 8.0, lnmin, lnmax, 5e8, 0.5, -0.5, 0.05, 0.1);
        let fcoll = fcoll_general(&c, 8.0, lnmin, lnmax);
        assert!(nion > 0.0);
        assert!(nion < fcoll, "nion {nion} must be below fcoll {fcoll}");
    }

    #[test]
    fn test_nion_suppressed_by_turnover() {
        let c = cosmo();
        let lnmin = (1e7f64).ln();
        let lnmax = ln_m_max_global();
        let small = nion_general(&c, 10.0, lnmin, lnmax, 1e8, 0.5, -0.5, 0.05, 0.1);
        let large = nion_general(&c, 10.0, lnmin, lnmax, 1e10, 0.5, -0.5, 0.05, 0.1);
        assert!(large < small, "larger turnover suppresses: {large} vs {small}");
    }

    #[test]
    fn test_conditional_matches_erfc_for_unit_weight() {
        let c = cosmo();
        let growth = c.growth(9.0);
        let m_cond = c.rtom(2.0);
        let m_min = 1e8;
        let sig_c = c.sigma(m_cond);
        let sig_min = c.sigma(m_min);

        for delta in [-0.5, 0.0, 0.5, 1.2] {
            let integral = conditional_integral(
                &c,
                growth,
                m_min.ln(),
                m_cond.ln(),
                sig_c,
                delta,
                |_| 1.0,
            );
            let closed = fcoll_conditional(growth, delta, sig_min, sig_c);
            assert!(
                (integral - closed).abs() < 0.05 * closed.max(1e-10) + 1e-6,
                "delta = {delta}: integral {integral} vs erfc {closed}"
            );
        }
    }

    #[test]
    fn test_conditional_increases_with_delta() {
        let c = cosmo();
        let growth = c.growth(9.0);
        let m_cond = c.rtom(2.0);
        let sig_c = c.sigma(m_cond);
        let mut prev = 0.0;
        for delta in [-0.8, -0.3, 0.0, 0.4, 1.0] {
            let v = nion_conditional_m(
                &c,
                growth,
                (1e8f64).ln(),
                m_cond.ln(),
                sig_c,
                delta,
                5e8,
                0.5,
                -0.5,
                0.05,
                0.1,
            );
            assert!(v >= prev, "nion_conditional must grow with delta: {v} < {prev}");
            prev = v;
        }
    }

    #[test]
    fn test_conditional_collapsed_limit() {
        let c = cosmo();
        let growth = c.growth(9.0);
        let m_cond = c.rtom(1.0);
        let sig_c = c.sigma(m_cond);
        let v = sfrd_conditional(
            &c,
            growth,
            (1e8f64).ln(),
            m_cond.ln(),
            sig_c,
            DELTAC + 0.1,
            5e8,
            0.5,
            0.05,
        );
        assert!((v - 1.0).abs() < 1e-12, "overdense cells are fully collapsed");
    }

    #[test]
    fn test_capped_power() {
        assert!((capped_power(1e10, 1e10, 0.5, 0.05) - 0.05).abs() < 1e-12);
        assert!((capped_power(1e16, 1e10, 1.0, 0.05) - 1.0).abs() < 1e-12, "cap binds");
        assert!((capped_power(1e8, 1e10, 0.0, 0.3) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_dfcoll_dz_negative() {
        // Collapse accumulates with time, so dF/dz < 0.
        let c = cosmo();
        let m_cond = c.rtom(2.0);
        let sig_c = c.sigma(m_cond);
        let sig_min = c.sigma(1e8);
        let d = dfcoll_dz(&c, 12.0, 0.0, sig_min, sig_c);
        assert!(d < 0.0, "dfcoll/dz = {d}");
    }
}

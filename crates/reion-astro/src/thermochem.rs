// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Thermochemistry
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Recombination coefficients, 21-cm collision rates, cooling-mass
//! thresholds, stellar feedback on the turnover mass, and the ionised
//! temperature assignments.

use reion_types::config::AstroParams;

use crate::cosmology::Cosmology;

/// Temperature reached immediately after reionisation of a cell (K).
const T_REION: f64 = 2.0e4;

/// r.m.s. baryon-CDM relative velocity at recombination (km/s).
const VCB_RMS: f64 = 25.86;

/// Case-A hydrogen recombination coefficient (cm^3/s), Abel+97 power-law fit.
pub fn alpha_a(t: f64) -> f64 {
    4.2e-13 * (t.max(1.0) / 1e4).powf(-0.76)
}

/// Case-B hydrogen recombination coefficient (cm^3/s), Spitzer fit.
pub fn alpha_b(t: f64) -> f64 {
    2.59e-13 * (t.max(1.0) / 1e4).powf(-0.7)
}

/// H-H collisional spin de-excitation rate (cm^3/s), Zygelman fit.
pub fn kappa_10(t: f64) -> f64 {
    let t = t.clamp(1.0, 1e4);
    3.1e-11 * t.powf(0.357) * (-32.0 / t).exp()
}

/// e-H collisional rate (cm^3/s), Furlanetto & Furlanetto fit.
pub fn kappa_10_elec(t: f64) -> f64 {
    let l10t = t.clamp(1.0, 1e4).log10();
    10f64.powf(-9.607 + 0.5 * l10t * (-(l10t.powf(4.5)) / 1800.0).exp())
}

/// p-H collisional rate (cm^3/s); a few times the neutral rate.
pub fn kappa_10_ph(t: f64) -> f64 {
    3.2 * kappa_10(t)
}

/// Halo mass with virial temperature `tvir` at redshift z (Msun).
pub fn ttom(z: f64, tvir: f64, mu: f64, cosmo: &Cosmology) -> f64 {
    // Barkana & Loeb (2001) inverted, overdensity factor of order unity
    // absorbed at the high redshifts where this is used.
    let h = cosmo.params.hlittle;
    let base = tvir / (1.98e4 * (mu / 0.6) * ((1.0 + z) / 10.0) * cosmo.params.omm.cbrt());
    1e8 / h * base.powf(1.5)
}

/// Smallest halo that cools atomically (Msun).
pub fn atomic_cooling_threshold(z: f64, cosmo: &Cosmology) -> f64 {
    ttom(z, 1e4, 0.59, cosmo)
}

/// Smallest halo that cools through molecular hydrogen (Msun).
pub fn molecular_cooling_threshold(z: f64, cosmo: &Cosmology) -> f64 {
    ttom(z, 600.0, 1.22, cosmo)
}

/// Lyman-Werner + streaming-velocity turnover mass (Msun).
///
/// The three-effect form: molecular floor, photo-dissociation boost
/// (1 + A_LW J21^beta_LW) and relative-velocity boost.
pub fn lyman_werner_threshold(
    z: f64,
    j_21_lw: f64,
    vcb: f64,
    astro: &AstroParams,
    cosmo: &Cosmology,
) -> f64 {
    let m_mol = molecular_cooling_threshold(z, cosmo);
    let f_lw = if j_21_lw > 0.0 {
        1.0 + astro.a_lw * j_21_lw.powf(astro.beta_lw)
    } else {
        1.0
    };
    let f_vcb = (1.0 + astro.a_vcb * vcb.max(0.0) / VCB_RMS).powf(astro.beta_vcb);
    m_mol * f_lw * f_vcb
}

/// Photo-ionisation feedback on the turnover mass (Msun),
/// Sobacchi & Mesinger form. Returns 0 for never-ionised cells.
pub fn reionization_feedback(z: f64, gamma12: f64, z_re: f64) -> f64 {
    if z_re < 0.0 {
        return 0.0;
    }
    let zfac = (1.0 + z) / (1.0 + z_re);
    let suppression = 1.0 - zfac.powi(2);
    if suppression <= 0.0 {
        return 0.0;
    }
    2.8e9 * gamma12.max(1e-10).powf(0.17) * ((1.0 + z) / 10.0).powf(-2.1) * suppression.powf(2.5)
}

/// Temperature of a cell fully ionised at z_re, observed at z (K).
pub fn fully_ionized_temperature(z_re: f64, z: f64, delta: f64) -> f64 {
    let base = (1.0 + z) * (1.0 + delta).max(1e-3).cbrt() / (1.0 + z_re);
    T_REION * base.min(1.0).powf(1.7)
}

/// Mass-weighted temperature of a partially ionised cell (K).
pub fn partially_ionized_temperature(t_hi: f64, res_xh: f64) -> f64 {
    let x = res_xh.clamp(0.0, 1.0);
    t_hi * x + T_REION * (1.0 - x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reion_types::config::CosmoParams;

    fn cosmo() -> Cosmology {
        Cosmology::new(&CosmoParams::default())
    }

    #[test]
    fn test_recombination_coefficients() {
        // Case A exceeds case B, both decrease with temperature.
        assert!(alpha_a(1e4) > alpha_b(1e4));
        assert!(alpha_b(1e4) > alpha_b(4e4));
        assert!((alpha_b(1e4) - 2.59e-13).abs() / 2.59e-13 < 1e-10);
    }

    #[test]
    fn test_kappa_rates_positive_increasing() {
        let k1 = kappa_10(10.0);
        let k2 = kappa_10(100.0);
        let k3 = kappa_10(1000.0);
        assert!(k1 > 0.0 && k2 > k1 && k3 > k2);
        assert!(kappa_10_elec(100.0) > kappa_10(100.0), "electrons couple harder");
    }

    #[test]
    fn test_cooling_thresholds_ordering() {
        let c = cosmo();
        for z in [6.0, 10.0, 20.0] {
            let atom = atomic_cooling_threshold(z, &c);
            let mol = molecular_cooling_threshold(z, &c);
            assert!(mol < atom, "molecular below atomic at z = {z}");
            assert!(atom > 1e6 && atom < 1e9, "atomic threshold {atom} at z = {z}");
        }
    }

    #[test]
    fn test_lw_threshold_monotone_in_flux() {
        let c = cosmo();
        let astro = AstroParams::default();
        let m0 = lyman_werner_threshold(10.0, 0.0, 0.0, &astro, &c);
        let m1 = lyman_werner_threshold(10.0, 1.0, 0.0, &astro, &c);
        let m2 = lyman_werner_threshold(10.0, 10.0, 0.0, &astro, &c);
        assert!(m0 < m1 && m1 < m2);
        let mv = lyman_werner_threshold(10.0, 0.0, 30.0, &astro, &c);
        assert!(mv > m0, "streaming velocities raise the threshold");
    }

    #[test]
    fn test_reionization_feedback_cases() {
        // Never ionised: no feedback.
        assert_eq!(reionization_feedback(8.0, 1.0, -1.0), 0.0);
        // Just ionised (z == z_re): suppression term vanishes.
        assert_eq!(reionization_feedback(8.0, 1.0, 8.0), 0.0);
        // Ionised earlier: positive and growing with Gamma.
        let weak = reionization_feedback(6.0, 0.1, 10.0);
        let strong = reionization_feedback(6.0, 1.0, 10.0);
        assert!(weak > 0.0 && strong > weak);
    }

    #[test]
    fn test_ionized_temperatures() {
        // Fully ionised at z_re, observed later: between 0 and T_REION.
        let t = fully_ionized_temperature(10.0, 7.0, 0.0);
        assert!(t > 0.0 && t <= T_REION);
        // Just ionised: the full reionisation temperature.
        let t0 = fully_ionized_temperature(7.0, 7.0, 0.0);
        assert!((t0 - T_REION).abs() / T_REION < 1e-6);
        // Partial mix interpolates.
        let tp = partially_ionized_temperature(100.0, 0.5);
        assert!((tp - 0.5 * (100.0 + T_REION)).abs() < 1e-9);
    }
}

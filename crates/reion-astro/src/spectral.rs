// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Spectral Kernels
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Lyman-series recycling, stellar UV emissivity, X-ray frequency
//! integrals and the opacity kernels used by the spin-temperature engine.
//!
//! The secondary-deposition fractions use the Shull & van Steenberg
//! fits in place of the tabulated electron cascade data, which the core
//! treats as an external contract.

use reion_types::constants::*;

use crate::cosmology::Cosmology;

/// Lyman-n recycling fractions to Lyman-alpha, n = 2..=23
/// (Pritchard & Furlanetto 2006).
const FRECYCLE: [f64; 22] = [
    1.0, 0.0, 0.2609, 0.3078, 0.3259, 0.3353, 0.3410, 0.3448, 0.3476, 0.3496, 0.3512, 0.3524,
    0.3535, 0.3543, 0.3550, 0.3556, 0.3561, 0.3565, 0.3569, 0.3572, 0.3575, 0.3578,
];

/// Photons per stellar baryon between Lyman-alpha and the limit.
const N_LYMAN_POP2: f64 = 9690.0;
const N_LYMAN_POP3: f64 = 4800.0;

/// Spectral slope of the per-frequency emissivity (photon number).
const ALPHA_POP2: f64 = 0.86;
const ALPHA_POP3: f64 = 0.0;

/// Frequency of the Lyman-n transition (Hz).
pub fn nu_n(n: usize) -> f64 {
    let nf = n as f64;
    NU_ION * (1.0 - 1.0 / (nf * nf))
}

/// Highest redshift from which Lyman-n photons emitted there redshift
/// into the line at z.
pub fn zmax(z: f64, n: usize) -> f64 {
    (1.0 + z) * nu_n(n + 1) / nu_n(n) - 1.0
}

/// Recycling fraction of Lyman-n photons into Lyman-alpha.
pub fn frecycle(n: usize) -> f64 {
    if (2..=NSPEC_MAX).contains(&n) {
        FRECYCLE[n - 2]
    } else {
        0.0
    }
}

/// Stellar population selector for the UV emissivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StellarPop {
    Pop2,
    Pop3,
}

fn pop_spectrum(pop: StellarPop) -> (f64, f64) {
    match pop {
        StellarPop::Pop2 => (N_LYMAN_POP2, ALPHA_POP2),
        StellarPop::Pop3 => (N_LYMAN_POP3, ALPHA_POP3),
    }
}

/// Band edges of the Lyman continuum in units of the ionisation frequency.
const X_LYA: f64 = 0.75;
const X_LIMIT: f64 = 1.0;

/// Photon-number emissivity per stellar baryon per unit (nu/nu_ion),
/// normalised so the [Lya, limit] band integrates to the population total.
pub fn spectral_emissivity(x: f64, pop: StellarPop) -> f64 {
    let (n_tot, alpha) = pop_spectrum(pop);
    let norm = if (alpha - 1.0).abs() < 1e-8 {
        n_tot / (X_LIMIT / X_LYA).ln()
    } else {
        n_tot * (1.0 - alpha) / (X_LIMIT.powf(1.0 - alpha) - X_LYA.powf(1.0 - alpha))
    };
    norm * x.max(X_LYA * 0.5).powf(-alpha)
}

/// Band-integrated photon number between x_lo and x_hi (same units).
pub fn band_emissivity(x_lo: f64, x_hi: f64, pop: StellarPop) -> f64 {
    if x_hi <= x_lo {
        return 0.0;
    }
    let (_, alpha) = pop_spectrum(pop);
    let e_lo = spectral_emissivity(x_lo, pop);
    if (alpha - 1.0).abs() < 1e-8 {
        return e_lo * x_lo * (x_hi / x_lo).ln();
    }
    // analytic integral of the power law
    e_lo * x_lo.powf(alpha) * (x_hi.powf(1.0 - alpha) - x_lo.powf(1.0 - alpha)) / (1.0 - alpha)
}

/// Shull & van Steenberg fraction of secondary energy going to heat.
pub fn f_heat(x_e: f64) -> f64 {
    let x = x_e.clamp(1e-4, 0.999);
    0.9971 * (1.0 - (1.0 - x.powf(0.2663)).powf(1.3163))
}

/// Fraction going to further ionisations.
pub fn f_ion(x_e: f64) -> f64 {
    let x = x_e.clamp(1e-4, 0.999);
    0.3908 * (1.0 - x.powf(0.4092)).powf(1.7592)
}

/// Fraction going to Lyman-alpha excitations.
pub fn f_excite(x_e: f64) -> f64 {
    let x = x_e.clamp(1e-4, 0.999);
    0.4766 * (1.0 - x.powf(0.2735)).powf(1.5221)
}

/// HI photo-ionisation cross section (cm^2), threshold power law.
pub fn sigma_hi(nu: f64) -> f64 {
    let nu_th = E_ION_HI * NU_OVER_EV;
    if nu < nu_th {
        0.0
    } else {
        SIGMA_HI * (nu / nu_th).powf(-3.0)
    }
}

/// HeI photo-ionisation cross section (cm^2).
pub fn sigma_hei(nu: f64) -> f64 {
    let nu_th = E_ION_HEI * NU_OVER_EV;
    if nu < nu_th {
        0.0
    } else {
        SIGMA_HEI * (nu / nu_th).powf(-3.0)
    }
}

/// What an X-ray frequency integral measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NuIntegralMode {
    Heat,
    Ionisation,
    LymanAlpha,
}

/// Integral over the X-ray SED of cross-section-weighted deposition.
///
/// The SED is a photon-number spectrum ~ nu^(-alpha_x - 1), normalised to
/// one photon above `nu_thresh_ev`; species are weighted by number
/// fraction. Heat returns erg cm^2 per photon; ionisation and Lyman-alpha
/// return cm^2 per photon (counts per unit column).
pub fn integrate_over_nu(
    x_e: f64,
    nu_low: f64,
    nu_thresh_ev: f64,
    alpha_x: f64,
    cosmo: &Cosmology,
    mode: NuIntegralMode,
) -> f64 {
    let nu_thresh = nu_thresh_ev * NU_OVER_EV;
    let nu_max = NU_X_BAND_MAX_EV * NU_OVER_EV;
    let nu_lo = nu_low.max(nu_thresh);
    if nu_lo >= nu_max {
        return 0.0;
    }

    let n_steps = 128;
    let dlnnu = (nu_max / nu_lo).ln() / n_steps as f64;

    let e_ion_hi_erg = H_PLANCK * E_ION_HI * NU_OVER_EV;
    let e_ion_hei_erg = H_PLANCK * E_ION_HEI * NU_OVER_EV;
    let e_lya_erg = H_PLANCK * NU_LYA;

    let mut sum = 0.0;
    for i in 0..=n_steps {
        let nu = nu_lo * (dlnnu * i as f64).exp();
        // photon-number SED normalised above the threshold
        let sed = alpha_x / nu_thresh * (nu / nu_thresh).powf(-alpha_x - 1.0);
        let e_gamma = H_PLANCK * nu;

        let hi_term = cosmo.f_h * sigma_hi(nu) * (e_gamma - e_ion_hi_erg).max(0.0);
        let hei_term = cosmo.f_he * sigma_hei(nu) * (e_gamma - e_ion_hei_erg).max(0.0);
        let secondary = hi_term + hei_term;

        let integrand = match mode {
            NuIntegralMode::Heat => secondary * f_heat(x_e),
            NuIntegralMode::Ionisation => {
                // primary ionisation plus secondaries per unit column
                let primary = cosmo.f_h * sigma_hi(nu) + cosmo.f_he * sigma_hei(nu);
                primary + secondary * f_ion(x_e) / e_ion_hi_erg
            }
            NuIntegralMode::LymanAlpha => secondary * f_excite(x_e) / e_lya_erg,
        };

        let coeff = if i == 0 || i == n_steps {
            1.0
        } else if i % 2 == 1 {
            4.0
        } else {
            2.0
        };
        sum += coeff * sed * integrand * nu; // nu from d(ln nu)
    }
    sum * dlnnu / 3.0
}

/// Frequency at which the neutral IGM between z' and z'' reaches unit
/// optical depth, from the analytic (N_HI sigma_0)^{1/3} column scaling.
pub fn nu_tau_one(zp: f64, zpp: f64, x_e: f64, q_hi: f64, cosmo: &Cosmology) -> f64 {
    let nu_th = E_ION_HI * NU_OVER_EV;
    if zpp <= zp {
        return nu_th;
    }
    // comoving HI column: n_H0 (1-x_e) Q_HI int c (1+z)^2 / H dz
    let n_steps = 32;
    let dz = (zpp - zp) / n_steps as f64;
    let mut path = 0.0;
    for i in 0..=n_steps {
        let z = zp + dz * i as f64;
        let integrand = C_CGS * (1.0 + z) * (1.0 + z) / cosmo.hubble(z);
        let coeff = if i == 0 || i == n_steps {
            0.5
        } else {
            1.0
        };
        path += coeff * integrand;
    }
    path *= dz;
    let column = cosmo.n_h0 * (1.0 - x_e).max(0.0) * q_hi.clamp(0.0, 1.0) * path;
    let tau0 = column * SIGMA_HI;
    if tau0 <= 1.0 {
        nu_th
    } else {
        nu_th * tau0.cbrt()
    }
}

/// Gunn-Peterson optical depth at line centre.
pub fn taugp(z: f64, delta: f64, x_e: f64, cosmo: &Cosmology) -> f64 {
    1.342881e-7 / cosmo.hubble(z) * cosmo.n_h(z) * (1.0 + delta).max(0.0) * (1.0 - x_e).max(0.0)
}

/// Which Lyman-alpha heating channel is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LyaChannel {
    Continuum,
    Injected,
}

/// Mean energy exchanged per scattered Lyman-alpha photon (erg).
///
/// Positive values heat. Smooth stand-in for the tabulated scattering
/// integrals: continuum photons heat with an efficiency growing with the
/// Gunn-Peterson depth and falling with Tk; injected photons cool at a
/// fraction of that scale.
pub fn energy_lya_heating(tk: f64, ts: f64, tau_gp: f64, channel: LyaChannel) -> f64 {
    let tk = tk.max(0.1);
    let eta = (tau_gp.max(0.0) / 6.0e5).cbrt() / tk.powf(2.0 / 3.0);
    let e_cont = K_B * tk * eta / (1.0 + eta);
    match channel {
        LyaChannel::Continuum => e_cont,
        LyaChannel::Injected => -0.6 * e_cont * (ts.max(0.1) / tk).min(2.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reion_types::config::CosmoParams;

    fn cosmo() -> Cosmology {
        Cosmology::new(&CosmoParams::default())
    }

    #[test]
    fn test_nu_n_ladder() {
        assert!((nu_n(2) - 0.75 * NU_ION).abs() / NU_ION < 1e-12);
        for n in 2..NSPEC_MAX {
            assert!(nu_n(n + 1) > nu_n(n), "Lyman ladder ascends");
        }
        assert!(nu_n(NSPEC_MAX) < NU_ION);
    }

    #[test]
    fn test_zmax_above_z() {
        for n in 2..10 {
            assert!(zmax(12.0, n) > 12.0);
        }
        // higher n have narrower redshift windows
        assert!(zmax(12.0, 10) < zmax(12.0, 2));
    }

    #[test]
    fn test_frecycle_values() {
        assert!((frecycle(2) - 1.0).abs() < 1e-12);
        assert_eq!(frecycle(3), 0.0);
        assert!((frecycle(4) - 0.2609).abs() < 1e-12);
        assert_eq!(frecycle(40), 0.0, "beyond the table");
    }

    #[test]
    fn test_band_emissivity_total() {
        // Full band integrates back to the population total.
        let total = band_emissivity(X_LYA, X_LIMIT, StellarPop::Pop2);
        assert!(
            (total - N_LYMAN_POP2).abs() / N_LYMAN_POP2 < 1e-6,
            "band total {total}"
        );
    }

    #[test]
    fn test_deposition_fractions_partition() {
        for x_e in [1e-4, 1e-2, 0.1, 0.9] {
            let (h, i, l) = (f_heat(x_e), f_ion(x_e), f_excite(x_e));
            assert!(h > 0.0 && i >= 0.0 && l >= 0.0);
            assert!(h + i + l < 1.3, "fits stay near unity at x_e = {x_e}");
        }
        // fully ionised gas: all heat
        assert!(f_heat(0.999) > 0.95);
        assert!(f_ion(0.999) < 0.01);
    }

    #[test]
    fn test_integrate_over_nu_behaviour() {
        let c = cosmo();
        let heat = integrate_over_nu(0.01, 0.0, 500.0, 1.0, &c, NuIntegralMode::Heat);
        let ion = integrate_over_nu(0.01, 0.0, 500.0, 1.0, &c, NuIntegralMode::Ionisation);
        let lya = integrate_over_nu(0.01, 0.0, 500.0, 1.0, &c, NuIntegralMode::LymanAlpha);
        assert!(heat > 0.0 && ion > 0.0 && lya > 0.0);
        assert!(heat.is_finite() && ion.is_finite() && lya.is_finite());

        // A harder lower cutoff removes absorption.
        let heat_hard = integrate_over_nu(
            0.01,
            1500.0 * NU_OVER_EV,
            500.0,
            1.0,
            &c,
            NuIntegralMode::Heat,
        );
        assert!(heat_hard < heat);
    }

    #[test]
    fn test_nu_tau_one_limits() {
        let c = cosmo();
        let nu_th = E_ION_HI * NU_OVER_EV;
        // No path: threshold.
        assert!((nu_tau_one(12.0, 12.0, 1e-4, 1.0, &c) - nu_th).abs() < 1.0);
        // A long neutral path hardens the limit.
        let nu1 = nu_tau_one(12.0, 14.0, 1e-4, 1.0, &c);
        let nu2 = nu_tau_one(12.0, 20.0, 1e-4, 1.0, &c);
        assert!(nu1 > nu_th && nu2 > nu1);
        // Ionised IGM is transparent.
        let nu3 = nu_tau_one(12.0, 20.0, 0.999, 0.0, &c);
        assert!((nu3 - nu_th).abs() < 1.0);
    }

    #[test]
    fn test_taugp_scales_with_density() {
        let c = cosmo();
        let t0 = taugp(10.0, 0.0, 1e-4, &c);
        let t1 = taugp(10.0, 1.0, 1e-4, &c);
        assert!(t0 > 1e4, "the GP depth is large at high z: {t0}");
        assert!((t1 / t0 - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_lya_heating_signs() {
        let c = cosmo();
        let tau = taugp(15.0, 0.0, 1e-4, &c);
        let cont = energy_lya_heating(10.0, 8.0, tau, LyaChannel::Continuum);
        let inj = energy_lya_heating(10.0, 8.0, tau, LyaChannel::Injected);
        assert!(cont > 0.0, "continuum heats");
        assert!(inj < 0.0, "injected cools");
        assert!(cont.is_finite() && inj.is_finite());
    }
}

// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Recombinations
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Sub-grid recombination rate for the inhomogeneous-recombination
//! budget. Stand-in for the tabulated density-distribution integrals:
//! case-B recombination at 1e4 K with a redshift-dependent clumping
//! factor and a weak photo-ionisation-rate dependence from the
//! self-shielding threshold.

use crate::cosmology::Cosmology;
use crate::thermochem::alpha_b;

/// Recombinations per baryon per second at effective redshift `z_eff`.
pub fn recombination_rate(z_eff: f64, gamma12: f64, cosmo: &Cosmology) -> f64 {
    if z_eff <= 0.0 {
        return 0.0;
    }
    let clumping = (2.9 * ((1.0 + z_eff) / 7.0).powf(-1.1)).max(1.0);
    let gamma_factor = gamma12.clamp(1e-10, 1e3).powf(0.3);
    clumping * alpha_b(1e4) * cosmo.n_h(z_eff) * gamma_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use reion_types::config::CosmoParams;

    fn cosmo() -> Cosmology {
        Cosmology::new(&CosmoParams::default())
    }

    #[test]
    fn test_rate_positive_and_density_scaled() {
        let c = cosmo();
        let r6 = recombination_rate(6.0, 1.0, &c);
        let r10 = recombination_rate(10.0, 1.0, &c);
        assert!(r6 > 0.0 && r10 > 0.0);
        // density wins over the falling clumping factor
        assert!(r10 > r6);
    }

    #[test]
    fn test_rate_grows_with_gamma() {
        let c = cosmo();
        let weak = recombination_rate(7.0, 0.01, &c);
        let strong = recombination_rate(7.0, 1.0, &c);
        assert!(strong > weak);
    }

    #[test]
    fn test_rate_finite_for_zero_gamma() {
        let c = cosmo();
        let r = recombination_rate(7.0, 0.0, &c);
        assert!(r.is_finite() && r >= 0.0);
    }
}

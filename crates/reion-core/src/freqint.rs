// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Frequency-Integral Tables
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! X-ray heating / ionisation / Lyman-alpha frequency integrals on the
//! (x_e ladder) x (shell) grid, with per-bin differences stored for the
//! in-loop linear interpolation. The ladder is irregular, so each cell's
//! bin index and interpolation weight are precomputed once per snapshot.

use ndarray::Array2;
use reion_astro::cosmology::Cosmology;
use reion_astro::spectral::{integrate_over_nu, nu_tau_one, NuIntegralMode};
use reion_types::config::AstroParams;
use reion_types::constants::{N_XHII, NU_OVER_EV, X_INT_XHII};
use reion_types::error::{ReionError, ReionResult};

use crate::shells::ShellSchedule;

/// Heating, ionisation and Lyman-alpha integrals per (x_e, shell).
#[derive(Debug, Clone)]
pub struct FreqIntTables {
    pub heat: Array2<f64>,
    pub ion: Array2<f64>,
    pub lya: Array2<f64>,
    /// Forward differences along the x_e axis: diff[i] = t[i+1] - t[i].
    pub heat_diff: Array2<f64>,
    pub ion_diff: Array2<f64>,
    pub lya_diff: Array2<f64>,
    /// 1 / (x[i+1] - x[i]) for the irregular ladder.
    pub inverse_diff: [f64; N_XHII - 1],
}

impl FreqIntTables {
    /// Build the tables for one snapshot.
    ///
    /// `x_e_ave` is the previous snapshot's mean ionised fraction and
    /// `q_hi` the neutral filling factor entering the tau = 1 limit.
    pub fn build(
        zp: f64,
        schedule: &ShellSchedule,
        x_e_ave: f64,
        q_hi: f64,
        astro: &AstroParams,
        cosmo: &Cosmology,
    ) -> ReionResult<Self> {
        let n_shells = schedule.len();
        let mut heat = Array2::zeros((N_XHII, n_shells));
        let mut ion = Array2::zeros((N_XHII, n_shells));
        let mut lya = Array2::zeros((N_XHII, n_shells));

        for (k, shell) in schedule.shells.iter().enumerate() {
            let lower = nu_tau_one(zp, shell.zpp, x_e_ave, q_hi, cosmo)
                .max(astro.nu_x_thresh * NU_OVER_EV);
            for (i, &x) in X_INT_XHII.iter().enumerate() {
                heat[[i, k]] = integrate_over_nu(
                    x,
                    lower,
                    astro.nu_x_thresh,
                    astro.x_ray_spec_index,
                    cosmo,
                    NuIntegralMode::Heat,
                );
                ion[[i, k]] = integrate_over_nu(
                    x,
                    lower,
                    astro.nu_x_thresh,
                    astro.x_ray_spec_index,
                    cosmo,
                    NuIntegralMode::Ionisation,
                );
                lya[[i, k]] = integrate_over_nu(
                    x,
                    lower,
                    astro.nu_x_thresh,
                    astro.x_ray_spec_index,
                    cosmo,
                    NuIntegralMode::LymanAlpha,
                );
            }
        }

        for table in [&heat, &ion, &lya] {
            if table.iter().any(|v| !v.is_finite()) {
                return Err(ReionError::TableGeneration(
                    "frequency-integral table".to_string(),
                ));
            }
        }

        let diff_of = |t: &Array2<f64>| {
            let mut d = Array2::zeros((N_XHII, n_shells));
            for i in 0..N_XHII - 1 {
                for k in 0..n_shells {
                    d[[i, k]] = t[[i + 1, k]] - t[[i, k]];
                }
            }
            d
        };
        let heat_diff = diff_of(&heat);
        let ion_diff = diff_of(&ion);
        let lya_diff = diff_of(&lya);

        let mut inverse_diff = [0.0; N_XHII - 1];
        for i in 0..N_XHII - 1 {
            inverse_diff[i] = 1.0 / (X_INT_XHII[i + 1] - X_INT_XHII[i]);
        }

        Ok(FreqIntTables {
            heat,
            ion,
            lya,
            heat_diff,
            ion_diff,
            lya_diff,
            inverse_diff,
        })
    }

    /// Interpolated heat integral for a cell with precomputed index/weight.
    #[inline]
    pub fn heat_at(&self, xidx: usize, ival: f64, k: usize) -> f64 {
        self.heat_diff[[xidx, k]] * ival + self.heat[[xidx, k]]
    }

    #[inline]
    pub fn ion_at(&self, xidx: usize, ival: f64, k: usize) -> f64 {
        self.ion_diff[[xidx, k]] * ival + self.ion[[xidx, k]]
    }

    #[inline]
    pub fn lya_at(&self, xidx: usize, ival: f64, k: usize) -> f64 {
        self.lya_diff[[xidx, k]] * ival + self.lya[[xidx, k]]
    }
}

/// Clamp a cell's x_e into the tabulated range.
#[inline]
pub fn clamp_xhii(x: f64) -> f64 {
    let lo = X_INT_XHII[0] * 1.001;
    let hi = X_INT_XHII[N_XHII - 1] * 0.999;
    x.clamp(lo, hi)
}

/// Ladder bin containing x (x already clamped).
#[inline]
pub fn locate_xhii_index(x: f64) -> usize {
    let mut idx = 0;
    while idx < N_XHII - 2 && x >= X_INT_XHII[idx + 1] {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use reion_types::config::SimulationConfig;
    use reion_types::state::Grid3;

    use crate::shells::ShellSchedule;

    fn tables() -> (FreqIntTables, ShellSchedule) {
        let mut config = SimulationConfig::default();
        config.user.hii_dim = 16;
        config.user.box_len = 100.0;
        config.user.n_shells = 12;
        let grid = Grid3::from_params(&config.user);
        let cosmo = Cosmology::new(&config.cosmo);
        let sched = ShellSchedule::build(12.0, &grid, &config, &cosmo);
        let t = FreqIntTables::build(12.0, &sched, 2e-4, 1.0, &config.astro, &cosmo).unwrap();
        (t, sched)
    }

    #[test]
    fn test_tables_finite_and_positive() {
        let (t, sched) = tables();
        assert_eq!(t.heat.dim(), (N_XHII, sched.len()));
        for v in t.heat.iter().chain(t.ion.iter()).chain(t.lya.iter()) {
            assert!(v.is_finite() && *v >= 0.0);
        }
    }

    #[test]
    fn test_diff_consistency() {
        let (t, sched) = tables();
        for k in 0..sched.len() {
            for i in 0..N_XHII - 1 {
                let expect = t.heat[[i + 1, k]] - t.heat[[i, k]];
                assert!((t.heat_diff[[i, k]] - expect).abs() < 1e-12 * expect.abs().max(1e-30));
            }
        }
    }

    #[test]
    fn test_interpolation_endpoints() {
        let (t, _) = tables();
        // ival = 0 reproduces the lower node, ival = 1 the upper.
        let k = 0;
        for i in 0..N_XHII - 1 {
            assert!((t.heat_at(i, 0.0, k) - t.heat[[i, k]]).abs() < 1e-14);
            assert!((t.heat_at(i, 1.0, k) - t.heat[[i + 1, k]]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_heating_fraction_grows_with_xe() {
        let (t, _) = tables();
        // More ionised gas deposits more energy as heat.
        let k = 0;
        assert!(t.heat[[N_XHII - 1, k]] > t.heat[[0, k]]);
        // while secondary ionisations die away.
        assert!(t.ion[[N_XHII - 1, k]] < t.ion[[0, k]]);
    }

    #[test]
    fn test_locate_xhii_index() {
        assert_eq!(locate_xhii_index(clamp_xhii(0.0)), 0);
        assert_eq!(locate_xhii_index(5e-4), 2);
        let idx = locate_xhii_index(clamp_xhii(1.0));
        assert_eq!(idx, N_XHII - 2);
        for (i, w) in X_INT_XHII.windows(2).enumerate() {
            let mid = 0.5 * (w[0] + w[1]);
            assert_eq!(locate_xhii_index(mid), i);
        }
    }
}

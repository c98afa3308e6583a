// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Shell Geometry
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Shell schedule and Lyman-series spectral prefactors for the
//! spin-temperature engine.
//!
//! For the snapshot redshift z', shell k samples sources in the annulus
//! [R_{k-1}, R_k] whose light was emitted at the shell redshift z''_k.
//! Radii grow geometrically from the cell scale to `r_xly_max`; emission
//! redshifts grow with radius along the light cone.

use log::debug;
use reion_astro::cosmology::Cosmology;
use reion_astro::hmf::minimum_source_mass;
use reion_astro::spectral::{
    band_emissivity, frecycle, nu_n, spectral_emissivity, zmax, StellarPop,
};
use reion_types::config::SimulationConfig;
use reion_types::constants::{CM_PER_MPC, E_ION_HI, E_LW_THRESH, L_FACTOR, NSPEC_MAX, NU_ION};
use reion_types::state::Grid3;

/// One spherical shell of the radiation sampling schedule.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    /// Outer radius (comoving Mpc).
    pub r: f64,
    /// Midpoint emission redshift.
    pub zpp: f64,
    /// Far-edge redshift of the shell.
    pub zpp_edge: f64,
    /// Redshift width of the shell (positive).
    pub dzpp: f64,
    /// |dt/dz| at the midpoint (s).
    pub dtdz: f64,
    /// Growth factor at the midpoint.
    pub growth: f64,
    /// Smallest source mass at the midpoint (Msun).
    pub m_min: f64,
    /// Lagrangian mass of the shell radius (Msun).
    pub m_max: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
}

/// The full schedule, set once per snapshot.
#[derive(Debug, Clone)]
pub struct ShellSchedule {
    pub shells: Vec<ShellSpec>,
}

impl ShellSchedule {
    pub fn build(zp: f64, grid: &Grid3, config: &SimulationConfig, cosmo: &Cosmology) -> Self {
        let n_shells = config.user.n_shells;
        let r0 = L_FACTOR * grid.cell_len();
        let r_factor = (config.user.r_xly_max / r0).powf(1.0 / (n_shells as f64 - 1.0));

        let mut shells = Vec::with_capacity(n_shells);
        let mut r = r0;
        let mut prev_zpp = zp;
        let mut prev_r = 0.0;
        let mut prev_edge = zp;

        for _ in 0..n_shells {
            // light-travel redshift increment across the annulus
            let dz = (r - prev_r) * CM_PER_MPC / cosmo.drdz(prev_zpp);
            let zpp_edge = prev_zpp + dz;
            let zpp = 0.5 * (zpp_edge + prev_zpp);
            let dzpp = zpp_edge - prev_edge;

            let m_min = minimum_source_mass(zpp, &config.astro, &config.flags, cosmo);
            let m_max = cosmo.rtom(r);

            shells.push(ShellSpec {
                r,
                zpp,
                zpp_edge,
                dzpp,
                dtdz: cosmo.dtdz(zpp),
                growth: cosmo.growth(zpp),
                m_min,
                m_max,
                sigma_min: cosmo.sigma(m_min),
                sigma_max: cosmo.sigma(m_max),
            });

            prev_zpp = zpp_edge;
            prev_edge = zpp_edge;
            prev_r = r;
            r *= r_factor;
        }
        debug!(
            "shell schedule: {} steps, R [{:.3e}, {:.3e}] Mpc, z'' [{:.2}, {:.2}]",
            n_shells,
            shells[0].r,
            shells[n_shells - 1].r,
            shells[0].zpp,
            shells[n_shells - 1].zpp
        );
        ShellSchedule { shells }
    }

    pub fn len(&self) -> usize {
        self.shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }
}

/// Per-shell Lyman-alpha / Lyman-Werner emission prefactors.
///
/// Each entry is the recycled Lyman-series sum weighted by the
/// (1+z')^2 (1+z'') integrand.
#[derive(Debug, Clone)]
pub struct SpectralPrefactors {
    pub starlya: Vec<f64>,
    pub starlya_mini: Vec<f64>,
    pub starlya_cont: Vec<f64>,
    pub starlya_inj: Vec<f64>,
    pub starlya_cont_mini: Vec<f64>,
    pub starlya_inj_mini: Vec<f64>,
    pub star_lw: Vec<f64>,
    pub star_lw_mini: Vec<f64>,
}

struct LymanSums {
    ly2: f64,
    lynto2: f64,
    lw: f64,
}

fn lyman_sums(zp: f64, zpp: f64, pop: StellarPop, f_h2_shield: f64) -> LymanSums {
    let x_lw = E_LW_THRESH / E_ION_HI;
    let mut ly2 = 0.0;
    let mut lynto2 = 0.0;
    let mut lw = 0.0;

    // n = 2: the direct Lyman-alpha ("continuum") term
    if zpp < zmax(zp, 2) {
        let x = nu_n(2) * (1.0 + zpp) / ((1.0 + zp) * NU_ION);
        ly2 = frecycle(2) * spectral_emissivity(x, pop);
        let x_clamped = x.max(x_lw);
        let x_next = nu_n(3) / NU_ION;
        if x_clamped < x_next {
            lw += (1.0 - f_h2_shield) * band_emissivity(x_clamped, x_next, pop);
        }
    }

    // n >= 3: recycled into Lyman-alpha on the spot ("injected")
    for n in 3..=NSPEC_MAX {
        if zpp > zmax(zp, n) {
            continue;
        }
        let x = nu_n(n) * (1.0 + zpp) / ((1.0 + zp) * NU_ION);
        lynto2 += frecycle(n) * spectral_emissivity(x, pop);

        let x_clamped = x.max(x_lw);
        let x_next = nu_n(n + 1) / NU_ION;
        if x_clamped < x_next {
            lw += (1.0 - f_h2_shield) * band_emissivity(x_clamped, x_next, pop);
        }
    }

    LymanSums { ly2, lynto2, lw }
}

impl SpectralPrefactors {
    pub fn build(zp: f64, schedule: &ShellSchedule, config: &SimulationConfig) -> Self {
        let n = schedule.len();
        let use_mini = config.flags.use_mini_halos;
        let f_shield = config.astro.f_h2_shield;
        let n_sub = config.user.edge_weight_subsamples.max(2);

        let mut out = SpectralPrefactors {
            starlya: vec![0.0; n],
            starlya_mini: vec![0.0; n],
            starlya_cont: vec![0.0; n],
            starlya_inj: vec![0.0; n],
            starlya_cont_mini: vec![0.0; n],
            starlya_inj_mini: vec![0.0; n],
            star_lw: vec![0.0; n],
            star_lw_mini: vec![0.0; n],
        };

        let mut first_radii = true;
        let mut prev_zpp = zp;
        let mut prev = LymanSums {
            ly2: 0.0,
            lynto2: 0.0,
            lw: 0.0,
        };
        let mut prev_mini = LymanSums {
            ly2: 0.0,
            lynto2: 0.0,
            lw: 0.0,
        };

        for (k, shell) in schedule.shells.iter().enumerate() {
            let zpp = shell.zpp;
            let mut sums = lyman_sums(zp, zpp, StellarPop::Pop2, f_shield);
            let mut sums_mini = if use_mini {
                lyman_sums(zp, zpp, StellarPop::Pop3, f_shield)
            } else {
                LymanSums {
                    ly2: 0.0,
                    lynto2: 0.0,
                    lw: 0.0,
                }
            };

            // Partial-volume weight at the far edge of the Lyman horizon:
            // when this shell has fallen entirely past z_max but the
            // previous one had signal, scan sub-intervals for the first
            // redshift with no contributing n and weight the previous
            // shell's sums by that volume fraction.
            let total = sums.ly2 + sums.lynto2;
            let prev_total = prev.ly2 + prev.lynto2;
            if k > 1 && total == 0.0 && prev_total > 0.0 && first_radii {
                let mut weight = 1.0;
                for ii in 0..n_sub {
                    let trial = prev_zpp + (zpp - prev_zpp) * ii as f64 / (n_sub as f64 - 1.0);
                    let contributes = (2..=NSPEC_MAX).any(|nn| trial <= zmax(zp, nn));
                    if !contributes {
                        weight = ii as f64 / n_sub as f64;
                        break;
                    }
                }
                sums.ly2 = weight * prev.ly2;
                sums.lynto2 = weight * prev.lynto2;
                if use_mini {
                    sums_mini.ly2 = weight * prev_mini.ly2;
                    sums_mini.lynto2 = weight * prev_mini.lynto2;
                }
                first_radii = false;
            }

            let integrand = (1.0 + zp).powi(2) * (1.0 + zpp);
            out.starlya[k] = integrand * (sums.ly2 + sums.lynto2);
            out.starlya_cont[k] = integrand * sums.ly2;
            out.starlya_inj[k] = integrand * sums.lynto2;
            out.star_lw[k] = integrand * sums.lw;
            if use_mini {
                out.starlya_mini[k] = integrand * (sums_mini.ly2 + sums_mini.lynto2);
                out.starlya_cont_mini[k] = integrand * sums_mini.ly2;
                out.starlya_inj_mini[k] = integrand * sums_mini.lynto2;
                out.star_lw_mini[k] = integrand * sums_mini.lw;
            }

            prev = sums;
            prev_mini = sums_mini;
            prev_zpp = zpp;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reion_types::config::SimulationConfig;

    fn setup() -> (SimulationConfig, Grid3, Cosmology) {
        let mut config = SimulationConfig::default();
        config.user.hii_dim = 32;
        config.user.box_len = 200.0;
        config.user.n_shells = 30;
        let grid = Grid3::from_params(&config.user);
        let cosmo = Cosmology::new(&config.cosmo);
        (config, grid, cosmo)
    }

    #[test]
    fn test_shell_monotonicity() {
        let (config, grid, cosmo) = setup();
        let sched = ShellSchedule::build(12.0, &grid, &config, &cosmo);
        assert_eq!(sched.len(), 30);
        for w in sched.shells.windows(2) {
            assert!(w[1].r > w[0].r, "radii must strictly increase");
            assert!(
                w[1].zpp > w[0].zpp,
                "emission redshifts recede with distance"
            );
        }
        assert!(sched.shells[0].zpp > 12.0, "all shells emitted before z'");
    }

    #[test]
    fn test_shell_geometry_anchors() {
        let (config, grid, cosmo) = setup();
        let sched = ShellSchedule::build(12.0, &grid, &config, &cosmo);
        let r0 = L_FACTOR * grid.cell_len();
        assert!((sched.shells[0].r - r0).abs() / r0 < 1e-12);
        let r_last = sched.shells.last().unwrap().r;
        assert!(
            (r_last - config.user.r_xly_max).abs() / config.user.r_xly_max < 1e-9,
            "last radius reaches r_xly_max: {r_last}"
        );
    }

    #[test]
    fn test_shell_masses_consistent() {
        let (config, grid, cosmo) = setup();
        let sched = ShellSchedule::build(12.0, &grid, &config, &cosmo);
        for s in &sched.shells {
            assert!(s.m_max > s.m_min, "shell mass window is non-empty");
            assert!(s.sigma_min > s.sigma_max, "sigma falls with mass");
            assert!(s.dzpp > 0.0 && s.dtdz > 0.0 && s.growth > 0.0);
        }
    }

    #[test]
    fn test_prefactors_positive_then_zero() {
        let (config, grid, cosmo) = setup();
        let zp = 12.0;
        let sched = ShellSchedule::build(zp, &grid, &config, &cosmo);
        let pre = SpectralPrefactors::build(zp, &sched, &config);

        // Nearby shells must carry Lyman-alpha flux.
        assert!(pre.starlya[0] > 0.0);
        // continuum + injected = total
        for k in 0..sched.len() {
            let total = pre.starlya_cont[k] + pre.starlya_inj[k];
            assert!(
                (total - pre.starlya[k]).abs() <= 1e-9 * pre.starlya[k].max(1e-30),
                "split sums to total at shell {k}"
            );
        }
        // Far beyond the Lyman horizon everything is dark.
        let last = sched.len() - 1;
        if sched.shells[last].zpp > zmax(zp, 2) {
            assert_eq!(pre.starlya[last], 0.0);
        }
    }

    #[test]
    fn test_mini_prefactors_only_with_flag() {
        let (mut config, grid, cosmo) = setup();
        let sched = ShellSchedule::build(15.0, &grid, &config, &cosmo);
        let pre = SpectralPrefactors::build(15.0, &sched, &config);
        assert!(pre.starlya_mini.iter().all(|&v| v == 0.0));

        config.flags.use_mini_halos = true;
        config.flags.use_mass_dependent_zeta = true;
        let pre = SpectralPrefactors::build(15.0, &sched, &config);
        assert!(pre.starlya_mini[0] > 0.0, "minihalo channel populated");
    }
}

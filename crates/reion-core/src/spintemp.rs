// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Spin-Temperature Engine
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Shell-integrated radiative transfer for the gas spin temperature.
//!
//! Per snapshot: build the shell schedule and spectral prefactors, fill
//! the frequency-integral tables from the previous mean ionised state,
//! accumulate per-cell X-ray heating / ionisation / Lyman-alpha rates
//! shell by shell, then advance (Tk, x_e) with a backward difference in
//! redshift and close the Wouthuysen-Field fixed point for Ts.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use ndarray::Array3;
use rayon::prelude::*;

use reion_astro::cosmology::Cosmology;
use reion_astro::hmf;
use reion_astro::recfast::{ct_approx, t_recfast, xion_recfast};
use reion_astro::spectral::{energy_lya_heating, taugp, LyaChannel};
use reion_astro::thermochem::{alpha_a, atomic_cooling_threshold, lyman_werner_threshold};
use reion_math::fft::KGrid;
use reion_math::filters::filter_kgrid;
use reion_types::config::SimulationConfig;
use reion_types::constants::*;
use reion_types::error::{ReionError, ReionResult};
use reion_types::state::{Grid3, InitialConditions, PerturbedField, TsBox, XraySourceBox};

use crate::freqint::{clamp_xhii, locate_xhii_index, FreqIntTables};
use crate::shells::{ShellSchedule, SpectralPrefactors};
use crate::tables::{ConditionalTables, TableScope};

/// Snapshot-level constants of the evolution equations.
#[derive(Debug, Clone)]
pub struct TsConsts {
    pub zp: f64,
    /// Redshift step z' - z'_prev (negative).
    pub dzp: f64,
    pub growth_zp: f64,
    pub dgrowth_dzp: f64,
    /// dt/dz at z' (negative, seconds).
    pub dt_dzp: f64,
    pub hubble_zp: f64,
    pub trad: f64,
    pub trad_inv: f64,
    pub ts_prefactor: f64,
    pub xa_tilde_prefactor: f64,
    pub xc_inverse: f64,
    pub dcomp_dzp_prefactor: f64,
    /// Proper baryon number density at z' (1/cm^3).
    pub nb_zp: f64,
    /// Proper hydrogen number density at z' (1/cm^3).
    pub n_zp: f64,
    pub lya_star_prefactor: f64,
    pub volunit_inv: f64,
    pub xray_prefactor: f64,
    pub clumping: f64,
    pub f_h: f64,
    pub f_he: f64,
    /// Comoving hydrogen / baryon number densities (1/cm^3).
    pub n_h0: f64,
    pub n_b0: f64,
    pub use_cmb_heating: bool,
    pub use_lya_heating: bool,
    pub use_mini: bool,
}

impl TsConsts {
    pub fn new(zp: f64, prev_zp: f64, config: &SimulationConfig, cosmo: &Cosmology) -> Self {
        let astro = &config.astro;
        let hubble_zp = cosmo.hubble(zp);
        let trad = T_CMB0 * (1.0 + zp);
        let zp1 = 1.0 + zp;

        // mean photon energy of the X-ray SED band (erg)
        let nu_t = astro.nu_x_thresh * NU_OVER_EV;
        let nu_max = NU_X_BAND_MAX_EV * NU_OVER_EV;
        let alpha = astro.x_ray_spec_index;
        let n_steps = 200;
        let dlnnu = (nu_max / nu_t).ln() / n_steps as f64;
        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..=n_steps {
            let nu = nu_t * (dlnnu * i as f64).exp();
            let sed = (nu / nu_t).powf(-alpha - 1.0) * nu; // d(ln nu) weight
            num += sed * H_PLANCK * nu;
            den += sed;
        }
        let e_mean = num / den;

        let xray_prefactor = S_PER_YR / e_mean * C_CGS * zp1.powf(alpha + 3.0);
        let volunit_inv = if config.flags.use_halo_field {
            CM_PER_MPC.powi(-3)
        } else {
            cosmo.rho_m * (config.cosmo.omb / config.cosmo.omm) * CM_PER_MPC.powi(-3)
        };

        TsConsts {
            zp,
            dzp: zp - prev_zp,
            growth_zp: cosmo.growth(zp),
            dgrowth_dzp: cosmo.dgrowth_dz(zp),
            dt_dzp: -cosmo.dtdz(zp),
            hubble_zp,
            trad,
            trad_inv: 1.0 / trad,
            ts_prefactor: (1e-7 * (1.342881e-7 / hubble_zp) * cosmo.n_h0 * zp1.powi(3)).cbrt(),
            xa_tilde_prefactor: 1.66e11 / zp1,
            xc_inverse: zp1.powi(3) * T21 / (trad * A10_HYPERFINE),
            dcomp_dzp_prefactor: -1.51e-4 / (hubble_zp / H0_FOR_H1) / config.cosmo.hlittle
                * trad.powi(4)
                / zp1,
            nb_zp: cosmo.n_b(zp),
            n_zp: cosmo.n_h(zp),
            lya_star_prefactor: C_CGS / (4.0 * std::f64::consts::PI) * MSUN_G / M_PROTON
                * (1.0 - 0.75 * config.cosmo.y_he)
                / NU_ION,
            volunit_inv,
            xray_prefactor,
            clumping: astro.clumping_factor,
            f_h: cosmo.f_h,
            f_he: cosmo.f_he,
            n_h0: cosmo.n_h0,
            n_b0: cosmo.n_b0,
            use_cmb_heating: config.flags.use_cmb_heating,
            use_lya_heating: config.flags.use_lya_heating,
            use_mini: config.flags.use_mini_halos,
        }
    }
}

/// H0 for h = 1 (1/s); matches the cosmology kernel normalisation.
const H0_FOR_H1: f64 = 3.2407792903e-18;

/// Cell-level radiative inputs to the redshift step.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellRadTerms {
    pub dxheat_dt: f64,
    pub dxion_dt: f64,
    pub dxlya_dt: f64,
    pub dstarlya_dt: f64,
    pub dstarlw_dt: f64,
    pub dstarlya_cont_dt: f64,
    pub dstarlya_inj_dt: f64,
    pub delta: f64,
    pub prev_ts: f64,
    pub prev_tk: f64,
    pub prev_xe: f64,
}

/// Cell outputs of one redshift step.
#[derive(Debug, Clone, Copy)]
pub struct TsCell {
    pub ts: f64,
    pub tk: f64,
    pub x_e: f64,
    pub j_21_lw: f64,
}

/// Advance one cell from z'_prev to z' and close the spin temperature.
pub fn advance_cell(consts: &TsConsts, cosmo: &Cosmology, rad: &CellRadTerms) -> TsCell {
    let zp = consts.zp;
    let dzp = consts.dzp;

    let tau21 = (3.0 * H_PLANCK * A10_HYPERFINE * C_CGS * LAMBDA_21 * LAMBDA_21
        / (32.0 * std::f64::consts::PI * K_B))
        * ((1.0 - rad.prev_xe) * consts.n_zp)
        / rad.prev_ts.max(0.1)
        / consts.hubble_zp;
    let xcmb = if tau21 > 1e-12 {
        (1.0 - (-tau21).exp()) / tau21
    } else {
        1.0
    };

    // free-electron evolution
    let dxion_sink_dt = alpha_a(rad.prev_tk)
        * consts.clumping
        * rad.prev_xe
        * rad.prev_xe
        * consts.f_h
        * consts.nb_zp
        * (1.0 + rad.delta);
    let dxe_dzp = consts.dt_dzp * (rad.dxion_dt - dxion_sink_dt);

    // adiabatic + structure formation
    let mut dadia_dzp = 3.0 / (1.0 + zp);
    if rad.delta.abs() > FRACT_FLOAT_ERR {
        dadia_dzp += consts.dgrowth_dzp / (consts.growth_zp * (1.0 / rad.delta + 1.0));
    }
    dadia_dzp *= (2.0 / 3.0) * rad.prev_tk;

    // changing species
    let dspec_dzp = -dxe_dzp * rad.prev_tk / (1.0 + rad.prev_xe);

    // Compton drag against the CMB
    let dcomp_dzp = consts.dcomp_dzp_prefactor
        * (rad.prev_xe / (1.0 + rad.prev_xe + consts.f_he))
        * (consts.trad - rad.prev_tk);

    // X-ray heating
    let dxheat_dzp = rad.dxheat_dt * consts.dt_dzp * 2.0 / 3.0 / K_B / (1.0 + rad.prev_xe);

    // CMB heating (Meiksin 2021)
    let mut dcmbheat_dzp = 0.0;
    if consts.use_cmb_heating {
        let eps_cmb = 0.75 * (consts.trad / T21)
            * A10_HYPERFINE
            * consts.f_h
            * (H_PLANCK * H_PLANCK / (LAMBDA_21 * LAMBDA_21 * M_PROTON))
            * (1.0 + 2.0 * rad.prev_tk / T21);
        dcmbheat_dzp =
            -eps_cmb * (2.0 / 3.0 / K_B / (1.0 + rad.prev_xe)) / consts.hubble_zp / (1.0 + zp);
    }

    // Lyman-alpha heating, continuum and injected channels
    let mut eps_lya_cont = 0.0;
    let mut eps_lya_inj = 0.0;
    if consts.use_lya_heating {
        let tau_gp = taugp(zp, rad.delta, rad.prev_xe, cosmo);
        let mut e_cont =
            energy_lya_heating(rad.prev_tk, rad.prev_ts, tau_gp, LyaChannel::Continuum);
        let mut e_inj = energy_lya_heating(rad.prev_tk, rad.prev_ts, tau_gp, LyaChannel::Injected);
        if !e_cont.is_finite() {
            e_cont = 0.0;
        }
        if !e_inj.is_finite() {
            e_inj = 0.0;
        }
        let flux_to_ndot = (4.0 * std::f64::consts::PI * NU_LYA)
            / (consts.nb_zp * (1.0 + rad.delta))
            / (1.0 + zp)
            / C_CGS;
        let ndot_cont = flux_to_ndot * rad.dstarlya_cont_dt;
        let ndot_inj = flux_to_ndot * rad.dstarlya_inj_dt;
        eps_lya_cont = -ndot_cont * e_cont * (2.0 / 3.0 / K_B / (1.0 + rad.prev_xe));
        eps_lya_inj = -ndot_inj * e_inj * (2.0 / 3.0 / K_B / (1.0 + rad.prev_xe));
    }

    let mut x_e = rad.prev_xe + dxe_dzp * dzp;
    if x_e > 1.0 {
        x_e = 1.0 - FRACT_FLOAT_ERR;
    } else if x_e < 0.0 {
        x_e = 0.0;
    }

    let mut tk = rad.prev_tk;
    if tk < MAX_TK {
        tk += (dxheat_dzp + dcomp_dzp + dspec_dzp + dadia_dzp + dcmbheat_dzp + eps_lya_cont
            + eps_lya_inj)
            * dzp;
    }
    if tk < 0.0 {
        // underflow of the backward difference, mostly in deep voids
        tk = consts.trad;
    }

    let j_alpha_tot = rad.dstarlya_dt + rad.dxlya_dt;
    let ts = spin_temperature(consts, tk, x_e, rad.delta, xcmb, j_alpha_tot);

    TsCell {
        ts,
        tk,
        x_e,
        j_21_lw: if consts.use_mini { rad.dstarlw_dt } else { 0.0 },
    }
}

/// Wouthuysen-Field fixed point (or the collisional closed form).
fn spin_temperature(
    consts: &TsConsts,
    tk: f64,
    x_e: f64,
    delta: f64,
    xcmb: f64,
    j_alpha_tot: f64,
) -> f64 {
    let t_inv = 1.0 / tk;
    let t_inv_sq = t_inv * t_inv;

    let xc_fast = (1.0 + delta)
        * consts.xc_inverse
        * ((1.0 - x_e) * consts.n_h0 * reion_astro::thermochem::kappa_10(tk)
            + x_e * consts.n_b0 * reion_astro::thermochem::kappa_10_elec(tk)
            + x_e * consts.n_h0 * reion_astro::thermochem::kappa_10_ph(tk));

    let xi_power = consts.ts_prefactor * ((1.0 + delta) * (1.0 - x_e) * t_inv_sq).cbrt();
    let xa_tilde_arg = consts.xa_tilde_prefactor * j_alpha_tot
        / (1.0 + 2.98394 * xi_power + 1.53583 * xi_power * xi_power
            + 3.85289 * xi_power * xi_power * xi_power);

    let mut ts_fast;
    if j_alpha_tot > 1.0e-20 {
        ts_fast = consts.trad;
        let mut ts_old = 0.0;
        let mut iters = 0;
        while ((ts_fast - ts_old) / ts_fast).abs() > 1.0e-3 && iters < 1000 {
            ts_old = ts_fast;
            let xa_tilde = (1.0 - 0.0631789 * t_inv + 0.115995 * t_inv_sq
                - 0.401403 * t_inv / ts_fast
                + 0.336463 * t_inv_sq / ts_fast)
                * xa_tilde_arg;
            ts_fast = (xcmb + xa_tilde + xc_fast)
                / (xcmb * consts.trad_inv
                    + xa_tilde * (t_inv + 0.405535 * t_inv / ts_fast - 0.405535 * t_inv_sq)
                    + xc_fast * t_inv);
            iters += 1;
        }
    } else {
        ts_fast = (xcmb + xc_fast) / (xcmb * consts.trad_inv + xc_fast * t_inv);
    }

    if ts_fast < 0.0 {
        // rare sign flip of the WF iteration; magnitude is what matters
        ts_fast = ts_fast.abs();
    }
    ts_fast
}

/// Closed-form collisional spin temperature with no Lyman-alpha flux.
pub fn collisional_ts(zp: f64, delta: f64, tk: f64, x_e: f64, cosmo: &Cosmology) -> f64 {
    let trad = T_CMB0 * (1.0 + zp);
    let hubble_zp = cosmo.hubble(zp);
    let xc_inverse = (1.0 + zp).powi(3) * T21 / (trad * A10_HYPERFINE);

    let mut ts = tk.max(1.0);
    for _ in 0..5 {
        let tau21 = (3.0 * H_PLANCK * A10_HYPERFINE * C_CGS * LAMBDA_21 * LAMBDA_21
            / (32.0 * std::f64::consts::PI * K_B))
            * ((1.0 - x_e) * cosmo.n_h(zp))
            / ts
            / hubble_zp;
        let xcmb = (1.0 - (-tau21).exp()) / tau21;
        let xc = (1.0 + delta)
            * xc_inverse
            * ((1.0 - x_e) * cosmo.n_h0 * reion_astro::thermochem::kappa_10(tk)
                + x_e * cosmo.n_b0 * reion_astro::thermochem::kappa_10_elec(tk)
                + x_e * cosmo.n_h0 * reion_astro::thermochem::kappa_10_ph(tk));
        ts = (xcmb + xc) / (xcmb / trad + xc / tk);
    }
    ts
}

/// Seed box above Z_HEAT_MAX from the Recfast fits.
fn init_first_ts(zp: f64, cosmo: &Cosmology, grid: &Grid3, perturb: &PerturbedField) -> TsBox {
    let mut out = TsBox::new(grid, zp);
    let tk = t_recfast(zp);
    let xe = xion_recfast(zp);
    let ct = ct_approx(zp);
    let growth_ratio = cosmo.growth(zp) / cosmo.growth(perturb.redshift);

    let dens = perturb.density.as_slice().expect("standard layout");
    let ts_s = out.ts.as_slice_mut().expect("standard layout");
    let tk_s = out.tk.as_slice_mut().expect("standard layout");
    let xe_s = out.x_e.as_slice_mut().expect("standard layout");

    ts_s.par_iter_mut()
        .zip(tk_s.par_iter_mut())
        .zip(xe_s.par_iter_mut())
        .zip(dens.par_iter())
        .for_each(|(((ts_v, tk_v), xe_v), &d)| {
            let gdens = d * growth_ratio;
            let tk_cell = tk * (1.0 + ct * gdens);
            *tk_v = tk_cell.max(0.1);
            *xe_v = xe;
            *ts_v = collisional_ts(zp, gdens, *tk_v, xe, cosmo);
        });

    out
}

/// Compute the spin-temperature box for one snapshot.
#[allow(clippy::too_many_arguments)]
pub fn compute_spin_temperature(
    redshift: f64,
    prev_redshift: f64,
    config: &SimulationConfig,
    ini: &InitialConditions,
    perturb: &PerturbedField,
    prev_ts: Option<&TsBox>,
    source_box: Option<&XraySourceBox>,
) -> ReionResult<TsBox> {
    config.validate()?;
    let cosmo = Cosmology::new(&config.cosmo);
    let grid = Grid3::from_params(&config.user);
    let n_cells = grid.total_cells();

    if redshift >= config.cosmo.z_heat_max || prev_ts.is_none() {
        debug!("seeding spin temperature at z = {redshift:.2} from the global fits");
        return Ok(init_first_ts(redshift, &cosmo, &grid, perturb));
    }
    let prev = prev_ts.expect("checked above");

    if config.flags.use_halo_field && source_box.is_none() {
        return Err(ReionError::Value(
            "use_halo_field spin temperature requires an X-ray source box".into(),
        ));
    }

    let schedule = ShellSchedule::build(redshift, &grid, config, &cosmo);
    let prefactors = SpectralPrefactors::build(redshift, &schedule, config);
    let consts = TsConsts::new(redshift, prev_redshift, config, &cosmo);
    let n_shells = schedule.len();

    let inv_growth_z = 1.0 / cosmo.growth(perturb.redshift);

    // ── filtered source grids (no-halo path) ─────────────────────────
    let mut delta_shell_grids: Vec<Array3<f64>> = Vec::new();
    let mut mcrit_shell_grids: Vec<Array3<f64>> = Vec::new();
    let mut min_densities = vec![0.0; n_shells];
    let mut max_densities = vec![0.0; n_shells];
    let mut ave_mcrit_lw = vec![0.0; n_shells];
    let mut delta_k: Option<KGrid> = None;
    let mut mcrit_k: Option<KGrid> = None;

    if !config.flags.use_halo_field {
        let dk = KGrid::forward(&perturb.density, grid.box_len, grid.box_len_z);
        if config.flags.use_mini_halos {
            let vcb_const = if config.flags.fix_vcb_avg {
                ini.vcb_avg
            } else {
                0.0
            };
            let mcrit_grid = Array3::from_shape_fn(grid.shape(), |idx| {
                let vcb = if config.flags.use_relative_velocities && !config.flags.fix_vcb_avg {
                    ini.lowres_vcb[idx]
                } else {
                    vcb_const
                };
                lyman_werner_threshold(redshift, prev.j_21_lw[idx], vcb, &config.astro, &cosmo)
                    .log10()
            });
            mcrit_k = Some(KGrid::forward(&mcrit_grid, grid.box_len, grid.box_len_z));
        }

        let cell_r = L_FACTOR * grid.cell_len();
        let mcrit_floor = lyman_werner_threshold(redshift, 0.0, 0.0, &config.astro, &cosmo)
            .log10();
        for (k, shell) in schedule.shells.iter().enumerate() {
            if config.user.minimize_memory {
                // bounds from the unfiltered grid; filtering never widens them
                let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
                for &d in perturb.density.iter() {
                    let v = d * inv_growth_z;
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
                min_densities[k] = lo;
                max_densities[k] = hi;
                ave_mcrit_lw[k] = mcrit_floor;
                continue;
            }
            let mut scratch = dk.clone();
            if shell.r > cell_r {
                filter_kgrid(&mut scratch, config.flags.heat_filter, shell.r, 0.0);
            }
            let mut real = scratch.inverse();
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for v in real.iter_mut() {
                if *v < -1.0 {
                    *v = -1.0;
                }
                *v *= inv_growth_z;
                lo = lo.min(*v);
                hi = hi.max(*v);
            }
            min_densities[k] = lo;
            max_densities[k] = hi;
            delta_shell_grids.push(real);

            if let Some(mk) = &mcrit_k {
                let mut scratch = mk.clone();
                if shell.r > cell_r {
                    filter_kgrid(&mut scratch, config.flags.heat_filter, shell.r, 0.0);
                }
                let mut real = scratch.inverse();
                let mut sum = 0.0;
                for v in real.iter_mut() {
                    if *v < mcrit_floor {
                        *v = mcrit_floor;
                    }
                    sum += *v;
                }
                ave_mcrit_lw[k] = sum / n_cells as f64;
                mcrit_shell_grids.push(real);
            }
        }
        delta_k = Some(dk);
    } else if let Some(sb) = source_box {
        ave_mcrit_lw.copy_from_slice(&sb.mean_log10_mcrit_lw);
    }

    // ── global expectations ──────────────────────────────────────────
    let x_e_ave: f64 = prev.x_e.iter().sum::<f64>() / n_cells as f64;

    let m_min_global = schedule.shells.last().expect("non-empty").m_min;
    let ln_m_min = m_min_global.ln();
    let ln_m_max = hmf::ln_m_max_global();
    let astro = &config.astro;

    let (sum_nion, q_hi) = if config.flags.use_mass_dependent_zeta {
        let mturn = if config.flags.use_mini_halos {
            atomic_cooling_threshold(redshift, &cosmo)
        } else {
            astro.m_turn
        };
        let nion = hmf::nion_general(
            &cosmo,
            redshift,
            ln_m_min,
            ln_m_max,
            mturn,
            astro.alpha_star,
            astro.alpha_esc,
            astro.f_star10,
            astro.f_esc10,
        );
        let mut total = nion * astro.pop2_ion;
        if config.flags.use_mini_halos {
            total += hmf::nion_general_mini(
                &cosmo,
                redshift,
                ln_m_min,
                ln_m_max,
                10f64.powf(ave_mcrit_lw[0]).max(1.0),
                mturn,
                astro.alpha_star_mini,
                astro.alpha_esc,
                astro.f_star7_mini,
                astro.f_esc7_mini,
            ) * astro.pop3_ion;
        }
        (total, (1.0 - total / (1.0 - x_e_ave)).clamp(0.0, 1.0))
    } else {
        let fcoll = hmf::fcoll_general(&cosmo, redshift, ln_m_min, ln_m_max);
        let total = fcoll * astro.hii_eff_factor;
        (total, (1.0 - total / (1.0 - x_e_ave)).clamp(0.0, 1.0))
    };
    let no_light = sum_nion <= 1e-15;

    let mut mean_sfrd_zpp = vec![0.0; n_shells];
    let mut mean_sfrd_zpp_mini = vec![0.0; n_shells];
    for (k, shell) in schedule.shells.iter().enumerate() {
        let mturn = if config.flags.use_mini_halos {
            atomic_cooling_threshold(shell.zpp, &cosmo)
        } else {
            astro.m_turn
        };
        mean_sfrd_zpp[k] = hmf::sfrd_general(
            &cosmo,
            shell.zpp,
            shell.m_min.ln(),
            ln_m_max,
            mturn,
            astro.alpha_star,
            astro.f_star10,
        );
        if config.flags.use_mini_halos {
            mean_sfrd_zpp_mini[k] = hmf::sfrd_general_mini(
                &cosmo,
                shell.zpp,
                shell.m_min.ln(),
                ln_m_max,
                10f64.powf(ave_mcrit_lw[k]).max(1.0),
                mturn,
                astro.alpha_star_mini,
                astro.f_star7_mini,
            );
        }
    }

    let freq_tables = FreqIntTables::build(redshift, &schedule, x_e_ave, q_hi, astro, &cosmo)?;

    // ── per-cell interpolation helpers and rate accumulators ─────────
    let prev_xe = prev.x_e.as_slice().expect("standard layout");
    let mut xidx_box = vec![0usize; n_cells];
    let mut ival_box = vec![0.0f64; n_cells];
    xidx_box
        .par_iter_mut()
        .zip(ival_box.par_iter_mut())
        .zip(prev_xe.par_iter())
        .for_each(|((xi, iv), &xe)| {
            let x = clamp_xhii(xe);
            let idx = locate_xhii_index(x);
            *xi = idx;
            *iv = (x - X_INT_XHII[idx]) * freq_tables.inverse_diff[idx];
        });

    let mut dxheat = vec![0.0f64; n_cells];
    let mut dxion = vec![0.0f64; n_cells];
    let mut dxlya = vec![0.0f64; n_cells];
    let mut dstarlya = vec![0.0f64; n_cells];
    let mut dstarlw = vec![0.0f64; n_cells];
    let mut dstarlya_cont = vec![0.0f64; n_cells];
    let mut dstarlya_inj = vec![0.0f64; n_cells];

    // ── shell loop: accumulate per-cell rates ────────────────────────
    if !no_light {
        let mut sfrd_grid = vec![0.0f64; n_cells];
        let mut sfrd_grid_mini = vec![0.0f64; n_cells];

        for k in (0..n_shells).rev() {
            let shell = &schedule.shells[k];
            let zpp = shell.zpp;
            let z_edge_factor = if config.flags.use_halo_field {
                (shell.dzpp * shell.dtdz).abs()
            } else if config.flags.use_mass_dependent_zeta {
                (shell.dzpp * shell.dtdz).abs() * cosmo.hubble(zpp) / astro.t_star
            } else {
                shell.dzpp
            };
            let xray_r_factor = (1.0 + zpp).powf(-astro.x_ray_spec_index);

            let mut avg_fix = 1.0;
            let mut avg_fix_mini = 1.0;

            if !config.flags.use_halo_field {
                // filter on demand when the full stack is not stored
                let mut delta_store: Option<Array3<f64>> = None;
                let mut mcrit_store: Option<Array3<f64>> = None;
                if config.user.minimize_memory {
                    let cell_r = L_FACTOR * grid.cell_len();
                    let dk = delta_k.as_ref().expect("set above");
                    let mut scratch = dk.clone();
                    if shell.r > cell_r {
                        filter_kgrid(&mut scratch, config.flags.heat_filter, shell.r, 0.0);
                    }
                    let mut real = scratch.inverse();
                    for v in real.iter_mut() {
                        if *v < -1.0 {
                            *v = -1.0;
                        }
                        *v *= inv_growth_z;
                    }
                    delta_store = Some(real);
                    if let Some(mk) = &mcrit_k {
                        let mut scratch = mk.clone();
                        if shell.r > cell_r {
                            filter_kgrid(&mut scratch, config.flags.heat_filter, shell.r, 0.0);
                        }
                        mcrit_store = Some(scratch.inverse());
                    }
                }
                let delta_grid: &Array3<f64> = match &delta_store {
                    Some(g) => g,
                    None => &delta_shell_grids[k],
                };
                let mcrit_grid: Option<&Array3<f64>> = if config.user.minimize_memory {
                    mcrit_store.as_ref()
                } else {
                    mcrit_shell_grids.get(k)
                };

                let (ave_sfrd, ave_sfrd_mini) = calculate_sfrd_from_grid(
                    shell,
                    delta_grid,
                    mcrit_grid,
                    &mut sfrd_grid,
                    &mut sfrd_grid_mini,
                    (min_densities[k], max_densities[k]),
                    config,
                    &cosmo,
                )?;
                if ave_sfrd > 0.0 {
                    avg_fix = mean_sfrd_zpp[k] / ave_sfrd;
                }
                if config.flags.use_mini_halos && ave_sfrd_mini > 0.0 {
                    avg_fix_mini = mean_sfrd_zpp_mini[k] / ave_sfrd_mini;
                }
            }

            let sfr_source: &[f64];
            let sfr_source_mini: &[f64];
            let halo_sfr_slice;
            let halo_sfr_mini_slice;
            if config.flags.use_halo_field {
                let sb = source_box.expect("checked at entry");
                halo_sfr_slice = sb.filtered_sfr[k].as_slice().expect("standard layout");
                sfr_source = halo_sfr_slice;
                if config.flags.use_mini_halos {
                    halo_sfr_mini_slice =
                        sb.filtered_sfr_mini[k].as_slice().expect("standard layout");
                    sfr_source_mini = halo_sfr_mini_slice;
                } else {
                    sfr_source_mini = &[];
                }
            } else {
                sfr_source = &sfrd_grid;
                sfr_source_mini = &sfrd_grid_mini;
            }

            let legacy_fstar = if config.flags.use_mass_dependent_zeta || config.flags.use_halo_field
            {
                1.0
            } else {
                astro.f_star10
            };
            let use_mini = config.flags.use_mini_halos;
            let starlya_k = prefactors.starlya[k];
            let starlya_mini_k = prefactors.starlya_mini[k];
            let star_lw_k = prefactors.star_lw[k];
            let star_lw_mini_k = prefactors.star_lw_mini[k];
            let cont_k = prefactors.starlya_cont[k];
            let inj_k = prefactors.starlya_inj[k];
            let cont_mini_k = prefactors.starlya_cont_mini[k];
            let inj_mini_k = prefactors.starlya_inj_mini[k];
            let l_x = astro.l_x;
            let l_x_mini = astro.l_x_mini;
            let ft = &freq_tables;

            dxheat
                .par_iter_mut()
                .zip(dxion.par_iter_mut())
                .zip(dxlya.par_iter_mut())
                .zip(dstarlya.par_iter_mut())
                .zip(dstarlw.par_iter_mut())
                .zip(dstarlya_cont.par_iter_mut())
                .zip(dstarlya_inj.par_iter_mut())
                .enumerate()
                .for_each(
                    |(ct, ((((((heat, ion), lya), slya), slw), scont), sinj))| {
                        let sfr_term = sfr_source[ct] * z_edge_factor * avg_fix * legacy_fstar;
                        let sfr_term_mini = if use_mini {
                            sfr_source_mini[ct] * z_edge_factor * avg_fix_mini
                        } else {
                            0.0
                        };
                        let xray_sfr = sfr_term * l_x + sfr_term_mini * l_x_mini;
                        let xidx = xidx_box[ct];
                        let ival = ival_box[ct];

                        *heat += xray_sfr * xray_r_factor * ft.heat_at(xidx, ival, k);
                        *ion += xray_sfr * xray_r_factor * ft.ion_at(xidx, ival, k);
                        *lya += xray_sfr * xray_r_factor * ft.lya_at(xidx, ival, k);
                        *slya += sfr_term * starlya_k + sfr_term_mini * starlya_mini_k;
                        if use_mini {
                            *slw += sfr_term * star_lw_k + sfr_term_mini * star_lw_mini_k;
                        }
                        *scont += sfr_term * cont_k + sfr_term_mini * cont_mini_k;
                        *sinj += sfr_term * inj_k + sfr_term_mini * inj_mini_k;
                    },
                );
        }
    }

    // ── R = 0: advance every cell ────────────────────────────────────
    let mut out = TsBox::new(&grid, redshift);
    let growth_factor_zp = consts.growth_zp;
    let dens_slice = perturb.density.as_slice().expect("standard layout");
    let prev_ts_slice = prev.ts.as_slice().expect("standard layout");
    let prev_tk_slice = prev.tk.as_slice().expect("standard layout");

    let nan_flag = AtomicBool::new(false);
    {
        let ts_s = out.ts.as_slice_mut().expect("standard layout");
        let tk_s = out.tk.as_slice_mut().expect("standard layout");
        let xe_s = out.x_e.as_slice_mut().expect("standard layout");
        let jlw_s = out.j_21_lw.as_slice_mut().expect("standard layout");

        ts_s.par_iter_mut()
            .zip(tk_s.par_iter_mut())
            .zip(xe_s.par_iter_mut())
            .zip(jlw_s.par_iter_mut())
            .enumerate()
            .for_each(|(ct, (((ts_v, tk_v), xe_v), jlw_v))| {
                let mut curr_delta = dens_slice[ct] * growth_factor_zp * inv_growth_z;
                if curr_delta <= -1.0 {
                    curr_delta = -1.0 + FRACT_FLOAT_ERR;
                }

                let rad = CellRadTerms {
                    dxheat_dt: dxheat[ct] * consts.xray_prefactor * consts.volunit_inv,
                    dxion_dt: dxion[ct] * consts.xray_prefactor * consts.volunit_inv,
                    dxlya_dt: dxlya[ct]
                        * consts.xray_prefactor
                        * consts.volunit_inv
                        * consts.nb_zp
                        * (1.0 + curr_delta),
                    dstarlya_dt: dstarlya[ct] * consts.lya_star_prefactor * consts.volunit_inv,
                    dstarlw_dt: dstarlw[ct]
                        * consts.lya_star_prefactor
                        * consts.volunit_inv
                        * H_PLANCK
                        * 1e21,
                    dstarlya_cont_dt: dstarlya_cont[ct]
                        * consts.lya_star_prefactor
                        * consts.volunit_inv,
                    dstarlya_inj_dt: dstarlya_inj[ct]
                        * consts.lya_star_prefactor
                        * consts.volunit_inv,
                    delta: curr_delta,
                    prev_ts: prev_ts_slice[ct],
                    prev_tk: prev_tk_slice[ct],
                    prev_xe: prev_xe[ct],
                };

                let cell = advance_cell(&consts, &cosmo, &rad);
                if !cell.ts.is_finite() || !cell.tk.is_finite() || !cell.x_e.is_finite() {
                    nan_flag.store(true, Ordering::Relaxed);
                }
                *ts_v = cell.ts;
                *tk_v = cell.tk;
                *xe_v = cell.x_e;
                *jlw_v = cell.j_21_lw;
            });
    }

    if nan_flag.load(Ordering::Relaxed) {
        return Err(ReionError::InfinityOrNaN {
            field: "Ts",
            stage: "spin-temperature step",
        });
    }

    debug!(
        "spin temperature done at z = {redshift:.2}: <Ts> = {:.3e}, <Tk> = {:.3e}, <x_e> = {:.3e}",
        out.ts.iter().sum::<f64>() / n_cells as f64,
        out.tk.iter().sum::<f64>() / n_cells as f64,
        out.x_e.iter().sum::<f64>() / n_cells as f64,
    );
    Ok(out)
}

/// Convert a filtered density (and turnover) grid into SFR densities.
///
/// Returns the box-average collapsed fractions used for mean-fixing; the
/// average accumulates the plain integral value, without the (1+delta)
/// weight applied to the grid entries.
#[allow(clippy::too_many_arguments)]
fn calculate_sfrd_from_grid(
    shell: &crate::shells::ShellSpec,
    delta_grid: &Array3<f64>,
    mcrit_grid: Option<&Array3<f64>>,
    sfrd_grid: &mut [f64],
    sfrd_grid_mini: &mut [f64],
    density_bounds: (f64, f64),
    config: &SimulationConfig,
    cosmo: &Cosmology,
) -> ReionResult<(f64, f64)> {
    let growth = shell.growth;
    let mturn_acg = if config.flags.use_mini_halos {
        atomic_cooling_threshold(shell.zpp, cosmo)
    } else {
        config.astro.m_turn
    };

    let delta_lo = density_bounds.0 * growth - 0.001;
    let delta_hi = density_bounds.1 * growth + 0.001;

    let scope = TableScope {
        growth,
        z: shell.zpp,
        ln_m_min: shell.m_min.ln(),
        ln_m_cond: shell.m_max.ln(),
        sigma_cond: shell.sigma_max,
        sigma_min: shell.sigma_min,
        mturn_acg,
        delta_range: (delta_lo, delta_hi),
        l10_mturn_mcg_range: (LOG10_MTURN_MIN, LOG10_MTURN_MAX),
        l10_mturn_acg_range: (LOG10_MTURN_MIN, LOG10_MTURN_MAX),
    };

    let tables = if config.flags.use_mass_dependent_zeta {
        ConditionalTables::build_sfrd(&scope, &config.astro, &config.flags, cosmo)?
    } else {
        ConditionalTables::build_fcoll(&scope, cosmo)?
    };

    let delta_slice = delta_grid.as_slice().expect("standard layout");
    let mcrit_slice = mcrit_grid.map(|g| g.as_slice().expect("standard layout"));
    let use_mini = config.flags.use_mini_halos;

    let mut ave = 0.0;
    let mut ave_mini = 0.0;
    for (ct, out) in sfrd_grid.iter_mut().enumerate() {
        let curr_dens = (delta_slice[ct] * growth).clamp(delta_lo, delta_hi);
        if curr_dens <= -1.0 + FRACT_FLOAT_ERR {
            *out = 0.0;
            if use_mini {
                sfrd_grid_mini[ct] = 0.0;
            }
            continue;
        }
        if curr_dens > DELTAC * 0.99 {
            *out = 1.0;
            ave += 1.0;
            if use_mini {
                sfrd_grid_mini[ct] = 1.0;
                ave_mini += 1.0;
            }
            continue;
        }

        if config.flags.use_mass_dependent_zeta {
            let fcoll = tables.sfrd_acg.as_ref().expect("built above").eval(curr_dens);
            *out = (1.0 + curr_dens) * fcoll;
            ave += fcoll;
            if use_mini {
                let l10m = mcrit_slice
                    .map(|m| m[ct])
                    .unwrap_or(LOG10_MTURN_MIN)
                    .clamp(LOG10_MTURN_MIN, LOG10_MTURN_MAX);
                let fcoll_mini = tables
                    .sfrd_mcg
                    .as_ref()
                    .expect("built above")
                    .eval(curr_dens, l10m);
                sfrd_grid_mini[ct] = (1.0 + curr_dens) * fcoll_mini;
                ave_mini += fcoll_mini;
            }
        } else {
            let fcoll = tables.fcoll.as_ref().expect("built above").eval(curr_dens);
            let dfcoll = tables
                .dfcoll_dz
                .as_ref()
                .expect("built above")
                .eval(curr_dens);
            *out = (1.0 + curr_dens) * dfcoll.abs();
            ave += fcoll;
        }
    }

    let n = sfrd_grid.len() as f64;
    Ok((ave / n, ave_mini / n))
}

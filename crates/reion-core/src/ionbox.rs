// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Ionisation Excursion-Set Solver
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Excursion-set reionisation: filter sources and absorbers over a
//! decreasing radius schedule, apply the local ionisation criterion,
//! paint ionised regions, and assign residual neutral fractions,
//! photo-ionisation rates and cumulative recombinations.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use ndarray::Array3;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use rayon::prelude::*;

use reion_astro::cosmology::Cosmology;
use reion_astro::hmf;
use reion_astro::recfast::{ct_approx, t_recfast, xion_recfast};
use reion_astro::recomb::recombination_rate;
use reion_astro::thermochem::{
    atomic_cooling_threshold, fully_ionized_temperature, lyman_werner_threshold,
    partially_ionized_temperature, reionization_feedback,
};
use reion_math::fft::{clip_and_extrema, KGrid};
use reion_math::filters::filter_kgrid;
use reion_types::config::{BubbleAlgorithm, FilterKind, PhotonConsType, SimulationConfig};
use reion_types::constants::*;
use reion_types::error::{ReionError, ReionResult};
use reion_types::state::{
    Grid3, HaloBox, InitialConditions, IonizedBox, PerturbedField, TsBox,
};

use crate::tables::{ConditionalTables, TableScope};

/// Output of the upstream photon-conservation remap (z-shift mode).
#[derive(Debug, Clone, Copy)]
pub struct PhotonConsAdjustment {
    pub z_used: f64,
    pub z_stored: f64,
    pub delta_z: f64,
}

/// Collaborator inputs for the photon-conservation modes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhotonConsInput {
    pub remap: Option<PhotonConsAdjustment>,
    /// Fit value overriding alpha_esc or f_esc10 for the fit modes.
    pub fesc_fit: Option<f64>,
}

/// Snapshot-level constants of the ionisation solver.
#[derive(Debug, Clone)]
struct IonConstants {
    redshift: f64,
    stored_redshift: f64,
    prev_redshift: f64,
    growth: f64,
    prev_growth: f64,
    photoncons_adjustment_factor: f64,
    /// |z' - z'_prev| for the recombination budget.
    dz: f64,
    fabs_dtdz: f64,
    fix_mean: bool,
    filter_recombinations: bool,
    fesc_10: f64,
    alpha_esc: f64,
    mturn_a_nofb: f64,
    mturn_m_nofb: f64,
    vcb_norel: f64,
    ion_eff: f64,
    ion_eff_mini: f64,
    ion_eff_gl: f64,
    ion_eff_mini_gl: f64,
    mfp_meandens: f64,
    tk_nofluct: f64,
    adia_tk_term: f64,
    m_min: f64,
    ln_m_min: f64,
    ln_m_max_gl: f64,
    sigma_minmass: f64,
    pixel_mass: f64,
    gamma_prefactor: f64,
    gamma_prefactor_mini: f64,
    /// Converts a filtered photon density into photons per baryon (halo mode).
    halo_photon_norm: f64,
}

impl IonConstants {
    fn new(
        redshift: f64,
        prev_redshift: f64,
        config: &SimulationConfig,
        cosmo: &Cosmology,
        grid: &Grid3,
        photoncons: Option<&PhotonConsInput>,
    ) -> ReionResult<Self> {
        let astro = &config.astro;
        let flags = &config.flags;

        let mut z_used = redshift;
        let mut stored_redshift = redshift;
        let mut adjustment_factor = 1.0;
        let mut alpha_esc = astro.alpha_esc;
        let mut fesc_10 = astro.f_esc10;
        match flags.photon_cons_type {
            PhotonConsType::None => {}
            PhotonConsType::ZShift => {
                let remap = photoncons.and_then(|p| p.remap).ok_or_else(|| {
                    ReionError::Value("photon_cons_type = z_shift needs the remap output".into())
                })?;
                if !remap.z_used.is_finite() || !remap.delta_z.is_finite() {
                    return Err(ReionError::PhotonCons(format!(
                        "remapped redshift {} (delta {})",
                        remap.z_used, remap.delta_z
                    )));
                }
                z_used = remap.z_used;
                stored_redshift = remap.z_stored;
                adjustment_factor = cosmo.growth(z_used) / cosmo.growth(stored_redshift);
            }
            PhotonConsType::AlphaEscFit => {
                alpha_esc = photoncons.and_then(|p| p.fesc_fit).ok_or_else(|| {
                    ReionError::Value("photon_cons_type = alpha_esc_fit needs a fit value".into())
                })?;
            }
            PhotonConsType::FEscFit => {
                fesc_10 = photoncons.and_then(|p| p.fesc_fit).ok_or_else(|| {
                    ReionError::Value("photon_cons_type = f_esc_fit needs a fit value".into())
                })?;
            }
        }

        let dz = if prev_redshift < 1.0 {
            (1.0 + z_used) * (config.user.zprime_step_factor - 1.0)
        } else {
            (prev_redshift - z_used).abs()
        };

        let mturn_a_nofb = if flags.use_mini_halos {
            atomic_cooling_threshold(z_used, cosmo)
        } else {
            astro.m_turn
        }
        .max(astro.m_turn);
        let vcb_norel = if flags.fix_vcb_avg { 25.86 } else { 0.0 };
        let mturn_m_nofb = if flags.use_mini_halos {
            lyman_werner_threshold(z_used, 0.0, vcb_norel, astro, cosmo).max(astro.m_turn)
        } else {
            astro.m_turn
        };

        let (ion_eff_gl, ion_eff_mini_gl) = if flags.use_mass_dependent_zeta {
            (
                astro.pop2_ion * astro.f_star10 * fesc_10,
                astro.pop3_ion * astro.f_star7_mini * astro.f_esc7_mini,
            )
        } else {
            (astro.hii_eff_factor, 0.0)
        };
        // halo grids carry the stellar and escape factors already
        let (ion_eff, ion_eff_mini) = if flags.use_halo_field {
            (1.0, 1.0)
        } else {
            (ion_eff_gl, ion_eff_mini_gl)
        };

        let mfp_meandens = if z_used > 6.0 {
            25.483241248322766 / config.cosmo.hlittle
        } else {
            112.0 / config.cosmo.hlittle * ((1.0 + z_used) / 5.0).powf(-4.4)
        };

        let m_min = hmf::minimum_source_mass(z_used, astro, flags, cosmo);
        let t_star_sec = astro.t_star * cosmo.t_hubble(z_used);
        let rho_b = cosmo.rho_m * config.cosmo.omb / config.cosmo.omm;

        let mut gamma_prefactor = (1.0 + z_used).powi(2) * CM_PER_MPC * SIGMA_HI * astro.alpha_uvb
            / (astro.alpha_uvb + 2.75)
            * cosmo.n_b0
            * ion_eff
            / 1.0e-12;
        if flags.use_halo_field {
            gamma_prefactor /= rho_b;
        } else {
            gamma_prefactor /= t_star_sec;
        }
        let gamma_prefactor_mini = gamma_prefactor * ion_eff_mini / ion_eff.max(1e-30);

        Ok(IonConstants {
            redshift: z_used,
            stored_redshift,
            prev_redshift,
            growth: cosmo.growth(z_used),
            prev_growth: cosmo.growth(prev_redshift.max(z_used)),
            photoncons_adjustment_factor: adjustment_factor,
            dz,
            fabs_dtdz: cosmo.dtdz(z_used),
            fix_mean: !flags.use_halo_field,
            filter_recombinations: flags.inhomo_reco && !flags.cell_recomb,
            fesc_10,
            alpha_esc,
            mturn_a_nofb,
            mturn_m_nofb,
            vcb_norel,
            ion_eff,
            ion_eff_mini,
            ion_eff_gl,
            ion_eff_mini_gl,
            mfp_meandens,
            tk_nofluct: t_recfast(z_used),
            adia_tk_term: ct_approx(z_used),
            m_min,
            ln_m_min: m_min.ln(),
            ln_m_max_gl: hmf::ln_m_max_global(),
            sigma_minmass: cosmo.sigma(m_min),
            pixel_mass: cosmo.rho_m * grid.cell_volume(),
            gamma_prefactor,
            gamma_prefactor_mini,
            halo_photon_norm: 1.0 / rho_b,
        })
    }
}

/// One entry of the decreasing smoothing-radius schedule.
#[derive(Debug, Clone)]
struct RadiusSpec {
    r: f64,
    m_max: f64,
    ln_m_max: f64,
    sigma_max: f64,
    index: usize,
}

fn setup_radii(grid: &Grid3, config: &SimulationConfig, cosmo: &Cosmology) -> Vec<RadiusSpec> {
    let astro = &config.astro;
    let pixel = grid.cell_len();
    let maximum = astro.r_bubble_max.min(L_FACTOR * grid.box_len);

    let mut cell_length_factor = L_FACTOR;
    // matches the historical special case for fine halo lattices
    if config.flags.use_halo_field
        && config.flags.bubble_algorithm == BubbleAlgorithm::Center
        && pixel < 1.0
    {
        cell_length_factor = 1.0;
    }
    let minimum = astro.r_bubble_min.max(cell_length_factor * pixel);

    let step = config.user.delta_r_hii_factor;
    let n_radii = ((maximum / minimum).ln() / step.ln()).ceil() as usize + 1;

    let mut out = Vec::with_capacity(n_radii);
    for i in 0..n_radii {
        let mut r = minimum * step.powi(i as i32);
        let mut last = false;
        if r > maximum - FRACT_FLOAT_ERR {
            r = maximum;
            last = true;
        }
        let m_max = cosmo.rtom(r);
        out.push(RadiusSpec {
            r,
            m_max,
            ln_m_max: m_max.ln(),
            sigma_max: cosmo.sigma(m_max),
            index: i,
        });
        if last {
            break;
        }
    }
    out
}

/// Number of smoothing radii the solver will use for this lattice.
///
/// The orchestrator sizes the per-radius Fcoll grids of a synthesised
/// first previous box with this.
pub fn radius_count(grid: &Grid3, config: &SimulationConfig, cosmo: &Cosmology) -> usize {
    setup_radii(grid, config, cosmo).len()
}

/// Source and absorber k-grids kept unfiltered for the whole R-loop.
struct UnfilteredGrids {
    deltax: KGrid,
    xe: Option<KGrid>,
    nrec: Option<KGrid>,
    prev_deltax: Option<KGrid>,
    l10_mturn: Option<KGrid>,
    l10_mturn_mini: Option<KGrid>,
    stars: Option<KGrid>,
    wsfr: Option<KGrid>,
}

/// Real-space filtered views for one radius.
struct FilteredFields {
    deltax: Array3<f64>,
    xe: Option<Array3<f64>>,
    nrec: Option<Array3<f64>>,
    prev_deltax: Option<Array3<f64>>,
    l10_mturn: Option<Array3<f64>>,
    l10_mturn_mini: Option<Array3<f64>>,
    stars: Option<Array3<f64>>,
    wsfr: Option<Array3<f64>>,
}

fn filter_to_real(
    kg: &KGrid,
    kind: FilterKind,
    r: f64,
    mfp: f64,
    apply_filter: bool,
) -> Array3<f64> {
    let mut scratch = kg.clone();
    if apply_filter {
        filter_kgrid(&mut scratch, kind, r, mfp);
    }
    scratch.inverse()
}

/// Mean collapsed fractions with the minihalo trapezoidal update.
#[allow(clippy::too_many_arguments)]
fn set_mean_fcoll(
    c: &IonConstants,
    config: &SimulationConfig,
    cosmo: &Cosmology,
    prev_box: &IonizedBox,
    curr_box: &mut IonizedBox,
    mturn_acg: f64,
    mturn_mcg: f64,
) -> ReionResult<(f64, f64)> {
    let astro = &config.astro;
    let flags = &config.flags;
    let f_limit_acg: f64;
    let f_limit_mcg: f64;

    if flags.use_mass_dependent_zeta {
        let nion_at = |z: f64, mturn: f64| {
            hmf::nion_general(
                cosmo,
                z,
                c.ln_m_min,
                c.ln_m_max_gl,
                mturn,
                astro.alpha_star,
                c.alpha_esc,
                astro.f_star10,
                c.fesc_10,
            )
        };
        let f_coll_curr = nion_at(c.redshift, mturn_acg);
        f_limit_acg = nion_at(config.cosmo.z_heat_max, mturn_acg);

        if flags.use_mini_halos {
            if prev_box.mean_f_coll * c.ion_eff_gl < 1e-4 {
                curr_box.mean_f_coll = f_coll_curr;
            } else {
                let f_coll_prev = nion_at(c.prev_redshift, mturn_acg);
                curr_box.mean_f_coll = prev_box.mean_f_coll + f_coll_curr - f_coll_prev;
            }
            let nion_mini_at = |z: f64| {
                hmf::nion_general_mini(
                    cosmo,
                    z,
                    c.ln_m_min,
                    c.ln_m_max_gl,
                    mturn_mcg,
                    mturn_acg,
                    astro.alpha_star_mini,
                    c.alpha_esc,
                    astro.f_star7_mini,
                    astro.f_esc7_mini,
                )
            };
            let f_coll_curr_mini = nion_mini_at(c.redshift);
            if prev_box.mean_f_coll_mini * c.ion_eff_gl < 1e-4 {
                curr_box.mean_f_coll_mini = f_coll_curr_mini;
            } else {
                curr_box.mean_f_coll_mini =
                    prev_box.mean_f_coll_mini + f_coll_curr_mini - nion_mini_at(c.prev_redshift);
            }
            f_limit_mcg = nion_mini_at(config.cosmo.z_heat_max);
        } else {
            curr_box.mean_f_coll = f_coll_curr;
            curr_box.mean_f_coll_mini = 0.0;
            f_limit_mcg = 0.0;
        }
    } else {
        curr_box.mean_f_coll = hmf::fcoll_general(cosmo, c.redshift, c.ln_m_min, c.ln_m_max_gl);
        curr_box.mean_f_coll_mini = 0.0;
        f_limit_acg = hmf::fcoll_general(cosmo, config.cosmo.z_heat_max, c.ln_m_min, c.ln_m_max_gl);
        f_limit_mcg = 0.0;
    }

    if !curr_box.mean_f_coll.is_finite() || !curr_box.mean_f_coll_mini.is_finite() {
        return Err(ReionError::InfinityOrNaN {
            field: "mean_f_coll",
            stage: "excursion-set normalisation",
        });
    }
    Ok((f_limit_acg, f_limit_mcg))
}

/// Early-out: the whole box stays neutral this snapshot.
fn set_fully_neutral_box(
    c: &IonConstants,
    config: &SimulationConfig,
    box_out: &mut IonizedBox,
    ts: Option<&TsBox>,
    perturb: &PerturbedField,
) {
    if config.flags.use_ts_fluct {
        let ts = ts.expect("ts coupling requires a spin-temperature box");
        for ((xh, t_out), (xe, tk)) in box_out
            .xh
            .iter_mut()
            .zip(box_out.temp_kinetic_all_gas.iter_mut())
            .zip(ts.x_e.iter().zip(ts.tk.iter()))
        {
            *xh = 1.0 - xe;
            *t_out = *tk;
        }
    } else {
        let xh = 1.0 - xion_recfast(c.redshift);
        for ((xh_out, t_out), dens) in box_out
            .xh
            .iter_mut()
            .zip(box_out.temp_kinetic_all_gas.iter_mut())
            .zip(perturb.density.iter())
        {
            *xh_out = xh;
            *t_out = c.tk_nofluct * (1.0 + c.adia_tk_term * dens);
        }
    }
}

/// Paint a sphere of zeros into the neutral-fraction grid.
fn paint_sphere(xh: &mut Array3<f64>, grid: &Grid3, center: (usize, usize, usize), r_mpc: f64) {
    let rc = r_mpc / grid.cell_len();
    let reach = rc.ceil() as isize;
    let rc2 = rc * rc;
    for di in -reach..=reach {
        for dj in -reach..=reach {
            for dk in -reach..=reach {
                let d2 = (di * di + dj * dj + dk * dk) as f64;
                if d2 > rc2 {
                    continue;
                }
                let i = grid.wrap(center.0 as isize + di, grid.n);
                let j = grid.wrap(center.1 as isize + dj, grid.n);
                let k = grid.wrap(center.2 as isize + dk, grid.nz);
                xh[[i, j, k]] = 0.0;
            }
        }
    }
}

/// Compute the ionisation box for one snapshot.
#[allow(clippy::too_many_arguments)]
pub fn compute_ionised_box(
    redshift: f64,
    prev_redshift: f64,
    config: &SimulationConfig,
    perturb: &PerturbedField,
    perturb_prev: Option<&PerturbedField>,
    prev_ion: &IonizedBox,
    ts: Option<&TsBox>,
    halobox: Option<&HaloBox>,
    ini: &InitialConditions,
    photoncons: Option<&PhotonConsInput>,
) -> ReionResult<IonizedBox> {
    config.validate()?;
    let flags = &config.flags;
    if flags.use_ts_fluct && ts.is_none() {
        return Err(ReionError::Value(
            "use_ts_fluct requires the spin-temperature box".into(),
        ));
    }
    if flags.use_halo_field && halobox.is_none() {
        return Err(ReionError::Value(
            "use_halo_field requires the halo box".into(),
        ));
    }
    if flags.use_mini_halos && !flags.use_halo_field && perturb_prev.is_none() {
        return Err(ReionError::Value(
            "minihalo trapezoid requires the previous perturbed field".into(),
        ));
    }

    let cosmo = Cosmology::new(&config.cosmo);
    let grid = Grid3::from_params(&config.user);
    let c = IonConstants::new(redshift, prev_redshift, config, &cosmo, &grid, photoncons)?;
    let radii = setup_radii(&grid, config, &cosmo);
    let n_fcoll_grids = if flags.use_mini_halos { radii.len() } else { 1 };
    let mut box_out = IonizedBox::new(&grid, redshift, n_fcoll_grids);
    let n_cells = grid.total_cells();

    debug!(
        "ionisation box at z = {:.3} (stored {:.3}), {} radii in [{:.3}, {:.3}] Mpc",
        c.redshift,
        c.stored_redshift,
        radii.len(),
        radii.first().map_or(0.0, |r| r.r),
        radii.last().map_or(0.0, |r| r.r)
    );

    // ── turnover-mass grids and their averages ───────────────────────
    let mut mturn_grid: Option<Array3<f64>> = None;
    let mut mturn_mini_grid: Option<Array3<f64>> = None;
    if flags.use_mass_dependent_zeta && flags.use_mini_halos && !flags.use_halo_field {
        let ts_box = ts.expect("checked above");
        let mut sum_a = 0.0;
        let mut sum_m = 0.0;
        let mut ga = Array3::zeros(grid.shape());
        let mut gm = Array3::zeros(grid.shape());
        for (idx, (a_out, m_out)) in ga.iter_mut().zip(gm.iter_mut()).enumerate() {
            let i3 = flat_to_3d(idx, &grid);
            let mcrit_re = reionization_feedback(
                c.redshift,
                prev_ion.gamma12[i3],
                prev_ion.z_re[i3],
            );
            let vcb = if flags.use_relative_velocities && !flags.fix_vcb_avg {
                ini.lowres_vcb[i3]
            } else {
                c.vcb_norel
            };
            let mcrit_lw = lyman_werner_threshold(
                c.redshift,
                ts_box.j_21_lw[i3],
                vcb,
                &config.astro,
                &cosmo,
            );
            if !mcrit_lw.is_finite() || mcrit_lw == 0.0 {
                return Err(ReionError::Value(format!(
                    "Lyman-Werner threshold failed at cell {idx}: {mcrit_lw}"
                )));
            }
            let a = mcrit_re.max(c.mturn_a_nofb).log10();
            let m = mcrit_re.max(mcrit_lw).max(c.mturn_m_nofb).log10();
            *a_out = a;
            *m_out = m;
            sum_a += a;
            sum_m += m;
        }
        box_out.log10_mturn_ave = sum_a / n_cells as f64;
        box_out.log10_mturn_mini_ave = sum_m / n_cells as f64;
        mturn_grid = Some(ga);
        mturn_mini_grid = Some(gm);
    } else {
        box_out.log10_mturn_ave = c.mturn_a_nofb.log10();
        box_out.log10_mturn_mini_ave = c.mturn_m_nofb.log10();
    }
    let mturn_acg_avg = 10f64.powf(box_out.log10_mturn_ave);
    let mturn_mcg_avg = 10f64.powf(box_out.log10_mturn_mini_ave);

    // ── global normalisation and the fully-neutral early-out ─────────
    let (f_limit_acg, f_limit_mcg) = set_mean_fcoll(
        &c,
        config,
        &cosmo,
        prev_ion,
        &mut box_out,
        mturn_acg_avg,
        mturn_mcg_avg,
    )?;
    let exp_global_hii =
        box_out.mean_f_coll * c.ion_eff_gl + box_out.mean_f_coll_mini * c.ion_eff_mini_gl;
    if exp_global_hii < HII_ROUND_ERR {
        debug!("expected ionised fraction {exp_global_hii:.3e} below floor; box stays neutral");
        set_fully_neutral_box(&c, config, &mut box_out, ts, perturb);
        return Ok(box_out);
    }

    // ── unfiltered k-space grids ─────────────────────────────────────
    let prepare = |field: &Array3<f64>, factor: f64, lo: f64, hi: f64| {
        let clipped = field.mapv(|v| (v * factor).clamp(lo, hi));
        KGrid::forward(&clipped, grid.box_len, grid.box_len_z)
    };

    let grids = UnfilteredGrids {
        deltax: prepare(
            &perturb.density,
            c.photoncons_adjustment_factor,
            -1.0,
            1e6,
        ),
        xe: if flags.use_ts_fluct {
            Some(prepare(&ts.expect("checked").x_e, 1.0, 0.0, 1.0))
        } else {
            None
        },
        nrec: if c.filter_recombinations {
            Some(prepare(&prev_ion.dnrec, 1.0, 0.0, 1e20))
        } else {
            None
        },
        prev_deltax: if flags.use_mini_halos && !flags.use_halo_field {
            Some(prepare(&perturb_prev.expect("checked").density, 1.0, -1.0, 1e6))
        } else {
            None
        },
        l10_mturn: mturn_grid
            .as_ref()
            .map(|g| KGrid::forward(g, grid.box_len, grid.box_len_z)),
        l10_mturn_mini: mturn_mini_grid
            .as_ref()
            .map(|g| KGrid::forward(g, grid.box_len, grid.box_len_z)),
        stars: halobox.map(|h| prepare(&h.n_ion, 1.0, 0.0, 1e20)),
        wsfr: halobox.map(|h| prepare(&h.whalo_sfr, 1.0, 0.0, 1e20)),
    };

    // ── R-loop, largest to smallest ──────────────────────────────────
    let nan_flag = AtomicBool::new(false);
    for rspec in radii.iter().rev() {
        if c.m_min > rspec.m_max {
            debug!(
                "radius {:.3} Mpc falls below the minimum source mass; stopping",
                rspec.r
            );
            break;
        }
        let is_last_step = rspec.index == 0;
        let apply_filter = !is_last_step;
        let kind = flags.hii_filter;
        let source_kind = if flags.use_exp_filter {
            FilterKind::Exponential
        } else {
            kind
        };

        let mut fields = FilteredFields {
            deltax: filter_to_real(&grids.deltax, kind, rspec.r, 0.0, apply_filter),
            xe: grids
                .xe
                .as_ref()
                .map(|g| filter_to_real(g, kind, rspec.r, 0.0, apply_filter)),
            nrec: grids
                .nrec
                .as_ref()
                .map(|g| filter_to_real(g, kind, rspec.r, 0.0, apply_filter)),
            prev_deltax: grids
                .prev_deltax
                .as_ref()
                .map(|g| filter_to_real(g, kind, rspec.r, 0.0, apply_filter)),
            l10_mturn: grids
                .l10_mturn
                .as_ref()
                .map(|g| filter_to_real(g, kind, rspec.r, 0.0, apply_filter)),
            l10_mturn_mini: grids
                .l10_mturn_mini
                .as_ref()
                .map(|g| filter_to_real(g, kind, rspec.r, 0.0, apply_filter)),
            stars: grids
                .stars
                .as_ref()
                .map(|g| filter_to_real(g, source_kind, rspec.r, c.mfp_meandens, apply_filter)),
            wsfr: grids
                .wsfr
                .as_ref()
                .map(|g| filter_to_real(g, source_kind, rspec.r, c.mfp_meandens, apply_filter)),
        };

        // clip to physical ranges; extrema feed the table bounds
        let (min_density, max_density) =
            clip_and_extrema(&mut fields.deltax, -1.0 + FRACT_FLOAT_ERR, 1e6);
        if let Some(g) = fields.xe.as_mut() {
            clip_and_extrema(g, 0.0, 0.999);
        }
        if let Some(g) = fields.nrec.as_mut() {
            clip_and_extrema(g, 0.0, f64::INFINITY);
        }
        if let Some(g) = fields.stars.as_mut() {
            clip_and_extrema(g, 0.0, f64::INFINITY);
        }
        if let Some(g) = fields.wsfr.as_mut() {
            clip_and_extrema(g, 0.0, f64::INFINITY);
        }
        let prev_bounds = fields
            .prev_deltax
            .as_mut()
            .map(|g| clip_and_extrema(g, -1.0 + FRACT_FLOAT_ERR, 1e6));
        let mturn_bounds = fields
            .l10_mturn
            .as_mut()
            .map(|g| clip_and_extrema(g, LOG10_MTURN_MIN, LOG10_MTURN_MAX));
        let mturn_mini_bounds = fields
            .l10_mturn_mini
            .as_mut()
            .map(|g| clip_and_extrema(g, LOG10_MTURN_MIN, LOG10_MTURN_MAX));

        // need the previous-redshift tables only while the previous
        // snapshot contributed meaningful ionisation
        let need_prev = flags.use_mini_halos
            && prev_ion.mean_f_coll * c.ion_eff_gl + prev_ion.mean_f_coll_mini * c.ion_eff_mini_gl
                > 1e-4;

        // ── conditional tables for this radius ───────────────────────
        let mut tables = None;
        let mut prev_tables = None;
        let mut fcoll_tables = None;
        if !flags.use_halo_field {
            let pad = |b: (f64, f64)| (b.0 * 0.99 - 1e-3, b.1 * 1.01 + 1e-3);
            let scope = TableScope {
                growth: c.growth,
                z: c.redshift,
                ln_m_min: c.ln_m_min,
                ln_m_cond: rspec.ln_m_max,
                sigma_cond: rspec.sigma_max,
                sigma_min: c.sigma_minmass,
                mturn_acg: c.mturn_a_nofb,
                delta_range: (min_density - 0.001, max_density + 0.001),
                l10_mturn_acg_range: pad(mturn_bounds.unwrap_or((
                    c.mturn_a_nofb.log10() - 0.1,
                    c.mturn_a_nofb.log10() + 0.1,
                ))),
                l10_mturn_mcg_range: pad(mturn_mini_bounds.unwrap_or((
                    c.mturn_m_nofb.log10() - 0.1,
                    c.mturn_m_nofb.log10() + 0.1,
                ))),
            };
            if flags.use_mass_dependent_zeta {
                tables = Some(ConditionalTables::build_nion(
                    &scope,
                    &config.astro,
                    flags,
                    &cosmo,
                    c.alpha_esc,
                    c.fesc_10,
                )?);
                if need_prev {
                    let pb = prev_bounds.expect("minihalo path filters prev density");
                    let prev_scope = TableScope {
                        growth: c.prev_growth,
                        z: c.prev_redshift,
                        delta_range: (pb.0 - 0.001, pb.1 + 0.001),
                        ..scope.clone()
                    };
                    prev_tables = Some(ConditionalTables::build_nion(
                        &prev_scope,
                        &config.astro,
                        flags,
                        &cosmo,
                        c.alpha_esc,
                        c.fesc_10,
                    )?);
                }
            } else {
                let mut sc = scope.clone();
                sc.sigma_min = c.sigma_minmass;
                fcoll_tables = Some(ConditionalTables::build_fcoll(&sc, &cosmo)?);
            }
        }

        // ── collapsed-fraction grid for this radius ──────────────────
        let fc_r_idx = if flags.use_mini_halos { rspec.index } else { 0 };
        let mut f_coll_mean = 0.0;
        let mut f_coll_mean_mini = 0.0;
        {
            let deltax = fields.deltax.as_slice().expect("standard layout");
            let stars = fields.stars.as_ref().map(|g| g.as_slice().unwrap());
            let l10m = fields.l10_mturn.as_ref().map(|g| g.as_slice().unwrap());
            let l10m_mini = fields
                .l10_mturn_mini
                .as_ref()
                .map(|g| g.as_slice().unwrap());
            let prev_deltax = fields.prev_deltax.as_ref().map(|g| g.as_slice().unwrap());
            let prev_fcoll_grid = prev_ion
                .fcoll
                .get(fc_r_idx)
                .map(|g| g.as_slice().expect("layout"));
            let prev_fcoll_mini_grid = prev_ion
                .fcoll_mini
                .get(fc_r_idx)
                .map(|g| g.as_slice().expect("layout"));

            let fcoll_out = box_out.fcoll[fc_r_idx].as_slice_mut().expect("layout");
            let fcoll_mini_out = box_out.fcoll_mini[fc_r_idx]
                .as_slice_mut()
                .expect("layout");

            for ct in 0..n_cells {
                let mut spl;
                let mut spl_mini = 0.0;
                let mut prev_spl = 0.0;
                let mut prev_spl_mini = 0.0;

                if flags.use_halo_field {
                    spl = stars.expect("halo grids present")[ct] * c.halo_photon_norm;
                } else {
                    let dens = deltax[ct];
                    if flags.use_mass_dependent_zeta {
                        let t = tables.as_ref().expect("built above");
                        let acg = t.nion_acg.as_ref().expect("built above");
                        let l10 = l10m
                            .map(|g| g[ct])
                            .unwrap_or_else(|| c.mturn_a_nofb.log10())
                            .clamp(acg.y_min, acg.y_max());
                        spl = acg.eval(dens.clamp(acg.x_min, acg.x_max()), l10);
                        if flags.use_mini_halos {
                            let mcg = t.nion_mcg.as_ref().expect("built above");
                            let l10_mini = l10m_mini
                                .map(|g| g[ct])
                                .unwrap_or_else(|| c.mturn_m_nofb.log10())
                                .clamp(mcg.y_min, mcg.y_max());
                            spl_mini =
                                mcg.eval(dens.clamp(mcg.x_min, mcg.x_max()), l10_mini);
                            if need_prev {
                                let pt = prev_tables.as_ref().expect("built above");
                                let pacg = pt.nion_acg.as_ref().expect("built above");
                                let pmcg = pt.nion_mcg.as_ref().expect("built above");
                                let pdens = prev_deltax.expect("minihalo path")[ct];
                                prev_spl = pacg.eval(
                                    pdens.clamp(pacg.x_min, pacg.x_max()),
                                    l10.clamp(pacg.y_min, pacg.y_max()),
                                );
                                prev_spl_mini = pmcg.eval(
                                    pdens.clamp(pmcg.x_min, pmcg.x_max()),
                                    l10_mini.clamp(pmcg.y_min, pmcg.y_max()),
                                );
                            }
                        }
                    } else {
                        let t = fcoll_tables.as_ref().expect("built above");
                        let f = t.fcoll.as_ref().expect("built above");
                        spl = f.eval(dens.clamp(f.x_min, f.x_max()));
                    }
                }

                if flags.use_mini_halos && !flags.use_halo_field {
                    spl = spl.clamp(1e-40, 1.0);
                    prev_spl = prev_spl.clamp(1e-40, 1.0);
                    spl_mini = spl_mini.clamp(1e-40, 1.0);
                    prev_spl_mini = prev_spl_mini.clamp(1e-40, 1.0);

                    let prev_grid_val = prev_fcoll_grid.map_or(0.0, |g| g[ct]);
                    let prev_grid_val_mini = prev_fcoll_mini_grid.map_or(0.0, |g| g[ct]);

                    fcoll_out[ct] = (prev_grid_val + spl - prev_spl).min(1.0);
                    fcoll_mini_out[ct] =
                        (prev_grid_val_mini + spl_mini - prev_spl_mini).min(1.0);
                } else {
                    fcoll_out[ct] = spl;
                    fcoll_mini_out[ct] = spl_mini;
                }
                f_coll_mean += fcoll_out[ct];
                f_coll_mean_mini += fcoll_mini_out[ct];
            }
        }
        f_coll_mean /= n_cells as f64;
        f_coll_mean_mini /= n_cells as f64;
        if !f_coll_mean.is_finite() || !f_coll_mean_mini.is_finite() {
            return Err(ReionError::InfinityOrNaN {
                field: "f_coll",
                stage: "collapsed-fraction grid",
            });
        }

        // floors keeping the mean-fix ratio finite
        if flags.use_mass_dependent_zeta {
            f_coll_mean = f_coll_mean.max(f_limit_acg);
            if flags.use_mini_halos {
                f_coll_mean_mini = f_coll_mean_mini.max(f_limit_mcg);
            }
        } else {
            f_coll_mean = f_coll_mean.max(FRACT_FLOAT_ERR);
        }

        let (mean_fix_acg, mean_fix_mcg) = if c.fix_mean {
            (
                box_out.mean_f_coll / f_coll_mean,
                if f_coll_mean_mini > 0.0 {
                    box_out.mean_f_coll_mini / f_coll_mean_mini
                } else {
                    1.0
                },
            )
        } else {
            box_out.mean_f_coll = f_coll_mean;
            box_out.mean_f_coll_mini = f_coll_mean_mini;
            (1.0, 1.0)
        };

        // ── ionisation criterion over every cell ─────────────────────
        #[derive(Clone, Copy, Default)]
        struct CellDecision {
            ionised: bool,
        }
        let mut decisions = vec![CellDecision::default(); n_cells];
        {
            let deltax = fields.deltax.as_slice().expect("layout");
            let xe_f = fields.xe.as_ref().map(|g| g.as_slice().unwrap());
            let nrec_f = fields.nrec.as_ref().map(|g| g.as_slice().unwrap());
            let wsfr_f = fields.wsfr.as_ref().map(|g| g.as_slice().unwrap());
            let dens_unfiltered = perturb.density.as_slice().expect("layout");
            let prev_dnrec = prev_ion.dnrec.as_slice().expect("layout");
            let prev_zre = prev_ion.z_re.as_slice().expect("layout");
            let fcoll_grid = box_out.fcoll[fc_r_idx].as_slice().expect("layout");
            let fcoll_mini_grid = box_out.fcoll_mini[fc_r_idx].as_slice().expect("layout");
            let ts_tk = ts.map(|t| t.tk.as_slice().unwrap());

            let xh = box_out.xh.as_slice_mut().expect("layout");
            let zre_out = box_out.z_re.as_slice_mut().expect("layout");
            let gamma_out = box_out.gamma12.as_slice_mut().expect("layout");
            let mfp_out = box_out.mfp.as_slice_mut().expect("layout");
            let temp_out = box_out
                .temp_kinetic_all_gas
                .as_slice_mut()
                .expect("layout");

            let inhomo_reco = flags.inhomo_reco;
            let cell_recomb = flags.cell_recomb;
            let ts_fluct = flags.use_ts_fluct;
            let use_mini = flags.use_mini_halos;
            let use_halo = flags.use_halo_field;
            let mass_dep = flags.use_mass_dependent_zeta;
            let center_paint = flags.bubble_algorithm == BubbleAlgorithm::Center;
            let no_rng = config.user.no_rng;
            let n_poisson = config.user.n_poisson;

            decisions
                .par_iter_mut()
                .zip(xh.par_iter_mut())
                .zip(zre_out.par_iter_mut())
                .zip(gamma_out.par_iter_mut())
                .zip(mfp_out.par_iter_mut())
                .zip(temp_out.par_iter_mut())
                .enumerate()
                .for_each_init(
                    || SmallRng::from_entropy(),
                    |rng, (ct, (((((dec, xh_v), zre_v), gamma_v), mfp_v), temp_v))| {
                        let curr_dens = if cell_recomb {
                            dens_unfiltered[ct] * c.photoncons_adjustment_factor
                        } else {
                            deltax[ct]
                        };

                        let mut curr_fcoll = fcoll_grid[ct] * mean_fix_acg;
                        if use_halo {
                            curr_fcoll /= 1.0 + curr_dens;
                        }
                        let mut curr_fcoll_mini = if use_mini && !use_halo {
                            fcoll_mini_grid[ct] * mean_fix_mcg
                        } else {
                            0.0
                        };

                        if mass_dep {
                            curr_fcoll = curr_fcoll.max(f_limit_acg);
                            if use_mini {
                                curr_fcoll_mini = curr_fcoll_mini.max(f_limit_mcg);
                            }
                        }

                        let rec = if inhomo_reco {
                            let raw = if cell_recomb {
                                prev_dnrec[ct]
                            } else {
                                nrec_f.expect("filtered recombinations")[ct]
                            };
                            raw / (1.0 + curr_dens)
                        } else {
                            0.0
                        };

                        let xhii_from_xrays = if ts_fluct {
                            xe_f.expect("filtered xe")[ct]
                        } else {
                            0.0
                        };

                        let lhs = curr_fcoll * c.ion_eff + curr_fcoll_mini * c.ion_eff_mini;
                        let rhs = (1.0 - xhii_from_xrays) * (1.0 + rec);

                        if lhs > rhs {
                            // first crossing at the largest radius wins
                            if inhomo_reco && *xh_v > FRACT_FLOAT_ERR {
                                *gamma_v = if use_halo {
                                    rspec.r * c.gamma_prefactor / (1.0 + curr_dens)
                                        * wsfr_f.expect("halo wsfr")[ct]
                                } else {
                                    rspec.r
                                        * (c.gamma_prefactor * curr_fcoll
                                            + c.gamma_prefactor_mini * curr_fcoll_mini)
                                };
                                *mfp_v = rspec.r;
                            }
                            *zre_v = if prev_zre[ct] < 0.0 {
                                c.redshift
                            } else {
                                prev_zre[ct]
                            };
                            if center_paint {
                                *xh_v = 0.0;
                            }
                            dec.ionised = true;
                        } else if is_last_step && *xh_v > FRACT_FLOAT_ERR {
                            // residual partial ionisation at the cell scale
                            let mut fc = curr_fcoll;
                            let mut fc_mini = curr_fcoll_mini;
                            if !use_halo {
                                let ave_m_coll =
                                    (fc + fc_mini) * c.pixel_mass * (1.0 + curr_dens);
                                let ave_n_min = ave_m_coll / c.m_min;
                                let n_halos = if no_rng {
                                    1.0
                                } else {
                                    Poisson::new(n_poisson)
                                        .map(|p| p.sample(rng))
                                        .unwrap_or(n_poisson)
                                };
                                fc = fc.min(1.0);
                                fc_mini = fc_mini.min(1.0);
                                if ave_n_min < n_poisson {
                                    fc = n_halos * (ave_m_coll / n_poisson)
                                        / (c.pixel_mass * (1.0 + curr_dens));
                                    if use_mini {
                                        let denom =
                                            fc * c.ion_eff + curr_fcoll_mini * c.ion_eff_mini;
                                        if denom > 0.0 {
                                            fc_mini = fc * (curr_fcoll_mini * c.ion_eff) / denom;
                                            fc -= fc_mini;
                                        }
                                    } else {
                                        fc_mini = 0.0;
                                    }
                                }
                                if ave_m_coll < c.m_min / 5.0 {
                                    fc = 0.0;
                                    fc_mini = 0.0;
                                }
                                fc = fc.min(1.0);
                                fc_mini = fc_mini.min(1.0);
                            }

                            let mut res_xh = 1.0 - fc * c.ion_eff - fc_mini * c.ion_eff_mini;
                            let t_hi = if ts_fluct {
                                ts_tk.expect("ts box")[ct]
                            } else {
                                c.tk_nofluct * (1.0 + c.adia_tk_term * dens_unfiltered[ct])
                            };
                            *temp_v = partially_ionized_temperature(t_hi, res_xh);
                            res_xh -= xhii_from_xrays;
                            *xh_v = res_xh.clamp(0.0, 1.0);
                        }
                    },
                );
        }

        // sphere painting is sequential; within one radius the order of
        // painted zeros is immaterial
        if flags.bubble_algorithm == BubbleAlgorithm::Sphere {
            for (ct, dec) in decisions.iter().enumerate() {
                if dec.ionised {
                    paint_sphere(&mut box_out.xh, &grid, flat_to_3d(ct, &grid), rspec.r);
                }
            }
        }
    }

    // ── post-loop: ionised temperatures ──────────────────────────────
    {
        let dens = perturb.density.as_slice().expect("layout");
        let zre = box_out.z_re.as_slice().expect("layout");
        let xh = box_out.xh.as_slice().expect("layout");
        let ts_tk = if flags.use_ts_fluct {
            ts.map(|t| t.tk.as_slice().unwrap())
        } else {
            None
        };
        let temp = box_out
            .temp_kinetic_all_gas
            .as_slice_mut()
            .expect("layout");

        temp.par_iter_mut().enumerate().for_each(|(ct, t_out)| {
            if zre[ct] > 0.0 && xh[ct] <= FRACT_FLOAT_ERR {
                let mut t = fully_ionized_temperature(zre[ct], c.stored_redshift, dens[ct]);
                let floor = match ts_tk {
                    Some(tk) => tk[ct],
                    None => c.tk_nofluct * (1.0 + c.adia_tk_term * dens[ct]),
                };
                if t < floor {
                    t = floor;
                }
                *t_out = t;
            } else if zre[ct] < 0.0 && *t_out == 0.0 {
                // never touched by the loop: neutral-phase temperature
                *t_out = match ts_tk {
                    Some(tk) => tk[ct],
                    None => c.tk_nofluct * (1.0 + c.adia_tk_term * dens[ct]),
                };
            }
            if !t_out.is_finite() {
                nan_flag.store(true, Ordering::Relaxed);
            }
        });
    }
    if nan_flag.load(Ordering::Relaxed) {
        return Err(ReionError::InfinityOrNaN {
            field: "temp_kinetic_all_gas",
            stage: "ionised temperature assignment",
        });
    }

    if box_out.xh.iter().any(|v| !v.is_finite()) {
        return Err(ReionError::InfinityOrNaN {
            field: "xH",
            stage: "excursion-set loop",
        });
    }

    // ── recombination budget ─────────────────────────────────────────
    if flags.inhomo_reco {
        let dens = perturb.density.as_slice().expect("layout");
        let gamma = box_out.gamma12.as_slice().expect("layout");
        let xh = box_out.xh.as_slice().expect("layout");
        let prev_dnrec = prev_ion.dnrec.as_slice().expect("layout");
        let dnrec = box_out.dnrec.as_slice_mut().expect("layout");

        let rec_flag = AtomicBool::new(false);
        dnrec.par_iter_mut().enumerate().for_each(|(ct, out)| {
            let curr_dens = 1.0 + dens[ct];
            let z_eff = (1.0 + c.stored_redshift) * curr_dens.max(1e-6).cbrt() - 1.0;
            let d_nrec = recombination_rate(z_eff, gamma[ct], &cosmo)
                * c.fabs_dtdz
                * c.dz
                * (1.0 - xh[ct]);
            if !d_nrec.is_finite() {
                rec_flag.store(true, Ordering::Relaxed);
            }
            *out = prev_dnrec[ct] + d_nrec;
        });
        if rec_flag.load(Ordering::Relaxed) {
            return Err(ReionError::InfinityOrNaN {
                field: "dN_rec",
                stage: "recombination update",
            });
        }
    } else {
        box_out.dnrec.assign(&prev_ion.dnrec);
    }

    debug!(
        "ionisation done: <xH> = {:.4}",
        box_out.xh.iter().sum::<f64>() / n_cells as f64
    );
    Ok(box_out)
}

#[inline]
fn flat_to_3d(ct: usize, grid: &Grid3) -> (usize, usize, usize) {
    let k = ct % grid.nz;
    let j = (ct / grid.nz) % grid.n;
    let i = ct / (grid.nz * grid.n);
    (i, j, k)
}

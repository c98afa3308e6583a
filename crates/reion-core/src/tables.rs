// ─────────────────────────────────────────────────────────────────────
// SCPN Reion Core — Conditional Tables
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Conditional mass-function interpolation tables, rebuilt for each
//! smoothing scale from the post-filter field extrema and dropped at the
//! end of the iteration.

use reion_astro::cosmology::Cosmology;
use reion_astro::hmf;
use reion_math::interp::{RgTable1D, RgTable2D};
use reion_types::config::{AstroParams, FlagOptions};
use reion_types::error::ReionResult;

/// Bin counts; density is the fast-varying axis of the per-cell loops.
const N_DELTA_BINS: usize = 100;
const N_MTURN_BINS: usize = 40;

/// Everything the per-cell loops need at one condition mass.
#[derive(Debug, Clone)]
pub struct ConditionalTables {
    /// Nion over (delta, log10 M_turn_ACG).
    pub nion_acg: Option<RgTable2D>,
    /// Nion over (delta, log10 M_turn_MCG); minihalos only.
    pub nion_mcg: Option<RgTable2D>,
    /// SFRD over delta at the fixed no-feedback ACG turnover.
    pub sfrd_acg: Option<RgTable1D>,
    /// SFRD over (delta, log10 M_turn_MCG); minihalos only.
    pub sfrd_mcg: Option<RgTable2D>,
    /// Plain conditional collapsed fraction (legacy zeta path).
    pub fcoll: Option<RgTable1D>,
    /// d f_coll / dz (legacy zeta path).
    pub dfcoll_dz: Option<RgTable1D>,
}

/// Build inputs shared by every table of one smoothing step.
#[derive(Debug, Clone)]
pub struct TableScope {
    pub growth: f64,
    /// Redshift matching `growth`; the legacy path differentiates in z.
    pub z: f64,
    pub ln_m_min: f64,
    pub ln_m_cond: f64,
    /// sigma(M_cond) at z = 0.
    pub sigma_cond: f64,
    /// sigma(M_min) at z = 0.
    pub sigma_min: f64,
    /// Fixed ACG turnover used where no per-cell turnover grid exists.
    pub mturn_acg: f64,
    /// Post-filter density bounds, already padded by the caller.
    pub delta_range: (f64, f64),
    /// log10 turnover bounds, already padded.
    pub l10_mturn_acg_range: (f64, f64),
    pub l10_mturn_mcg_range: (f64, f64),
}

impl ConditionalTables {
    /// Tables for the mass-dependent-zeta ionisation criterion.
    pub fn build_nion(
        scope: &TableScope,
        astro: &AstroParams,
        flags: &FlagOptions,
        cosmo: &Cosmology,
        alpha_esc: f64,
        f_esc10: f64,
    ) -> ReionResult<Self> {
        let acg = RgTable2D::build(
            "nion_conditional_acg",
            scope.delta_range,
            scope.l10_mturn_acg_range,
            N_DELTA_BINS,
            N_MTURN_BINS,
            |delta, l10_mturn| {
                hmf::nion_conditional_m(
                    cosmo,
                    scope.growth,
                    scope.ln_m_min,
                    scope.ln_m_cond,
                    scope.sigma_cond,
                    delta,
                    10f64.powf(l10_mturn),
                    astro.alpha_star,
                    alpha_esc,
                    astro.f_star10,
                    f_esc10,
                )
            },
        );
        acg.validate()?;

        let mcg = if flags.use_mini_halos {
            let t = RgTable2D::build(
                "nion_conditional_mcg",
                scope.delta_range,
                scope.l10_mturn_mcg_range,
                N_DELTA_BINS,
                N_MTURN_BINS,
                |delta, l10_mturn| {
                    hmf::nion_conditional_mini(
                        cosmo,
                        scope.growth,
                        scope.ln_m_min,
                        scope.ln_m_cond,
                        scope.sigma_cond,
                        delta,
                        10f64.powf(l10_mturn),
                        scope.mturn_acg,
                        astro.alpha_star_mini,
                        alpha_esc,
                        astro.f_star7_mini,
                        astro.f_esc7_mini,
                    )
                },
            );
            t.validate()?;
            Some(t)
        } else {
            None
        };

        Ok(ConditionalTables {
            nion_acg: Some(acg),
            nion_mcg: mcg,
            sfrd_acg: None,
            sfrd_mcg: None,
            fcoll: None,
            dfcoll_dz: None,
        })
    }

    /// Tables for the star-formation-rate density of one shell.
    pub fn build_sfrd(
        scope: &TableScope,
        astro: &AstroParams,
        flags: &FlagOptions,
        cosmo: &Cosmology,
    ) -> ReionResult<Self> {
        let acg = RgTable1D::build(
            "sfrd_conditional_acg",
            scope.delta_range.0,
            scope.delta_range.1,
            N_DELTA_BINS,
            |delta| {
                hmf::sfrd_conditional(
                    cosmo,
                    scope.growth,
                    scope.ln_m_min,
                    scope.ln_m_cond,
                    scope.sigma_cond,
                    delta,
                    scope.mturn_acg,
                    astro.alpha_star,
                    astro.f_star10,
                )
            },
        );
        acg.validate()?;

        let mcg = if flags.use_mini_halos {
            let t = RgTable2D::build(
                "sfrd_conditional_mcg",
                scope.delta_range,
                scope.l10_mturn_mcg_range,
                N_DELTA_BINS,
                N_MTURN_BINS,
                |delta, l10_mturn| {
                    hmf::sfrd_conditional_mini(
                        cosmo,
                        scope.growth,
                        scope.ln_m_min,
                        scope.ln_m_cond,
                        scope.sigma_cond,
                        delta,
                        10f64.powf(l10_mturn),
                        scope.mturn_acg,
                        astro.alpha_star_mini,
                        astro.f_star7_mini,
                    )
                },
            );
            t.validate()?;
            Some(t)
        } else {
            None
        };

        Ok(ConditionalTables {
            nion_acg: None,
            nion_mcg: None,
            sfrd_acg: Some(acg),
            sfrd_mcg: mcg,
            fcoll: None,
            dfcoll_dz: None,
        })
    }

    /// Tables for the non-mass-dependent-zeta (erfc) path.
    pub fn build_fcoll(scope: &TableScope, cosmo: &Cosmology) -> ReionResult<Self> {
        let fcoll = RgTable1D::build(
            "fcoll_conditional",
            scope.delta_range.0,
            scope.delta_range.1,
            N_DELTA_BINS,
            |delta| hmf::fcoll_conditional(scope.growth, delta, scope.sigma_min, scope.sigma_cond),
        );
        fcoll.validate()?;

        let dfcoll = RgTable1D::build(
            "dfcoll_dz_conditional",
            scope.delta_range.0,
            scope.delta_range.1,
            N_DELTA_BINS,
            |delta| hmf::dfcoll_dz(cosmo, scope.z, delta, scope.sigma_min, scope.sigma_cond),
        );
        dfcoll.validate()?;

        Ok(ConditionalTables {
            nion_acg: None,
            nion_mcg: None,
            sfrd_acg: None,
            sfrd_mcg: None,
            fcoll: Some(fcoll),
            dfcoll_dz: Some(dfcoll),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reion_types::config::SimulationConfig;

    fn scope(cosmo: &Cosmology) -> TableScope {
        let m_cond = cosmo.rtom(2.0);
        TableScope {
            growth: cosmo.growth(9.0),
            z: 9.0,
            ln_m_min: (1e8f64).ln(),
            ln_m_cond: m_cond.ln(),
            sigma_cond: cosmo.sigma(m_cond),
            sigma_min: cosmo.sigma(1e8),
            mturn_acg: 5e8,
            delta_range: (-1.0, 1.5),
            l10_mturn_acg_range: (7.0, 10.0),
            l10_mturn_mcg_range: (5.0, 9.0),
        }
    }

    #[test]
    fn test_nion_tables_monotone_in_delta() {
        let config = SimulationConfig::default();
        let cosmo = Cosmology::new(&config.cosmo);
        let sc = scope(&cosmo);
        let t = ConditionalTables::build_nion(&sc, &config.astro, &config.flags, &cosmo, -0.5, 0.1)
            .unwrap();
        let acg = t.nion_acg.unwrap();
        let lo = acg.eval(-0.5, 8.0);
        let hi = acg.eval(0.5, 8.0);
        assert!(hi > lo, "denser cells host more sources: {hi} vs {lo}");
        assert!(t.nion_mcg.is_none(), "no MCG table without the flag");
    }

    #[test]
    fn test_nion_tables_suppressed_by_turnover() {
        let config = SimulationConfig::default();
        let cosmo = Cosmology::new(&config.cosmo);
        let sc = scope(&cosmo);
        let t = ConditionalTables::build_nion(&sc, &config.astro, &config.flags, &cosmo, -0.5, 0.1)
            .unwrap();
        let acg = t.nion_acg.unwrap();
        assert!(acg.eval(0.0, 7.5) > acg.eval(0.0, 9.5));
    }

    #[test]
    fn test_sfrd_table_built_and_positive() {
        let config = SimulationConfig::default();
        let cosmo = Cosmology::new(&config.cosmo);
        let sc = scope(&cosmo);
        let t =
            ConditionalTables::build_sfrd(&sc, &config.astro, &config.flags, &cosmo).unwrap();
        let acg = t.sfrd_acg.unwrap();
        assert!(acg.eval(0.0) > 0.0);
        assert!(acg.eval(1.0) > acg.eval(-0.9));
    }

    #[test]
    fn test_fcoll_tables_for_legacy_path() {
        let config = SimulationConfig::default();
        let cosmo = Cosmology::new(&config.cosmo);
        let sc = scope(&cosmo);
        let t = ConditionalTables::build_fcoll(&sc, &cosmo).unwrap();
        let f = t.fcoll.unwrap();
        let df = t.dfcoll_dz.unwrap();
        assert!(f.eval(0.5) > f.eval(-0.5));
        assert!(df.eval(0.0) < 0.0, "collapse accumulates with time");
    }
}
